use crate::tasks::build::naming::ResourceNaming;
use crate::tasks::cluster::ClusterApi;
use crate::tasks::types::Result;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::compat::FuturesAsyncReadCompatExt;

/// Copy the logs of a finished build pod into the artifact directory
///
/// Returns the path of the written log file.
pub async fn collect_unit_logs(
    cluster: &dyn ClusterApi,
    artifact_directory: &Path,
    index: usize,
    pod_name: &str,
) -> Result<PathBuf> {
    let logs = cluster.stream_logs(pod_name).await?;

    tokio::fs::create_dir_all(artifact_directory).await?;
    let path = artifact_directory.join(ResourceNaming::log_file_name(index, pod_name));
    let mut file = tokio::fs::File::create(&path).await?;

    let mut reader = logs.compat();
    tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;

    Ok(path)
}
