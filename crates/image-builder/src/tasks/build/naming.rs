use sha2::{Digest, Sha256};

/// Pod names are capped so they stay usable as hostnames
pub const MAX_POD_NAME_LENGTH: usize = 64;
const HASH_SUFFIX_LENGTH: usize = 8;

pub struct ResourceNaming;

impl ResourceNaming {
    /// Generate a build pod name from the driver pod name and a suffix
    ///
    /// Format: `{parent}-{suffix}`. Names over the limit keep a prefix of
    /// that and end in a hash of the suffix; when even the parent does not
    /// leave room for that, the whole name is hashed.
    /// The result only depends on the inputs, so rebuilding a plan yields
    /// the same pod names.
    #[must_use]
    pub fn build_pod_name(parent: &str, suffix: &str) -> String {
        let full = format!("{parent}-{suffix}");

        if full.len() <= MAX_POD_NAME_LENGTH {
            full
        } else if parent.len() + HASH_SUFFIX_LENGTH + 1 <= MAX_POD_NAME_LENGTH {
            let keep = MAX_POD_NAME_LENGTH - HASH_SUFFIX_LENGTH - 1;
            // Cut on a char boundary so multi-byte input stays within the limit
            let cut = (0..=keep)
                .rev()
                .find(|&index| full.is_char_boundary(index))
                .unwrap_or(0);
            let prefix = &full[..cut];
            let hash = Self::hash_string(suffix);
            format!("{prefix}-{}", &hash[..HASH_SUFFIX_LENGTH])
        } else {
            Self::hash_string(&full)
        }
    }

    /// Suffix of the clone pod
    #[must_use]
    pub fn clone_suffix(repo: &str) -> String {
        format!("{repo}-clonerefs")
    }

    /// Suffix of a kaniko pod, with the variant in front of the target
    #[must_use]
    pub fn target_suffix(repo: &str, variant: Option<&str>, target: &str) -> String {
        match variant {
            Some(variant) => format!("{repo}-{variant}-{target}"),
            None => format!("{repo}-{target}"),
        }
    }

    /// Artifact file name for the logs of the build pod at `index`
    #[must_use]
    pub fn log_file_name(index: usize, pod_name: &str) -> String {
        format!("{index:03}-{pod_name}-build-log.txt")
    }

    fn hash_string(input: &str) -> String {
        hex::encode(Sha256::digest(input.as_bytes()))
    }
}
