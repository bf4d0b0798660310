use crate::tasks::source::SourceTree;
use crate::tasks::types::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Variants file inside the build context
pub const VARIANTS_FILE: &str = "variants.yaml";

/// One flavour of an image build, with its own build arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildVariant {
    /// `None` for the implicit variant of a regular build
    pub name: Option<String>,
    pub build_args: BTreeMap<String, String>,
}

impl BuildVariant {
    /// The single unnamed variant used when no build context is configured
    #[must_use]
    pub fn implicit() -> Self {
        Self::default()
    }

    /// Kaniko `--build-arg` arguments, in key order
    #[must_use]
    pub fn build_arg_flags(&self) -> Vec<String> {
        self.build_args
            .iter()
            .map(|(arg, value)| format!("--build-arg={arg}={value}"))
            .collect()
    }
}

impl fmt::Display for BuildVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name: {} buildArgs: {:?}}}",
            self.name.as_deref().unwrap_or("<none>"),
            self.build_args
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariantsFile {
    #[serde(default)]
    variants: BTreeMap<String, BTreeMap<String, String>>,
}

/// Load the variants of a build context, keeping only `filter` if given
///
/// Variants come back sorted by name so that the build plan is stable.
pub fn load_variants(
    source: &dyn SourceTree,
    context: &str,
    filter: Option<&str>,
) -> Result<Vec<BuildVariant>> {
    let path = Path::new(context).join(VARIANTS_FILE);
    let content = source.read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ConfigError(format!("{} not found", path.display()))
        } else {
            Error::ConfigError(format!("failed to load {}: {e}", path.display()))
        }
    })?;

    let file: VariantsFile = serde_yaml::from_str(&content)
        .map_err(|e| Error::ConfigError(format!("failed reading {}: {e}", path.display())))?;

    let variants: Vec<BuildVariant> = file
        .variants
        .into_iter()
        .filter(|(name, _)| filter.map_or(true, |wanted| name.as_str() == wanted))
        .map(|(name, build_args)| BuildVariant {
            name: Some(name),
            build_args,
        })
        .collect();

    if variants.is_empty() {
        return Err(Error::ConfigError(match filter {
            Some(wanted) => format!("build variant {wanted} not found in {}", path.display()),
            None => format!("no variants defined in {}", path.display()),
        }));
    }

    Ok(variants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::source::MockSourceTree;
    use std::io;

    const VARIANTS: &str = r#"
variants:
  debian:
    BASE_IMAGE: debian:12
  alpine:
    BASE_IMAGE: alpine:3.19
    EXTRA: "yes"
"#;

    fn source_with(content: &'static str) -> MockSourceTree {
        let mut source = MockSourceTree::new();
        source
            .expect_read_to_string()
            .withf(|path| path == Path::new("images/base/variants.yaml"))
            .returning(move |_| Ok(content.to_string()));
        source
    }

    #[test]
    fn variants_sorted_by_name() {
        let variants = load_variants(&source_with(VARIANTS), "images/base", None).unwrap();
        let names: Vec<_> = variants.iter().map(|v| v.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["alpine", "debian"]);
        assert_eq!(
            variants[0].build_arg_flags(),
            vec!["--build-arg=BASE_IMAGE=alpine:3.19", "--build-arg=EXTRA=yes"]
        );
    }

    #[test]
    fn filter_keeps_single_variant() {
        let variants =
            load_variants(&source_with(VARIANTS), "images/base", Some("debian")).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].name.as_deref(), Some("debian"));
    }

    #[test]
    fn filter_without_match_is_config_error() {
        let err = load_variants(&source_with(VARIANTS), "images/base", Some("arch")).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = load_variants(&source_with("variant:\n  x: {}\n"), "images/base", None)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn missing_file_is_config_error() {
        let mut source = MockSourceTree::new();
        source
            .expect_read_to_string()
            .returning(|_| Err(io::Error::new(io::ErrorKind::NotFound, "missing")));
        let err = load_variants(&source, "images/base", None).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn implicit_variant_has_no_build_args() {
        let variant = BuildVariant::implicit();
        assert!(variant.name.is_none());
        assert!(variant.build_arg_flags().is_empty());
    }
}
