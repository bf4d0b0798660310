//! Image destinations for build targets.
//!
//! Every enabled tagging scheme contributes one `<registry>/<target>:<tag>`
//! destination. Variant builds use their own fixed scheme instead.

use crate::tasks::source::SourceTree;
use crate::tasks::types::{Error, Result};
use chrono::NaiveDate;
use std::path::Path;

/// Version file at the root of the repository
pub const VERSION_FILE: &str = "VERSION";
/// Build argument carrying `<version>-<short sha>`
pub const EFFECTIVE_VERSION_ARG: &str = "EFFECTIVE_VERSION";

const SHORT_SHA_LENGTH: usize = 7;

/// Enabled tagging schemes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPolicy {
    /// `<version>`
    pub version_tag: bool,
    /// `<version>-<short sha>`
    pub version_sha_tag: bool,
    /// `vYYYYMMDD-<short sha>`
    pub date_sha_tag: bool,
    /// `<prefix>-vYYYYMMDD-<short sha>`
    pub date_sha_tag_prefixes: Vec<String>,
    /// `vYYYYMMDD-<short sha>-<suffix>`
    pub date_sha_tag_suffixes: Vec<String>,
    /// Literal tags
    pub fixed_tags: Vec<String>,
    /// Pass `EFFECTIVE_VERSION=<version>-<short sha>` as a build argument
    pub inject_effective_version: bool,
}

impl TagPolicy {
    fn any_destination_scheme(&self) -> bool {
        self.version_tag
            || self.version_sha_tag
            || self.date_sha_tag
            || !self.date_sha_tag_prefixes.is_empty()
            || !self.date_sha_tag_suffixes.is_empty()
            || !self.fixed_tags.is_empty()
    }

    fn needs_version(&self) -> bool {
        self.version_tag || self.version_sha_tag || self.inject_effective_version
    }

    /// Check the schemes fit the build mode
    ///
    /// Variant builds are always tagged per variant, so the generic schemes
    /// must be off. Regular builds need at least one of them.
    pub fn validate(&self, variant_mode: bool) -> Result<()> {
        if variant_mode {
            if self.any_destination_scheme() || self.inject_effective_version {
                return Err(Error::ConfigError(
                    "tagging options cannot be combined with a build context; variant builds are tagged per variant".to_string(),
                ));
            }
        } else if !self.any_destination_scheme() {
            return Err(Error::ConfigError(
                "please choose at least one tagging scheme".to_string(),
            ));
        }
        Ok(())
    }
}

/// Version metadata tags are derived from
pub struct VersionContext<'a> {
    /// Full commit SHA
    pub head_sha: &'a str,
    /// Build date used in date tags
    pub date: NaiveDate,
    /// Checked-out repository, for the version file
    pub source: &'a dyn SourceTree,
}

impl VersionContext<'_> {
    /// First seven characters of the head SHA
    pub fn short_sha(&self) -> Result<&str> {
        if self.head_sha.len() < SHORT_SHA_LENGTH || !self.head_sha.is_ascii() {
            return Err(Error::InvalidSha {
                sha: self.head_sha.to_string(),
            });
        }
        Ok(&self.head_sha[..SHORT_SHA_LENGTH])
    }

    /// First non-empty line of the version file
    pub fn version(&self) -> Result<String> {
        let path = Path::new(VERSION_FILE);
        let content = self
            .source
            .read_to_string(path)
            .map_err(|source| Error::VersionFileRead {
                path: path.to_path_buf(),
                source,
            })?;

        content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::EmptyVersionFile {
                path: path.to_path_buf(),
            })
    }

    fn date_stamp(&self) -> String {
        format!("v{}", self.date.format("%Y%m%d"))
    }
}

/// Resolved destinations of one build target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destinations {
    /// `<registry>/<target>:<tag>` references
    pub images: Vec<String>,
    /// Build arguments computed alongside the tags
    pub build_args: Vec<(String, String)>,
}

impl Destinations {
    /// Kaniko `--destination` arguments
    #[must_use]
    pub fn destination_args(&self) -> Vec<String> {
        self.images
            .iter()
            .map(|image| format!("--destination={image}"))
            .collect()
    }
}

pub struct DestinationResolver<'a> {
    registry: &'a str,
    policy: &'a TagPolicy,
    context: VersionContext<'a>,
}

impl<'a> DestinationResolver<'a> {
    #[must_use]
    pub fn new(registry: &'a str, policy: &'a TagPolicy, context: VersionContext<'a>) -> Self {
        Self {
            registry,
            policy,
            context,
        }
    }

    fn image(&self, target: &str, tag: &str) -> String {
        format!("{}/{target}:{tag}", self.registry)
    }

    /// Destinations of a regular build target
    pub fn resolve(&self, target: &str) -> Result<Destinations> {
        let policy = self.policy;
        let mut destinations = Destinations::default();

        if policy.needs_version() {
            let version = self.context.version()?;

            if policy.version_tag {
                destinations.images.push(self.image(target, &version));
            }

            if policy.version_sha_tag || policy.inject_effective_version {
                let effective_version = format!("{version}-{}", self.context.short_sha()?);
                if policy.version_sha_tag {
                    destinations
                        .images
                        .push(self.image(target, &effective_version));
                }
                if policy.inject_effective_version {
                    destinations
                        .build_args
                        .push((EFFECTIVE_VERSION_ARG.to_string(), effective_version));
                }
            }
        }

        let dated = !policy.date_sha_tag_prefixes.is_empty()
            || !policy.date_sha_tag_suffixes.is_empty()
            || policy.date_sha_tag;
        if dated {
            let date_sha = format!("{}-{}", self.context.date_stamp(), self.context.short_sha()?);

            if policy.date_sha_tag {
                destinations.images.push(self.image(target, &date_sha));
            }
            for prefix in &policy.date_sha_tag_prefixes {
                destinations
                    .images
                    .push(self.image(target, &format!("{prefix}-{date_sha}")));
            }
            for suffix in &policy.date_sha_tag_suffixes {
                destinations
                    .images
                    .push(self.image(target, &format!("{date_sha}-{suffix}")));
            }
        }

        for tag in &policy.fixed_tags {
            destinations.images.push(self.image(target, tag));
        }

        Ok(destinations)
    }

    /// Destinations of a variant build target
    pub fn resolve_variant(&self, target: &str, variant: &str) -> Result<Destinations> {
        let tag = format!(
            "{variant}-{}-{}",
            self.context.date_stamp(),
            self.context.short_sha()?
        );

        Ok(Destinations {
            images: vec![self.image(target, &tag), self.image(target, variant)],
            build_args: Vec::new(),
        })
    }
}
