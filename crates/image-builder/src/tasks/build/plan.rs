//! Build plan: every pod of a build, in execution order.
//!
//! Units are grouped; a group only starts once every unit of the previous
//! group has finished. The clone group always comes first. With caching
//! enabled the first target of the first variant forms its own group so
//! that it can fill the layer cache for everything after it.

use crate::tasks::build::naming::ResourceNaming;
use crate::tasks::build::resources::BuildResources;
use crate::tasks::build::tags::{DestinationResolver, VersionContext};
use crate::tasks::build::variants::{load_variants, BuildVariant};
use crate::tasks::config::{BuildOptions, ControllerConfig};
use crate::tasks::source::SourceTree;
use crate::tasks::types::{Error, Result};
use chrono::NaiveDate;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::fmt;
use std::ops::Range;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildGroup {
    /// Repository checkout onto the shared volume
    Clone,
    /// Cache-filling build, alone in its group
    CreateCache(Option<String>),
    /// Builds running side by side, one group per variant
    ParallelBuild(Option<String>),
}

impl fmt::Display for BuildGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, variant) = match self {
            BuildGroup::Clone => return f.write_str("clone"),
            BuildGroup::CreateCache(variant) => ("createCache", variant),
            BuildGroup::ParallelBuild(variant) => ("parallelBuild", variant),
        };
        match variant {
            Some(variant) => write!(f, "{label}-{variant}"),
            None => f.write_str(label),
        }
    }
}

/// One pod of the build
#[derive(Debug, Clone)]
pub struct BuildUnit {
    pub name: String,
    pub group: BuildGroup,
    pub pod: Pod,
}

#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    units: Vec<BuildUnit>,
}

impl BuildPlan {
    #[must_use]
    pub fn units(&self) -> &[BuildUnit] {
        &self.units
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Position of the unit named `name`
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.units.iter().position(|unit| unit.name == name)
    }

    /// The group starting at `start`, as a range of unit positions
    #[must_use]
    pub fn group_range(&self, start: usize) -> Range<usize> {
        let Some(first) = self.units.get(start) else {
            return start..start;
        };
        let len = self.units[start..]
            .iter()
            .take_while(|unit| unit.group == first.group)
            .count();
        start..start + len
    }

    /// Groups in execution order
    #[must_use]
    pub fn groups(&self) -> Vec<(BuildGroup, Range<usize>)> {
        let mut groups = Vec::new();
        let mut start = 0;
        while start < self.units.len() {
            let range = self.group_range(start);
            groups.push((self.units[start].group.clone(), range.clone()));
            start = range.end;
        }
        groups
    }
}

/// Derives the build plan from the options and the driver pod
pub struct BuildPlanner<'a> {
    options: &'a BuildOptions,
    config: &'a ControllerConfig,
    source: &'a dyn SourceTree,
    date: NaiveDate,
}

impl<'a> BuildPlanner<'a> {
    #[must_use]
    pub fn new(
        options: &'a BuildOptions,
        config: &'a ControllerConfig,
        source: &'a dyn SourceTree,
        date: NaiveDate,
    ) -> Self {
        Self {
            options,
            config,
            source,
            date,
        }
    }

    pub fn build(&self, driver: &Pod) -> Result<BuildPlan> {
        let options = self.options;
        if options.targets.is_empty() {
            return Err(Error::ConfigError(
                "specify at least one \"target\"".to_string(),
            ));
        }

        let variants = match &options.context {
            Some(context) => {
                load_variants(self.source, context, options.build_variant.as_deref())?
            }
            None => vec![BuildVariant::implicit()],
        };

        let resources = BuildResources::new(driver, options, self.config);
        let parent = driver.name_any();
        let mut units = Vec::with_capacity(1 + variants.len() * options.targets.len());

        let clone_name =
            ResourceNaming::build_pod_name(&parent, &ResourceNaming::clone_suffix(&options.repo));
        units.push(BuildUnit {
            pod: resources.clone_pod(&clone_name)?,
            name: clone_name,
            group: BuildGroup::Clone,
        });

        let resolver = DestinationResolver::new(
            &options.registry,
            &options.tags,
            VersionContext {
                head_sha: &options.head_sha,
                date: self.date,
                source: self.source,
            },
        );

        for (variant_index, variant) in variants.iter().enumerate() {
            for (target_index, target) in options.targets.iter().enumerate() {
                let group = if options.caching_enabled() && variant_index == 0 && target_index == 0
                {
                    BuildGroup::CreateCache(variant.name.clone())
                } else {
                    BuildGroup::ParallelBuild(variant.name.clone())
                };

                let name = ResourceNaming::build_pod_name(
                    &parent,
                    &ResourceNaming::target_suffix(
                        &options.repo,
                        variant.name.as_deref(),
                        target,
                    ),
                );
                let args = self.kaniko_args(&resolver, variant, target)?;
                debug!(pod = %name, %group, %variant, args = ?args, "Defined build pod");

                units.push(BuildUnit {
                    pod: resources.kaniko_pod(&name, args),
                    name,
                    group,
                });
            }
        }

        Ok(BuildPlan { units })
    }

    fn kaniko_args(
        &self,
        resolver: &DestinationResolver<'_>,
        variant: &BuildVariant,
        target: &str,
    ) -> Result<Vec<String>> {
        let options = self.options;

        let dockerfile = match &options.context {
            Some(context) => format!("{context}/{}", options.dockerfile),
            None => options.dockerfile.clone(),
        };

        let destinations = match &variant.name {
            Some(variant) => resolver.resolve_variant(target, variant)?,
            None => resolver.resolve(target)?,
        };

        let mut args = BuildResources::kaniko_base_args(&dockerfile, target);
        args.extend(destinations.destination_args());
        args.extend(options.kaniko_args.iter().cloned());
        args.extend(variant.build_arg_flags());
        args.extend(
            destinations
                .build_args
                .iter()
                .map(|(arg, value)| format!("--build-arg={arg}={value}")),
        );

        if let Some(cache_registry) = &options.cache_registry {
            args.push("--cache=true".to_string());
            args.push(format!("--cache-repo={cache_registry}"));
        }

        Ok(args)
    }
}
