/*
 * Image Builder - Kaniko Build Orchestration for CI Image Jobs
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Image build orchestration
//!
//! Runs next to a CI job's driver pod and builds the requested Dockerfile
//! targets with kaniko: one pod clones the repository onto a shared volume,
//! then the target builds run in sequential groups of parallel pods.

pub mod tasks;

// Re-export commonly used types
pub use tasks::build::{BuildOrchestrator, BuildPlan, BuildPlanner, TagPolicy};
pub use tasks::cluster::{ClusterApi, KubeCluster};
pub use tasks::config::{BuildOptions, ControllerConfig, JobSpec};
pub use tasks::source::{LocalSourceTree, SourceTree};
pub use tasks::types::{Error, Result};
