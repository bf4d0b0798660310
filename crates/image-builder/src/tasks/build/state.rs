//! Progress of a build across reconcile ticks.
//!
//! The state is only advanced by the orchestrator while it holds the build
//! lock. Deciding what to do next is a pure function of the recorded
//! phases and the pods listed in the current tick.

use crate::tasks::build::plan::BuildPlan;
use crate::tasks::types::Result;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;

/// Lifecycle phase of a build unit, from its pod status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitPhase {
    /// Missing and `Unknown` phases count as still pending
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => UnitPhase::Running,
            Some("Succeeded") => UnitPhase::Succeeded,
            Some("Failed") => UnitPhase::Failed,
            _ => UnitPhase::Pending,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitPhase::Succeeded | UnitPhase::Failed)
    }
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitPhase::Pending => "Pending",
            UnitPhase::Running => "Running",
            UnitPhase::Succeeded => "Succeeded",
            UnitPhase::Failed => "Failed",
        })
    }
}

/// A recorded phase change of a planned unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    /// Position of the unit in the plan
    pub index: usize,
    pub from: Option<UnitPhase>,
    pub to: UnitPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Started units are still running
    Wait,
    /// Create the not yet recorded units of this group
    StartGroup(Range<usize>),
    /// The current group finished and some of its units failed
    Abort { failed: Vec<String> },
    /// Started units that are neither terminal nor present in the cluster
    Missing { units: Vec<String> },
    /// Every unit succeeded
    Complete,
}

#[derive(Debug, Default)]
pub struct BuildState {
    plan: Option<BuildPlan>,
    phases: HashMap<String, UnitPhase>,
    /// First unit of the next group to start
    cursor: usize,
    /// Units of the most recently started group
    in_flight: Range<usize>,
    error_count: u32,
    terminated: bool,
    outcome: Option<Result<()>>,
}

impl BuildState {
    #[must_use]
    pub fn plan(&self) -> Option<&BuildPlan> {
        self.plan.as_ref()
    }

    pub fn set_plan(&mut self, plan: BuildPlan) {
        self.plan = Some(plan);
    }

    #[must_use]
    pub fn phase(&self, name: &str) -> Option<UnitPhase> {
        self.phases.get(name).copied()
    }

    #[must_use]
    pub fn phases(&self) -> &HashMap<String, UnitPhase> {
        &self.phases
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Record the observed phase of a pod
    ///
    /// Returns the transition when the phase of a planned unit changed.
    /// Terminal phases are final; pods outside the plan are ignored.
    pub fn observe(&mut self, name: &str, phase: UnitPhase) -> Option<PhaseTransition> {
        let index = self.plan.as_ref()?.position(name)?;
        let from = self.phases.get(name).copied();

        match from {
            Some(current) if current == phase || current.is_terminal() => None,
            _ => {
                self.phases.insert(name.to_string(), phase);
                Some(PhaseTransition {
                    index,
                    from,
                    to: phase,
                })
            }
        }
    }

    /// Mark a group as started; its units are recorded as they get created
    pub fn begin_group(&mut self, range: Range<usize>) {
        self.cursor = self.cursor.max(range.end);
        self.in_flight = range;
    }

    /// Record a created unit as pending unless its phase is already known
    pub fn record_started(&mut self, name: &str) {
        self.phases
            .entry(name.to_string())
            .or_insert(UnitPhase::Pending);
    }

    /// Decide how to move the build forward
    ///
    /// `listed` holds the names of the build pods present in the cluster.
    #[must_use]
    pub fn next_action(&self, listed: &HashSet<String>) -> NextAction {
        let Some(plan) = &self.plan else {
            return NextAction::Wait;
        };

        let mut unstarted = false;
        let mut active = false;
        let mut failed = Vec::new();
        let mut missing = Vec::new();

        for unit in &plan.units()[self.in_flight.clone()] {
            match self.phases.get(&unit.name) {
                None => unstarted = true,
                Some(UnitPhase::Failed) => failed.push(unit.name.clone()),
                Some(UnitPhase::Succeeded) => {}
                Some(_) if listed.contains(&unit.name) => active = true,
                Some(_) => missing.push(unit.name.clone()),
            }
        }

        // Once a unit failed nothing else is created, not even the rest of
        // a partially created group
        if !failed.is_empty() {
            if active {
                NextAction::Wait
            } else {
                NextAction::Abort { failed }
            }
        } else if unstarted {
            NextAction::StartGroup(self.in_flight.clone())
        } else if active {
            NextAction::Wait
        } else if !missing.is_empty() {
            NextAction::Missing { units: missing }
        } else if self.cursor >= plan.len() {
            NextAction::Complete
        } else {
            NextAction::StartGroup(plan.group_range(self.cursor))
        }
    }

    /// Count a failed tick, returning the consecutive error count
    pub fn record_error(&mut self) -> u32 {
        self.error_count += 1;
        self.error_count
    }

    pub fn reset_errors(&mut self) {
        self.error_count = 0;
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Finish the build; only the first call takes effect
    pub fn terminate(&mut self, outcome: Result<()>) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;
        self.outcome = Some(outcome);
        true
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Hand out the outcome of a terminated build
    pub fn take_outcome(&mut self) -> Option<Result<()>> {
        self.outcome.take()
    }
}
