pub mod controller;
pub mod logs;
pub mod naming;
pub mod plan;
pub mod resources;
pub mod state;
pub mod tags;
pub mod variants;

pub use controller::{BuildOrchestrator, BuildSnapshot};
pub use naming::ResourceNaming;
pub use plan::{BuildGroup, BuildPlan, BuildPlanner, BuildUnit};
pub use state::UnitPhase;
pub use tags::TagPolicy;
