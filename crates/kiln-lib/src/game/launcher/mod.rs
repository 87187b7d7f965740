pub mod process;
pub mod registry;
pub mod resolver;
pub(crate) mod termination;
pub mod types;

pub use process::{OsProcessControl, ProcessControl};
pub use registry::ProcessRegistry;
pub use resolver::{ExecutableResolver, PreferredExecutableResolver};
pub use types::{
    CloseDecision, ExitReason, GameProcess, LaunchRequest, ProcessOrigin, RunningGame,
    RunningProcessRecord, StopOutcome,
};
