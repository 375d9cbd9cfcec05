pub mod inspector;
pub mod policy;
pub mod privilege;
pub mod status;
pub mod supervisor;

pub use inspector::{MutationError, ProcessHandle, ProcessInspector, ProcfsInspector};
pub use policy::{CpuSelector, MutationPolicy, Priority};
pub use status::{Outcome, StatusBoard, StatusEvent};
pub use supervisor::Supervisor;
