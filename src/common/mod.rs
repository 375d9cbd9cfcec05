pub mod audit;
pub mod config;
pub mod ipc;
pub mod logging;

pub use audit::AuditLog;
pub use config::{ConfigStore, TargetSource, TargetSpec};
pub use ipc::{SupervisorClientProxy, SupervisorService};
