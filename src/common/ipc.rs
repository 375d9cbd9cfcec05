use crate::service::policy::{CpuSelector, MutationPolicy, Priority};
use crate::service::status::StatusBoard;
use crate::service::supervisor::Supervisor;
use log::{error, info};
use std::sync::Arc;
use zbus::{interface, proxy};

pub const BUS_NAME: &str = "com.github.procclamp";
pub const OBJECT_PATH: &str = "/com/github/procclamp";

/// D-Bus front for the supervisor, used by `procclamp start|stop|status`.
pub struct SupervisorService {
    pub supervisor: Arc<Supervisor>,
    pub board: Arc<StatusBoard>,
}

impl SupervisorService {
    pub fn new(supervisor: Arc<Supervisor>, board: Arc<StatusBoard>) -> Self {
        supervisor.set_shared_observer(board.observer());
        Self { supervisor, board }
    }

    fn status_json(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.board.snapshot())
            .map_err(|e| zbus::fdo::Error::Failed(format!("Failed to encode status: {}", e)))
    }
}

fn parse_policy(priority: &str, cpu: &str) -> zbus::fdo::Result<MutationPolicy> {
    let priority: Priority = priority
        .parse()
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{}", e)))?;
    let cpu: CpuSelector = cpu
        .parse()
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{}", e)))?;

    Ok(MutationPolicy::new(priority, cpu))
}

#[interface(name = "com.github.procclamp.Supervisor")]
impl SupervisorService {
    async fn start(&self, priority: String, cpu: String) -> zbus::fdo::Result<bool> {
        info!("Received start request (priority: {}, cpu: {})", priority, cpu);

        let policy = parse_policy(&priority, &cpu).map_err(|e| {
            error!("Rejected start request: {}", e);
            e
        })?;

        if self.supervisor.is_running() {
            return Ok(false);
        }

        self.board.clear();
        Ok(self.supervisor.start(policy))
    }

    async fn stop(&self) -> bool {
        info!("Received stop request");
        self.supervisor.stop().await
    }

    async fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        self.status_json()
    }

    async fn ping(&self) -> String {
        "pong".to_string()
    }
}

#[proxy(
    interface = "com.github.procclamp.Supervisor",
    default_service = "com.github.procclamp",
    default_path = "/com/github/procclamp"
)]
pub trait SupervisorClient {
    async fn start(&self, priority: &str, cpu: &str) -> zbus::Result<bool>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn is_running(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn ping(&self) -> zbus::Result<String>;
}

/// Connect to the bus the daemon lives on.
pub async fn connect(session: bool) -> zbus::Result<zbus::Connection> {
    if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
}
