use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Result of one step of checking a target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NotFound,
    Found,
    PrioritySuccess,
    PriorityFailed,
    AffinitySuccess,
    AffinityFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::NotFound => "not_found",
            Outcome::Found => "found",
            Outcome::PrioritySuccess => "priority_success",
            Outcome::PriorityFailed => "priority_failed",
            Outcome::AffinitySuccess => "affinity_success",
            Outcome::AffinityFailed => "affinity_failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::PriorityFailed | Outcome::AffinityFailed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub name: String,
    /// Absent for `NotFound`.
    pub pid: Option<u32>,
    pub outcome: Outcome,
    /// Sequence number of the check that produced the event.
    #[serde(default)]
    pub cycle: u64,
}

impl StatusEvent {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            outcome: Outcome::NotFound,
            cycle: 0,
        }
    }

    pub fn for_process(name: impl Into<String>, pid: u32, outcome: Outcome) -> Self {
        Self {
            name: name.into(),
            pid: Some(pid),
            outcome,
            cycle: 0,
        }
    }

    pub fn in_cycle(mut self, cycle: u64) -> Self {
        self.cycle = cycle;
        self
    }
}

/// Callback invoked inline from the supervision task for every event.
pub type Observer = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub pid: u32,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Last outcome per name. With several PIDs behind one name the last
    /// processed PID wins.
    pub names: BTreeMap<String, Outcome>,
    pub processes: Vec<ProcessStatus>,
}

/// Observer that remembers the latest outcomes for later queries.
///
/// Per-process entries only live as long as the check that reported them:
/// the first event for a name from a newer cycle drops that name's PIDs
/// from older cycles.
#[derive(Default)]
pub struct StatusBoard {
    by_name: Mutex<BTreeMap<String, Outcome>>,
    by_process: Mutex<BTreeMap<(String, u32), (Outcome, u64)>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &StatusEvent) {
        if let Ok(mut names) = self.by_name.lock() {
            names.insert(event.name.clone(), event.outcome);
        }

        if let Ok(mut processes) = self.by_process.lock() {
            match event.pid {
                Some(pid) => {
                    processes.retain(|(name, _), (_, cycle)| {
                        name != &event.name || *cycle >= event.cycle
                    });
                    processes.insert((event.name.clone(), pid), (event.outcome, event.cycle));
                }
                None => processes.retain(|(name, _), _| name != &event.name),
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut names) = self.by_name.lock() {
            names.clear();
        }
        if let Ok(mut processes) = self.by_process.lock() {
            processes.clear();
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let names = self
            .by_name
            .lock()
            .map(|names| names.clone())
            .unwrap_or_default();

        let processes = self
            .by_process
            .lock()
            .map(|processes| {
                processes
                    .iter()
                    .map(|((name, pid), (outcome, _))| ProcessStatus {
                        name: name.clone(),
                        pid: *pid,
                        outcome: *outcome,
                    })
                    .collect()
            })
            .unwrap_or_default();

        StatusSnapshot { names, processes }
    }

    /// Wrap the board as a supervisor observer.
    pub fn observer(self: &Arc<Self>) -> Observer {
        let board = Arc::clone(self);
        Arc::new(move |event: &StatusEvent| board.record(event))
    }
}
