use phf::phf_map;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scheduling priority applied to matched processes, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
}

static PRIORITY_NAMES: phf::Map<&'static str, Priority> = phf_map! {
    "idle" => Priority::Idle,
    "lowest" => Priority::Idle,
    "below_normal" => Priority::BelowNormal,
    "low" => Priority::BelowNormal,
    "normal" => Priority::Normal,
    "above_normal" => Priority::AboveNormal,
    "high" => Priority::High,
    "highest" => Priority::High,
};

impl Priority {
    /// Nice value handed to `setpriority(2)`.
    pub fn nice(&self) -> i32 {
        match self {
            Priority::Idle => 19,
            Priority::BelowNormal => 10,
            Priority::Normal => 0,
            Priority::AboveNormal => -5,
            Priority::High => -10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Idle => "idle",
            Priority::BelowNormal => "below_normal",
            Priority::Normal => "normal",
            Priority::AboveNormal => "above_normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase().replace('-', "_");
        PRIORITY_NAMES
            .get(key.as_str())
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown priority level '{}'", s))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cores a matched process is allowed to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuSelector {
    All,
    Core(usize),
    /// Falls back to the last core of the host.
    #[default]
    Unset,
}

impl CpuSelector {
    /// Resolve to concrete core indices for a host with `core_count` cores.
    ///
    /// Out-of-range indices and `Unset` both land on the last core, so the
    /// result is never empty.
    pub fn resolve(&self, core_count: usize) -> Vec<usize> {
        let core_count = core_count.max(1);
        let last = core_count - 1;

        match *self {
            CpuSelector::All => (0..core_count).collect(),
            CpuSelector::Core(idx) if idx < core_count => vec![idx],
            CpuSelector::Core(_) | CpuSelector::Unset => vec![last],
        }
    }
}

impl FromStr for CpuSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();

        match value.as_str() {
            "" | "last" => return Ok(CpuSelector::Unset),
            "all" | "all cores" | "all-cores" => return Ok(CpuSelector::All),
            _ => {}
        }

        let digits = value.strip_prefix("cpu").unwrap_or(&value).trim();
        digits
            .parse::<usize>()
            .map(CpuSelector::Core)
            .map_err(|_| anyhow::anyhow!("Invalid CPU selector '{}'", s))
    }
}

impl fmt::Display for CpuSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuSelector::All => f.write_str("all"),
            CpuSelector::Core(idx) => write!(f, "CPU {}", idx),
            CpuSelector::Unset => f.write_str("last"),
        }
    }
}

/// Priority and affinity captured by the supervisor for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationPolicy {
    pub priority: Priority,
    pub cpu: CpuSelector,
}

impl MutationPolicy {
    pub fn new(priority: Priority, cpu: CpuSelector) -> Self {
        Self { priority, cpu }
    }
}
