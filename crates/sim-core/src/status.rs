use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SimulationStatus {
    Created,
    CommissionRequested,
    Provisioning,
    Commissioned,
    Running,
    Retry,
    CancelRequested,
    Succeeded,
    Failed,
    Canceled,
}

impl SimulationStatus {
    pub const ALL: [SimulationStatus; 10] = [
        SimulationStatus::Created,
        SimulationStatus::CommissionRequested,
        SimulationStatus::Provisioning,
        SimulationStatus::Commissioned,
        SimulationStatus::Running,
        SimulationStatus::Retry,
        SimulationStatus::CancelRequested,
        SimulationStatus::Succeeded,
        SimulationStatus::Failed,
        SimulationStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::CommissionRequested => "CommissionRequested",
            Self::Provisioning => "Provisioning",
            Self::Commissioned => "Commissioned",
            Self::Running => "Running",
            Self::Retry => "Retry",
            Self::CancelRequested => "CancelRequested",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Statuses the backend still has to launch.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Created | Self::Retry)
    }

    // Forward progress rank among non-terminal states. Retry re-enters the
    // lifecycle at the Commissioned level.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::CommissionRequested => Some(1),
            Self::Provisioning => Some(2),
            Self::Commissioned | Self::Retry => Some(3),
            Self::Running => Some(4),
            _ => None,
        }
    }

    /// Whether `next` may replace `self` as the persisted status.
    ///
    /// Identity is always accepted so repeated refreshes are no-ops. Terminal
    /// states only leave through an explicit `Retry`; `CancelRequested` only
    /// resolves to a terminal state; the remaining states never move backwards.
    pub fn can_transition(&self, next: SimulationStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return next == Self::Retry;
        }
        if *self == Self::CancelRequested {
            return next.is_terminal();
        }
        if next.is_terminal() || next == Self::CancelRequested || next == Self::Retry {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(cur), Some(nxt)) => nxt >= cur,
            _ => false,
        }
    }

    /// Parses a status word, accepting the legacy `Waiting` alias.
    pub fn parse_wire(raw: &str) -> Option<Self> {
        match raw.trim() {
            "Waiting" | "None" => Some(Self::Created),
            other => other.parse().ok(),
        }
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimulationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|st| st.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown simulation status: {}", s))
    }
}

/// An experiment is done iff every owned simulation is terminal. An
/// experiment without simulations is not done; there is nothing to analyze.
pub fn all_terminal<'a, I>(statuses: I) -> bool
where
    I: IntoIterator<Item = &'a SimulationStatus>,
{
    let mut any = false;
    for st in statuses {
        if !st.is_terminal() {
            return false;
        }
        any = true;
    }
    any
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts(pub BTreeMap<SimulationStatus, usize>);

impl StatusCounts {
    pub fn from_statuses<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a SimulationStatus>,
    {
        let mut counts = BTreeMap::new();
        for st in statuses {
            *counts.entry(*st).or_insert(0) += 1;
        }
        Self(counts)
    }

    pub fn get(&self, status: SimulationStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn terminal(&self) -> usize {
        self.0
            .iter()
            .filter(|(st, _)| st.is_terminal())
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn is_done(&self) -> bool {
        self.total() > 0 && self.terminal() == self.total()
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|(st, n)| format!("{}: {}", st, n))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(", "))
    }
}
