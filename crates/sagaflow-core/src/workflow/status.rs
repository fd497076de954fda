use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a workflow run.
///
/// ```text
/// pending -> running -> succeeded
///                    -> compensating -> failed
///                                    -> compensation_failed
///                    -> failed            (nothing had completed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is created but not started.
    Pending,
    /// Forward steps are executing.
    Running,
    /// Every node completed and the response was computed.
    Succeeded,
    /// A step failed and completed steps are being undone.
    Compensating,
    /// The run failed; every completed step was compensated.
    Failed,
    /// A compensation failed; rollback stopped and needs an operator.
    CompensationFailed,
}

impl RunStatus {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Compensating => "compensating",
            Self::Failed => "failed",
            Self::CompensationFailed => "compensation_failed",
        }
    }

    /// Check if the run is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::CompensationFailed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Compensating)
                | (Running, Failed)
                | (Compensating, Compensating)
                | (Compensating, Failed)
                | (Compensating, CompensationFailed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "compensating" => Ok(Self::Compensating),
            "failed" => Ok(Self::Failed),
            "compensation_failed" => Ok(Self::CompensationFailed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}
