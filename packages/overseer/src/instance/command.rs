use serde::{Deserialize, Serialize};
use std::fmt;

use super::InstanceError;

/// Lifecycle status of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// A command that is not a plain run/stop transition is executing
    Busy,
}

impl InstanceStatus {
    /// Numeric code used by existing front ends
    pub fn code(&self) -> i8 {
        match self {
            Self::Busy => -1,
            Self::Stopped => 0,
            Self::Stopping => 1,
            Self::Starting => 2,
            Self::Running => 3,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// A unit of lifecycle work submitted to an instance.
///
/// Commands only describe what to do; the instance decides whether it can.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Start,
    /// Graceful termination, escalating to Kill after the grace period
    Stop,
    /// Forced termination from any state
    Kill,
    /// Evaluate the event task (auto start) once
    SelfCheck,
}

impl Command {
    /// Whether this command may run from `status` on a normal submission.
    /// Forced submissions skip this check but still queue.
    pub fn check(&self, status: InstanceStatus) -> Result<(), InstanceError> {
        let legal = match self {
            Command::Start => status == InstanceStatus::Stopped,
            Command::Stop => matches!(status, InstanceStatus::Running | InstanceStatus::Starting),
            Command::Kill | Command::SelfCheck => true,
        };
        if legal {
            Ok(())
        } else {
            Err(InstanceError::IllegalTransition {
                command: *self,
                status,
            })
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Kill => "kill",
            Command::SelfCheck => "self_check",
        };
        f.write_str(s)
    }
}
