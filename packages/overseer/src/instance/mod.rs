//! A supervised process plus its configuration, status and command queue.

mod actor;
mod command;
mod config;
mod decode;

pub use actor::InstanceHandle;
pub use command::{Command, InstanceStatus};
pub use config::{
    CONFIG_VERSION, DEFAULT_ENCODING, EventTask, INTERRUPT_STOP_COMMAND, InstanceConfig,
    InstanceConfigUpdate, is_supported_encoding,
};

use std::time::Duration;

use process_host::{ExitStatus, ProcessError};

use crate::storage::{StorageError, Store};

/// Storage category holding one record per instance
pub const INSTANCE_CONFIG_CATEGORY: &str = "InstanceConfig";

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("cannot {command} while instance is {status}")]
    IllegalTransition {
        command: Command,
        status: InstanceStatus,
    },

    #[error("instance already has a running process")]
    AlreadyRunning,

    #[error("instance is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start process: {0}")]
    Spawn(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("instance has been destroyed")]
    Gone,
}

impl InstanceError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Spawn(_) => "spawn_failed",
            Self::Storage(e) => e.error_code(),
            Self::Process(e) => e.error_code(),
            Self::Gone => "instance_gone",
        }
    }
}

/// Events emitted by one instance, in the order they happened
#[derive(Clone, Debug)]
pub enum InstanceEvent {
    /// Decoded process output
    Data(String),
    /// The process was spawned
    Open,
    /// The process ended and the instance is stopped
    Exit(ExitStatus),
    /// Something went wrong; the instance is usable and stopped
    Failure(String),
}

/// Timing knobs for lifecycle commands.
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    /// Grace period between the stop request and escalation to Kill
    pub stop_timeout: Duration,
    /// How long to wait for a killed process to be reaped
    pub kill_timeout: Duration,
    /// Delay before an auto-restart
    pub restart_delay: Duration,
    /// Per-instance event buffer
    pub event_capacity: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(3),
            event_capacity: 1024,
        }
    }
}

/// What every instance needs from the outside world
#[derive(Clone)]
pub struct InstanceContext {
    pub store: Store,
    pub lifecycle: LifecycleSettings,
}
