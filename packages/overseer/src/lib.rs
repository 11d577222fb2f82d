//! Instance orchestration engine for the overseer daemon.
//!
//! A [`registry::InstanceRegistry`] owns every supervised process. Each
//! instance runs its commands one at a time through its own queue, persists
//! its configuration through a [`storage::Store`], and streams output to
//! viewers through the [`stream::StreamMultiplexer`].

pub mod config;
pub mod instance;
pub mod registry;
pub mod storage;
pub mod stream;

pub use instance::{
    Command, InstanceConfig, InstanceConfigUpdate, InstanceError, InstanceEvent, InstanceHandle,
    InstanceStatus,
};
pub use registry::{InstanceRegistry, RegistryError, RegistryEvent};
pub use storage::{StorageError, Store};
pub use stream::{StreamChunk, StreamMultiplexer, Subscriber};
