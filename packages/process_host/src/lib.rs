//! Process Host - child process lifecycle for supervised instances
//!
//! Spawns a configured command with piped stdio, streams its output as ordered
//! events, delivers signals to its process group and reports how it exited.
//! It knows nothing about instances, persistence or viewers.
//!
//! # Example
//!
//! ```no_run
//! use process_host::{ProcessActor, ProcessConfig, ProcessEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ProcessConfig::from_command_line("echo hello", Some("/tmp".into())).unwrap();
//!     let (handle, mut events) = ProcessActor::spawn(config).unwrap();
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             ProcessEvent::Output(output) => {
//!                 print!("{}", String::from_utf8_lossy(&output.data));
//!             }
//!             ProcessEvent::Exited(status) => {
//!                 println!("exited: {}", status);
//!                 break;
//!             }
//!         }
//!     }
//!     drop(handle);
//! }
//! ```

mod error;
pub mod process;

pub use error::ProcessError;
pub use process::{
    ExitStatus, OutputStream, ProcessActor, ProcessConfig, ProcessEvent, ProcessHandle,
    ProcessOutput, ProcessSignal, ProcessState,
};
