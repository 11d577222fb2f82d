use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProcessError;

const READ_BUFFER_SIZE: usize = 4096;
const EVENT_CAPACITY: usize = 1024;
/// How long to wait for stdout/stderr EOF once the child has been reaped.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for spawning a child process
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

impl ProcessConfig {
    /// Build a config from a user-supplied command line.
    ///
    /// A bare program name runs directly; anything with arguments or shell
    /// syntax is handed to the platform shell so that quoting, pipes and
    /// `cd x && ./run` style lines behave the way users expect.
    pub fn from_command_line(
        command_line: &str,
        working_dir: Option<PathBuf>,
    ) -> Result<Self, ProcessError> {
        let command_line = command_line.trim();
        if command_line.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let (program, args) = if command_line.contains(char::is_whitespace) {
            shell_invocation(command_line)
        } else {
            (command_line.to_string(), Vec::new())
        };

        Ok(Self {
            program,
            args,
            working_dir,
            env: Vec::new(),
        })
    }
}

#[cfg(unix)]
fn shell_invocation(command_line: &str) -> (String, Vec<String>) {
    (
        "/bin/sh".to_string(),
        vec!["-c".to_string(), command_line.to_string()],
    )
}

#[cfg(not(unix))]
fn shell_invocation(command_line: &str) -> (String, Vec<String>) {
    (
        "cmd".to_string(),
        vec!["/C".to_string(), command_line.to_string()],
    )
}

/// State of a child process
#[derive(Clone, Debug)]
pub struct ProcessState {
    pub running: bool,
    pub pid: Option<u32>,
    pub program: String,
    pub args: Vec<String>,
    /// Unix timestamp (millis) of the spawn
    pub started_at: i64,
}

/// Which pipe a chunk of output came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A chunk of output from a child process
#[derive(Clone, Debug)]
pub struct ProcessOutput {
    pub stream: OutputStream,
    pub data: Vec<u8>,
    pub timestamp: i64,
}

/// How a child process ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Events emitted by a child process, in the order they happened.
/// `Exited` is always the last event and follows all output.
#[derive(Clone, Debug)]
pub enum ProcessEvent {
    Output(ProcessOutput),
    Exited(ExitStatus),
}

/// Signals that can be delivered to a child's process group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Kill,
}

/// Messages that can be sent to the process actor
pub(crate) enum ProcessMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, ProcessError>>,
    },
    Signal {
        signal: ProcessSignal,
        respond_to: oneshot::Sender<Result<(), ProcessError>>,
    },
    GetState {
        respond_to: oneshot::Sender<ProcessState>,
    },
}

/// Handle to communicate with a process actor
#[derive(Clone)]
pub struct ProcessHandle {
    sender: mpsc::Sender<ProcessMessage>,
    events_tx: broadcast::Sender<ProcessEvent>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Write data to the child's stdin
    pub async fn write(&self, data: &[u8]) -> Result<usize, ProcessError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ProcessError::ProcessExited)?;
        rx.await.map_err(|_| ProcessError::ProcessExited)?
    }

    /// Write a string to the child's stdin
    pub async fn write_str(&self, text: &str) -> Result<usize, ProcessError> {
        self.write(text.as_bytes()).await
    }

    /// Deliver a signal to the child's process group
    pub async fn signal(&self, signal: ProcessSignal) -> Result<(), ProcessError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessMessage::Signal {
                signal,
                respond_to: tx,
            })
            .await
            .map_err(|_| ProcessError::ProcessExited)?;
        rx.await.map_err(|_| ProcessError::ProcessExited)?
    }

    /// Get the current state of the child
    pub async fn state(&self) -> Result<ProcessState, ProcessError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| ProcessError::ProcessExited)?;
        rx.await.map_err(|_| ProcessError::ProcessExited)
    }

    /// Subscribe to events produced from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events_tx.subscribe()
    }

    /// Wait until the child has been reaped
    pub async fn wait(&self) -> ExitStatus {
        let mut exit_rx = self.exit_rx.clone();
        match exit_rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or_default(),
            Err(_) => ExitStatus::default(),
        }
    }

    /// Exit status, if the child has already been reaped
    pub fn try_wait(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

enum Step {
    Message(Option<ProcessMessage>),
    Exited(std::io::Result<std::process::ExitStatus>),
}

/// The actor that owns a single child process
pub struct ProcessActor {
    child: Child,
    stdin: Option<ChildStdin>,
    state: ProcessState,
    receiver: mpsc::Receiver<ProcessMessage>,
    events_tx: broadcast::Sender<ProcessEvent>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    readers: Vec<JoinHandle<()>>,
    detached: bool,
}

impl ProcessActor {
    /// Spawn a child and return a handle plus a receiver that is guaranteed
    /// to observe every event, including output produced before the caller
    /// had a chance to subscribe.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: ProcessConfig,
    ) -> Result<(ProcessHandle, broadcast::Receiver<ProcessEvent>), ProcessError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            debug!("Setting working directory: {}", dir.display());
            cmd.current_dir(dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        // Own process group so signals reach everything the command forks
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            "Spawning process: {} with args: {:?}",
            config.program, config.args
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.program, e);
            ProcessError::SpawnFailed(e.to_string())
        })?;

        let pid = child.id();
        info!("Process started with PID: {:?}", pid);

        let (events_tx, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, events_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, events_tx.clone()));
        }

        let actor = Self {
            stdin: child.stdin.take(),
            child,
            state: ProcessState {
                running: true,
                pid,
                program: config.program.clone(),
                args: config.args.clone(),
                started_at: chrono::Utc::now().timestamp_millis(),
            },
            receiver: msg_rx,
            events_tx: events_tx.clone(),
            exit_tx,
            readers,
            detached: false,
        };

        tokio::spawn(actor.run());

        Ok((
            ProcessHandle {
                sender: msg_tx,
                events_tx,
                exit_rx,
                pid,
            },
            events_rx,
        ))
    }

    async fn run(mut self) {
        debug!("Process actor started for PID {:?}", self.state.pid);

        let status = loop {
            let step = tokio::select! {
                msg = self.receiver.recv(), if !self.detached => Step::Message(msg),
                status = self.child.wait() => Step::Exited(status),
            };

            match step {
                Step::Message(Some(msg)) => self.handle_message(msg).await,
                Step::Message(None) => {
                    // Every handle is gone; nobody can ever stop this child
                    warn!(
                        "All handles dropped for PID {:?}, killing process",
                        self.state.pid
                    );
                    self.detached = true;
                    if let Err(e) = self.handle_signal(ProcessSignal::Kill) {
                        warn!("Failed to kill detached process: {}", e);
                    }
                }
                Step::Exited(Ok(status)) => break ExitStatus::from(status),
                Step::Exited(Err(e)) => {
                    error!("Failed to wait for process: {}", e);
                    break ExitStatus::default();
                }
            }
        };

        info!("Process {:?} exited with {}", self.state.pid, status);
        self.state.running = false;
        self.stdin = None;

        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                debug!("Output pipe still held open after exit, abandoning reader");
                reader.abort();
            }
        }

        let _ = self.events_tx.send(ProcessEvent::Exited(status));
        self.exit_tx.send_replace(Some(status));

        debug!("Process actor shutting down");
    }

    async fn handle_message(&mut self, msg: ProcessMessage) {
        match msg {
            ProcessMessage::WriteInput { data, respond_to } => {
                let result = self.handle_write_input(&data).await;
                let _ = respond_to.send(result);
            }
            ProcessMessage::Signal { signal, respond_to } => {
                let _ = respond_to.send(self.handle_signal(signal));
            }
            ProcessMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state.clone());
            }
        }
    }

    async fn handle_write_input(&mut self, data: &[u8]) -> Result<usize, ProcessError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ProcessError::WriteFailed("stdin is closed".into()))?;

        stdin
            .write_all(data)
            .await
            .map_err(|e| ProcessError::WriteFailed(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProcessError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    #[cfg(unix)]
    fn handle_signal(&mut self, signal: ProcessSignal) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pid = self.state.pid.ok_or(ProcessError::ProcessExited)?;
        let sig = match signal {
            ProcessSignal::Interrupt => Signal::SIGINT,
            ProcessSignal::Terminate => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
        };

        debug!("Sending {} to process group {}", sig, pid);
        match killpg(Pid::from_raw(pid as i32), sig) {
            // Group already gone; the reaper will pick up the exit
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::SignalFailed(e.to_string())),
        }
    }

    #[cfg(not(unix))]
    fn handle_signal(&mut self, _signal: ProcessSignal) -> Result<(), ProcessError> {
        self.child
            .start_kill()
            .map_err(|e| ProcessError::SignalFailed(e.to_string()))
    }
}

fn spawn_reader<R>(
    mut reader: R,
    stream: OutputStream,
    events_tx: broadcast::Sender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    let output = ProcessOutput {
                        stream,
                        data: buffer[..n].to_vec(),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    let _ = events_tx.send(ProcessEvent::Output(output));
                }
                Err(e) => {
                    warn!("Error reading process {}: {}", stream, e);
                    break;
                }
            }
        }
        debug!("{} reader exiting", stream);
    })
}
