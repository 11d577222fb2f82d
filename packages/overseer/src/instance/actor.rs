use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use process_host::{ExitStatus, ProcessActor, ProcessEvent, ProcessHandle, ProcessSignal};

use super::decode::OutputDecoders;
use super::{
    Command, INSTANCE_CONFIG_CATEGORY, InstanceConfig, InstanceConfigUpdate, InstanceContext,
    InstanceError, InstanceEvent, InstanceStatus, is_supported_encoding,
};

const QUEUE_CAPACITY: usize = 32;

/// Messages that can be sent to an instance actor
enum InstanceMessage {
    Exec {
        command: Command,
        forced: bool,
        respond_to: oneshot::Sender<Result<(), InstanceError>>,
    },
    /// Fired by the restart timer after an unexpected exit
    ScheduledRestart,
    UpdateConfig {
        update: InstanceConfigUpdate,
        respond_to: oneshot::Sender<Result<InstanceConfig, InstanceError>>,
    },
    WriteInput {
        text: String,
        respond_to: oneshot::Sender<Result<usize, InstanceError>>,
    },
    Persist {
        respond_to: oneshot::Sender<Result<(), InstanceError>>,
    },
    Destroy {
        respond_to: oneshot::Sender<()>,
    },
}

/// State readable without going through the queue
struct InstanceShared {
    id: String,
    config: RwLock<InstanceConfig>,
    status: watch::Sender<InstanceStatus>,
    events: broadcast::Sender<InstanceEvent>,
    /// Cut short any grace period; set once at daemon shutdown
    halt: CancellationToken,
}

impl InstanceShared {
    fn emit(&self, event: InstanceEvent) {
        // No subscribers is fine; events are not buffered for late joiners
        let _ = self.events.send(event);
    }
}

/// Handle to communicate with an instance actor. Cheap to clone.
#[derive(Clone)]
pub struct InstanceHandle {
    sender: mpsc::Sender<InstanceMessage>,
    shared: Arc<InstanceShared>,
}

impl InstanceHandle {
    /// Materialize an instance in the `Stopped` state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: InstanceConfig, ctx: InstanceContext) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(ctx.lifecycle.event_capacity.max(1));
        let (status, _) = watch::channel(InstanceStatus::Stopped);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(InstanceShared {
            id: config.id.clone(),
            config: RwLock::new(config),
            status,
            events,
            halt: CancellationToken::new(),
        });

        let actor = InstanceActor {
            shared: shared.clone(),
            ctx,
            receiver,
            self_tx: sender.downgrade(),
            exit_tx,
            exit_rx,
            process: None,
            generation: 0,
            cancel: CancellationToken::new(),
        };
        tokio::spawn(actor.run());

        Self { sender, shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn status(&self) -> InstanceStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<InstanceStatus> {
        self.shared.status.subscribe()
    }

    pub async fn config(&self) -> InstanceConfig {
        self.shared.config.read().await.clone()
    }

    pub async fn display_name(&self) -> String {
        self.shared.config.read().await.display_name.clone()
    }

    /// Subscribe to events produced from now on
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.shared.events.subscribe()
    }

    /// Submit a command and wait for it to finish executing.
    ///
    /// Commands that are illegal in the current status are rejected here,
    /// before they reach the queue.
    pub async fn exec(&self, command: Command) -> Result<(), InstanceError> {
        command.check(self.status())?;
        self.submit(command, false).await
    }

    /// Submit a command without the legality check. Still queued behind
    /// whatever is executing.
    pub async fn force_exec(&self, command: Command) -> Result<(), InstanceError> {
        self.submit(command, true).await
    }

    /// Make an in-flight or future Stop skip the rest of its grace period
    /// and kill right away. Bypasses the queue and cannot be undone.
    pub fn halt(&self) {
        self.shared.halt.cancel();
    }

    /// Dispatch the self-check once
    pub async fn arm_self_check(&self) -> Result<(), InstanceError> {
        self.force_exec(Command::SelfCheck).await
    }

    async fn submit(&self, command: Command, forced: bool) -> Result<(), InstanceError> {
        self.request(|respond_to| InstanceMessage::Exec {
            command,
            forced,
            respond_to,
        })
        .await?
    }

    /// Apply a partial update and persist the result
    pub async fn update_config(
        &self,
        update: InstanceConfigUpdate,
    ) -> Result<InstanceConfig, InstanceError> {
        self.request(|respond_to| InstanceMessage::UpdateConfig { update, respond_to })
            .await?
    }

    /// Write text to the running process's stdin
    pub async fn write_input(&self, text: &str) -> Result<usize, InstanceError> {
        let text = text.to_string();
        self.request(|respond_to| InstanceMessage::WriteInput { text, respond_to })
            .await?
    }

    pub async fn persist(&self) -> Result<(), InstanceError> {
        self.request(|respond_to| InstanceMessage::Persist { respond_to })
            .await?
    }

    /// Kill the process if any and stop the actor. Persistence is untouched.
    pub async fn destroy(&self) {
        if let Err(e) = self
            .request(|respond_to| InstanceMessage::Destroy { respond_to })
            .await
        {
            debug!("Instance {} already destroyed: {}", self.shared.id, e);
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> InstanceMessage,
    ) -> Result<T, InstanceError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| InstanceError::Gone)?;
        rx.await.map_err(|_| InstanceError::Gone)
    }
}

struct RunningProcess {
    handle: ProcessHandle,
    /// Resolves once the process has exited and all of its output is out
    pump: JoinHandle<Option<ExitStatus>>,
    generation: u64,
}

/// The actor that owns one instance's process and executes its commands
struct InstanceActor {
    shared: Arc<InstanceShared>,
    ctx: InstanceContext,
    receiver: mpsc::Receiver<InstanceMessage>,
    self_tx: mpsc::WeakSender<InstanceMessage>,
    exit_tx: mpsc::UnboundedSender<u64>,
    exit_rx: mpsc::UnboundedReceiver<u64>,
    process: Option<RunningProcess>,
    generation: u64,
    /// Cancels pending restart timers on destroy
    cancel: CancellationToken,
}

impl InstanceActor {
    async fn run(mut self) {
        debug!("Instance actor {} started", self.shared.id);

        loop {
            tokio::select! {
                msg = self.receiver.recv() => {
                    let Some(msg) = msg else {
                        self.shutdown().await;
                        break;
                    };
                    if self.handle_message(msg).await.is_break() {
                        break;
                    }
                }
                Some(generation) = self.exit_rx.recv() => {
                    self.on_process_exit(generation).await;
                }
            }
        }

        debug!("Instance actor {} stopped", self.shared.id);
    }

    async fn handle_message(&mut self, msg: InstanceMessage) -> ControlFlow<()> {
        match msg {
            InstanceMessage::Exec {
                command,
                forced,
                respond_to,
            } => {
                let _ = respond_to.send(self.exec(command, forced).await);
            }
            InstanceMessage::ScheduledRestart => self.scheduled_restart().await,
            InstanceMessage::UpdateConfig { update, respond_to } => {
                let _ = respond_to.send(self.update_config(update).await);
            }
            InstanceMessage::WriteInput { text, respond_to } => {
                let _ = respond_to.send(self.write_input(&text).await);
            }
            InstanceMessage::Persist { respond_to } => {
                let _ = respond_to.send(self.persist().await);
            }
            InstanceMessage::Destroy { respond_to } => {
                self.shutdown().await;
                let _ = respond_to.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> InstanceStatus {
        *self.shared.status.borrow()
    }

    fn set_status(&self, status: InstanceStatus) {
        let previous = self.shared.status.send_replace(status);
        if previous != status {
            debug!("Instance {}: {} -> {}", self.shared.id, previous, status);
        }
    }

    async fn exec(&mut self, command: Command, forced: bool) -> Result<(), InstanceError> {
        if !forced {
            // The status may have moved while this command was queued
            command.check(self.status())?;
        }
        debug!(
            "Instance {} executing {} (forced: {})",
            self.shared.id, command, forced
        );
        match command {
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::Kill => self.kill().await,
            Command::SelfCheck => self.self_check().await,
        }
    }

    async fn start(&mut self) -> Result<(), InstanceError> {
        if self.process.is_some() {
            return Err(InstanceError::AlreadyRunning);
        }
        self.set_status(InstanceStatus::Starting);

        let config = self.shared.config.read().await.clone();
        let process_config = match config.validate().and_then(|()| config.process_config()) {
            Ok(process_config) => process_config,
            Err(e) => return Err(self.fail(e)),
        };

        info!(
            "Starting instance '{}' ({}): {}",
            config.label(),
            self.shared.id,
            config.start_command
        );
        let (handle, events) = match ProcessActor::spawn(process_config) {
            Ok(spawned) => spawned,
            Err(e) => return Err(self.fail(InstanceError::Spawn(e.to_string()))),
        };

        // Open goes out before any output the pump forwards
        self.set_status(InstanceStatus::Running);
        self.shared.emit(InstanceEvent::Open);

        self.generation += 1;
        let pump = spawn_output_pump(
            self.shared.clone(),
            events,
            self.exit_tx.clone(),
            self.generation,
        );
        self.process = Some(RunningProcess {
            handle,
            pump,
            generation: self.generation,
        });

        {
            let mut config = self.shared.config.write().await;
            config.last_started_at = Some(chrono::Utc::now().to_rfc3339());
            config.event_task.ignore = false;
        }
        self.persist_logged().await;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), InstanceError> {
        let Some(mut running) = self.process.take() else {
            // Forced Stop with nothing running; reported like Kill
            self.finish_exit(None);
            return Ok(());
        };
        self.set_status(InstanceStatus::Stopping);
        self.shared.config.write().await.event_task.ignore = true;

        let config = self.shared.config.read().await.clone();
        let requested = if config.is_interrupt_stop() {
            running.handle.signal(ProcessSignal::Interrupt).await
        } else {
            let line = format!("{}\n", config.stop_command.trim());
            running.handle.write_str(&line).await.map(|_| ())
        };
        if let Err(e) = requested {
            warn!(
                "Instance {} stop request failed ({}), terminating instead",
                self.shared.id, e
            );
            let _ = running.handle.signal(ProcessSignal::Terminate).await;
        }

        let stop_timeout = self.ctx.lifecycle.stop_timeout;
        let joined = tokio::select! {
            joined = tokio::time::timeout(stop_timeout, &mut running.pump) => match joined {
                Ok(joined) => Some(joined),
                Err(_) => {
                    warn!(
                        "Instance {} did not stop within {:?}, killing it",
                        self.shared.id, stop_timeout
                    );
                    None
                }
            },
            _ = self.shared.halt.cancelled() => {
                warn!("Instance {} halted while stopping, killing it", self.shared.id);
                None
            }
        };
        let status = match joined {
            Some(joined) => joined.ok().flatten().or_else(|| running.handle.try_wait()),
            None => self.force_kill(running).await,
        };
        self.finish_exit(status);
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), InstanceError> {
        self.shared.config.write().await.event_task.ignore = true;
        let status = match self.process.take() {
            Some(running) => self.force_kill(running).await,
            None => None,
        };
        self.finish_exit(status);
        Ok(())
    }

    /// Kill the whole process group and wait a bounded time for it to be reaped
    async fn force_kill(&self, mut running: RunningProcess) -> Option<ExitStatus> {
        if let Err(e) = running.handle.signal(ProcessSignal::Kill).await {
            debug!("Instance {} kill: {}", self.shared.id, e);
        }

        let kill_timeout = self.ctx.lifecycle.kill_timeout;
        match tokio::time::timeout(kill_timeout, &mut running.pump).await {
            Ok(joined) => joined.ok().flatten().or_else(|| running.handle.try_wait()),
            Err(_) => {
                error!(
                    "Instance {} was not reaped within {:?} of being killed",
                    self.shared.id, kill_timeout
                );
                running.pump.abort();
                None
            }
        }
    }

    fn finish_exit(&self, status: Option<ExitStatus>) {
        let status = status.unwrap_or_default();
        info!("Instance {} stopped ({})", self.shared.id, status);
        self.set_status(InstanceStatus::Stopped);
        self.shared.emit(InstanceEvent::Exit(status));
    }

    /// Reset to `Stopped` and surface the error as a failure event
    fn fail(&self, err: InstanceError) -> InstanceError {
        warn!("Instance {} failed to start: {}", self.shared.id, err);
        self.set_status(InstanceStatus::Stopped);
        self.shared.emit(InstanceEvent::Failure(err.to_string()));
        err
    }

    async fn self_check(&mut self) -> Result<(), InstanceError> {
        if self.status() != InstanceStatus::Stopped {
            return Ok(());
        }
        self.set_status(InstanceStatus::Busy);
        let task = self.shared.config.read().await.event_task.clone();
        if task.auto_start && !task.ignore {
            info!("Auto-starting instance {}", self.shared.id);
            return self.start().await;
        }
        self.set_status(InstanceStatus::Stopped);
        Ok(())
    }

    /// The process went away without Stop or Kill
    async fn on_process_exit(&mut self, generation: u64) {
        let current = self.process.as_ref().map(|running| running.generation);
        if current != Some(generation) {
            return;
        }
        let Some(running) = self.process.take() else {
            return;
        };

        let status = running
            .pump
            .await
            .ok()
            .flatten()
            .or_else(|| running.handle.try_wait());
        self.finish_exit(status);

        let status = status.unwrap_or_default();
        if !status.success() {
            self.shared.emit(InstanceEvent::Failure(format!(
                "process exited unexpectedly ({})",
                status
            )));
        }

        let task = self.shared.config.read().await.event_task.clone();
        if task.auto_restart && !task.ignore {
            self.schedule_restart();
        }
    }

    fn schedule_restart(&self) {
        let delay = self.ctx.lifecycle.restart_delay;
        let weak = self.self_tx.clone();
        let cancel = self.cancel.clone();
        let id = self.shared.id.clone();

        info!("Instance {} will restart in {:?}", id, delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Restart of instance {} cancelled", id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(sender) = weak.upgrade() {
                let _ = sender.send(InstanceMessage::ScheduledRestart).await;
            }
        });
    }

    /// Start again unless someone stopped or killed the instance meanwhile
    async fn scheduled_restart(&mut self) {
        let ignore = self.shared.config.read().await.event_task.ignore;
        if ignore || self.status() != InstanceStatus::Stopped {
            debug!("Skipping scheduled restart of instance {}", self.shared.id);
            return;
        }
        if let Err(e) = self.start().await {
            warn!("Restart of instance {} failed: {}", self.shared.id, e);
        }
    }

    async fn update_config(
        &mut self,
        update: InstanceConfigUpdate,
    ) -> Result<InstanceConfig, InstanceError> {
        for encoding in [&update.input_encoding, &update.output_encoding]
            .into_iter()
            .flatten()
        {
            if !is_supported_encoding(encoding) {
                return Err(InstanceError::InvalidConfig(format!(
                    "unsupported encoding {:?}",
                    encoding
                )));
            }
        }

        let snapshot = {
            let mut config = self.shared.config.write().await;
            config.apply(update);
            config.clone()
        };
        self.ctx
            .store
            .store(INSTANCE_CONFIG_CATEGORY, &self.shared.id, &snapshot)
            .await?;
        debug!("Updated configuration of instance {}", self.shared.id);
        Ok(snapshot)
    }

    async fn write_input(&self, text: &str) -> Result<usize, InstanceError> {
        let running = self.process.as_ref().ok_or(InstanceError::NotRunning)?;
        Ok(running.handle.write_str(text).await?)
    }

    async fn persist(&self) -> Result<(), InstanceError> {
        let config = self.shared.config.read().await.clone();
        self.ctx
            .store
            .store(INSTANCE_CONFIG_CATEGORY, &self.shared.id, &config)
            .await?;
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!(
                "Failed to persist configuration of instance {}: {}",
                self.shared.id, e
            );
        }
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(running) = self.process.take() {
            let status = self.force_kill(running).await;
            self.finish_exit(status);
        }
    }
}

/// Decode process output into `Data` events until the process exits.
fn spawn_output_pump(
    shared: Arc<InstanceShared>,
    mut events: broadcast::Receiver<ProcessEvent>,
    exit_tx: mpsc::UnboundedSender<u64>,
    generation: u64,
) -> JoinHandle<Option<ExitStatus>> {
    tokio::spawn(async move {
        let mut decoders = OutputDecoders::default();
        let status = loop {
            match events.recv().await {
                Ok(ProcessEvent::Output(output)) => {
                    let text = decoders.decode(output.stream, &output.data);
                    if !text.is_empty() {
                        shared.emit(InstanceEvent::Data(text));
                    }
                }
                Ok(ProcessEvent::Exited(status)) => break Some(status),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Instance {} output pump lagged, {} chunks dropped",
                        shared.id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break None,
            }
        };

        let rest = decoders.finish();
        if !rest.is_empty() {
            shared.emit(InstanceEvent::Data(rest));
        }
        let _ = exit_tx.send(generation);
        status
    })
}
