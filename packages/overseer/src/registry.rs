use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use process_host::ExitStatus;

use crate::instance::{
    Command, DEFAULT_ENCODING, INSTANCE_CONFIG_CATEGORY, InstanceConfig, InstanceConfigUpdate,
    InstanceContext, InstanceError, InstanceEvent, InstanceHandle, InstanceStatus,
    LifecycleSettings, is_supported_encoding,
};
use crate::storage::{StorageError, Store};
use crate::stream::{StreamMultiplexer, Subscriber};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate identifier {0}")]
    DuplicateIdentifier(String),

    #[error("instance has no identifier")]
    EmptyIdentifier,

    #[error("instance does not exist: {0}")]
    NotFound(String),

    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

impl RegistryError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateIdentifier(_) => "duplicate_identifier",
            Self::EmptyIdentifier => "empty_identifier",
            Self::NotFound(_) => "instance_not_found",
            Self::Io { .. } => "io_error",
            Self::Storage(e) => e.error_code(),
            Self::Instance(e) => e.error_code(),
        }
    }
}

/// Attribution attached to lifecycle events
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMeta {
    pub id: String,
    pub display_name: String,
}

/// The aggregated event stream of every registered instance
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    Data { id: String, chunk: String },
    Open { meta: InstanceMeta },
    Exit { meta: InstanceMeta, status: ExitStatus },
    Failure { meta: InstanceMeta, reason: String },
}

#[derive(Clone, Debug)]
pub struct RegistrySettings {
    /// Root for default working directories, one per instance
    pub instance_data_dir: PathBuf,
    pub lifecycle: LifecycleSettings,
    /// Upper bound for `exit()`
    pub shutdown_timeout: Duration,
}

/// Filter and page selection for `list`
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceQuery {
    /// Case-insensitive substring of the display name
    pub display_name: Option<String>,
    pub status: Option<InstanceStatus>,
    pub tag: Option<String>,
    /// 1-based
    pub page: usize,
    pub page_size: usize,
}

impl Default for InstanceQuery {
    fn default() -> Self {
        Self {
            display_name: None,
            status: None,
            tag: None,
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub display_name: String,
    pub status: InstanceStatus,
    pub working_dir: PathBuf,
    pub start_command: String,
    pub tags: Vec<String>,
    pub auto_start: bool,
    pub last_started_at: Option<String>,
}

impl InstanceSummary {
    pub fn new(config: &InstanceConfig, status: InstanceStatus) -> Self {
        Self {
            id: config.id.clone(),
            display_name: config.display_name.clone(),
            status,
            working_dir: config.working_dir.clone(),
            start_command: config.start_command.clone(),
            tags: config.tags.clone(),
            auto_start: config.event_task.auto_start,
            last_started_at: config.last_started_at.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePage {
    pub items: Vec<InstanceSummary>,
    /// Matches before paging
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub max_page: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Overview {
    pub total: usize,
    pub running: usize,
}

struct Registered {
    handle: InstanceHandle,
    /// Relays this instance's events into the aggregate stream
    forwarder: JoinHandle<()>,
}

/// Process-wide directory of instances
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Registered>>,
    ctx: InstanceContext,
    instance_data_dir: PathBuf,
    shutdown_timeout: Duration,
    streams: Arc<StreamMultiplexer>,
    events: broadcast::Sender<RegistryEvent>,
}

impl InstanceRegistry {
    pub fn new(store: Store, settings: RegistrySettings) -> Self {
        let (events, _) = broadcast::channel(settings.lifecycle.event_capacity.max(1));
        Self {
            instances: RwLock::new(HashMap::new()),
            ctx: InstanceContext {
                store,
                lifecycle: settings.lifecycle,
            },
            instance_data_dir: settings.instance_data_dir,
            shutdown_timeout: settings.shutdown_timeout,
            streams: Arc::new(StreamMultiplexer::new()),
            events,
        }
    }

    pub fn store(&self) -> &Store {
        &self.ctx.store
    }

    pub fn streams(&self) -> &Arc<StreamMultiplexer> {
        &self.streams
    }

    /// Subscribe to the aggregated event stream
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Materialize every stored instance, then evaluate autostart for all of them.
    ///
    /// A record that fails to load is logged and skipped. Returns how many
    /// instances were loaded.
    pub async fn load_instances(&self) -> Result<usize, RegistryError> {
        let identifiers = self.ctx.store.list(INSTANCE_CONFIG_CATEGORY).await?;
        info!("Loading {} stored instances", identifiers.len());

        let mut loaded = Vec::with_capacity(identifiers.len());
        for id in identifiers {
            match self.load_instance(&id).await {
                Ok(handle) => loaded.push(handle),
                Err(e) => error!("Skipping stored instance {}: {}", id, e),
            }
        }

        join_all(loaded.iter().map(|handle| async move {
            if let Err(e) = handle.arm_self_check().await {
                warn!("Autostart of instance {} failed: {}", handle.id(), e);
            }
        }))
        .await;

        info!("Loaded {} instances", loaded.len());
        Ok(loaded.len())
    }

    async fn load_instance(&self, id: &str) -> Result<InstanceHandle, RegistryError> {
        let stored: InstanceConfig = self
            .ctx
            .store
            .load(INSTANCE_CONFIG_CATEGORY, id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut config = InstanceConfig::from_stored(id, stored);
        // Markers from the previous run never carry over
        config.event_task.ignore = false;

        let handle = InstanceHandle::spawn(config, self.ctx.clone());
        if let Err(e) = self.add_instance(handle.clone()).await {
            handle.destroy().await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Create, persist and register a new instance
    pub async fn create_instance(
        &self,
        update: InstanceConfigUpdate,
    ) -> Result<InstanceHandle, RegistryError> {
        for encoding in [&update.input_encoding, &update.output_encoding]
            .into_iter()
            .flatten()
        {
            if !is_supported_encoding(encoding) {
                return Err(InstanceError::InvalidConfig(format!(
                    "unsupported encoding {:?}",
                    encoding
                ))
                .into());
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        let mut config = InstanceConfig::new(&id);
        config.input_encoding = DEFAULT_ENCODING.to_string();
        config.output_encoding = DEFAULT_ENCODING.to_string();

        let default_dir = update.wants_default_working_dir();
        config.apply(update);
        if default_dir {
            config.working_dir = self.instance_data_dir.join(&id);
        }
        tokio::fs::create_dir_all(&config.working_dir)
            .await
            .map_err(|source| RegistryError::Io {
                path: config.working_dir.clone(),
                source,
            })?;

        self.ctx
            .store
            .store(INSTANCE_CONFIG_CATEGORY, &id, &config)
            .await?;

        let handle = InstanceHandle::spawn(config, self.ctx.clone());
        self.add_instance(handle.clone()).await?;
        info!("Created instance {}", id);

        if let Err(e) = handle.arm_self_check().await {
            warn!("Autostart of new instance {} failed: {}", id, e);
        }
        Ok(handle)
    }

    /// Register an instance and wire its events into the aggregate stream
    pub async fn add_instance(&self, handle: InstanceHandle) -> Result<(), RegistryError> {
        let id = handle.id().to_string();
        if id.is_empty() {
            return Err(RegistryError::EmptyIdentifier);
        }

        let mut instances = self.instances.write().await;
        if instances.contains_key(&id) {
            return Err(RegistryError::DuplicateIdentifier(id));
        }

        let forwarder = spawn_forwarder(handle.clone(), self.streams.clone(), self.events.clone());
        instances.insert(id.clone(), Registered { handle, forwarder });
        debug!("Registered instance {}", id);
        Ok(())
    }

    /// Delete an instance's record, then destroy it. With `delete_files` the
    /// working directory is removed in the background, best-effort.
    ///
    /// If the record cannot be deleted the instance stays registered and
    /// untouched.
    pub async fn remove_instance(&self, id: &str, delete_files: bool) -> Result<(), RegistryError> {
        let registered = {
            let mut instances = self.instances.write().await;
            if !instances.contains_key(id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            if let Err(e) = self.ctx.store.delete(INSTANCE_CONFIG_CATEGORY, id).await {
                error!("Failed to delete stored record of instance {}: {}", id, e);
                return Err(e.into());
            }
            instances
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?
        };

        let working_dir = registered.handle.config().await.working_dir;
        registered.handle.destroy().await;
        registered.forwarder.abort();
        self.streams.drop_instance(id).await;

        // The actor may have persisted again before it was destroyed
        if let Err(e) = self.ctx.store.delete(INSTANCE_CONFIG_CATEGORY, id).await {
            warn!("Failed to delete stored record of instance {}: {}", id, e);
        }
        info!("Removed instance {}", id);

        if delete_files {
            let id = id.to_string();
            tokio::spawn(async move {
                match tokio::fs::remove_dir_all(&working_dir).await {
                    Ok(()) => debug!("Deleted files of instance {}", id),
                    Err(e) => debug!(
                        "Could not delete {} for instance {}: {}",
                        working_dir.display(),
                        id,
                        e
                    ),
                }
            });
        }
        Ok(())
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.instances.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<InstanceHandle> {
        self.instances
            .read()
            .await
            .get(id)
            .map(|registered| registered.handle.clone())
    }

    pub async fn handles(&self) -> Vec<InstanceHandle> {
        self.instances
            .read()
            .await
            .values()
            .map(|registered| registered.handle.clone())
            .collect()
    }

    pub async fn overview(&self) -> Overview {
        let instances = self.instances.read().await;
        Overview {
            total: instances.len(),
            running: instances
                .values()
                .filter(|registered| registered.handle.status() == InstanceStatus::Running)
                .count(),
        }
    }

    /// Filtered, paged read-only view
    pub async fn list(&self, query: &InstanceQuery) -> InstancePage {
        let mut summaries = Vec::new();
        for handle in self.handles().await {
            let config = handle.config().await;
            summaries.push(InstanceSummary::new(&config, handle.status()));
        }
        paginate(summaries, query)
    }

    /// Attach a viewer to an instance's output. Unknown instances are ignored.
    pub async fn forward(&self, id: &str, subscriber: Subscriber) -> bool {
        if !self.exists(id).await {
            debug!("Not forwarding unknown instance {}", id);
            return false;
        }
        self.streams.forward(id, subscriber).await;
        true
    }

    pub async fn stop_forward(&self, id: &str, subscriber_id: &str) -> bool {
        self.streams.stop_forward(id, subscriber_id).await
    }

    pub async fn for_each_forward(&self, id: &str, f: impl FnMut(&Subscriber)) {
        self.streams.for_each_forward(id, f).await
    }

    /// Detach a closed connection from everything it was watching
    pub async fn disconnect(&self, subscriber_id: &str) -> usize {
        self.streams.disconnect(subscriber_id).await
    }

    /// Kill every instance that is not stopped and persist its configuration.
    ///
    /// Instances are handled concurrently. A Kill can be queued behind a Stop
    /// that is still in its grace period; once the shutdown timeout passes
    /// every instance is halted, which turns those Stops into kills, and
    /// `exit` waits up to the kill timeout more.
    pub async fn exit(&self) -> usize {
        let active: Vec<InstanceHandle> = self
            .handles()
            .await
            .into_iter()
            .filter(|handle| handle.status() != InstanceStatus::Stopped)
            .collect();

        if active.is_empty() {
            info!("No running instances to stop");
            return 0;
        }
        info!("Stopping {} instances", active.len());

        let shutdowns = active.iter().map(|handle| async move {
            if let Err(e) = handle.force_exec(Command::Kill).await {
                warn!("Failed to kill instance {}: {}", handle.id(), e);
            }
            if let Err(e) = handle.persist().await {
                warn!("Failed to persist instance {}: {}", handle.id(), e);
            }
        });

        let shutdowns = join_all(shutdowns);
        tokio::pin!(shutdowns);
        if tokio::time::timeout(self.shutdown_timeout, &mut shutdowns)
            .await
            .is_ok()
        {
            return active.len();
        }

        warn!(
            "Instances still running after {:?}, halting them",
            self.shutdown_timeout
        );
        for handle in &active {
            handle.halt();
        }
        let kill_timeout = self.ctx.lifecycle.kill_timeout;
        if tokio::time::timeout(kill_timeout, &mut shutdowns)
            .await
            .is_err()
        {
            error!(
                "Instances still not stopped {:?} after being halted",
                kill_timeout
            );
        }
        active.len()
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        // Relays hold handles that keep the actors alive
        for registered in self.instances.get_mut().values() {
            registered.forwarder.abort();
        }
    }
}

fn spawn_forwarder(
    handle: InstanceHandle,
    streams: Arc<StreamMultiplexer>,
    events: broadcast::Sender<RegistryEvent>,
) -> JoinHandle<()> {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Event relay for instance {} lagged by {} events",
                        handle.id(),
                        skipped
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let id = handle.id().to_string();
            let aggregated = match event {
                InstanceEvent::Data(chunk) => {
                    streams.fan_out(&id, &chunk).await;
                    RegistryEvent::Data { id, chunk }
                }
                InstanceEvent::Open => RegistryEvent::Open {
                    meta: meta(&handle).await,
                },
                InstanceEvent::Exit(status) => RegistryEvent::Exit {
                    meta: meta(&handle).await,
                    status,
                },
                InstanceEvent::Failure(reason) => RegistryEvent::Failure {
                    meta: meta(&handle).await,
                    reason,
                },
            };
            let _ = events.send(aggregated);
        }
    })
}

async fn meta(handle: &InstanceHandle) -> InstanceMeta {
    InstanceMeta {
        id: handle.id().to_string(),
        display_name: handle.display_name().await,
    }
}

fn matches_query(query: &InstanceQuery, summary: &InstanceSummary) -> bool {
    if let Some(name) = &query.display_name {
        if !summary
            .display_name
            .to_lowercase()
            .contains(&name.to_lowercase())
        {
            return false;
        }
    }
    if query.status.is_some_and(|status| status != summary.status) {
        return false;
    }
    if let Some(tag) = &query.tag {
        if !summary.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    true
}

fn paginate(mut summaries: Vec<InstanceSummary>, query: &InstanceQuery) -> InstancePage {
    summaries.retain(|summary| matches_query(query, summary));
    summaries.sort_by(|a, b| {
        a.display_name
            .cmp(&b.display_name)
            .then_with(|| a.id.cmp(&b.id))
    });

    let page_size = query.page_size.max(1);
    let total = summaries.len();
    let max_page = total.div_ceil(page_size).max(1);
    let page = query.page.clamp(1, max_page);

    let items = summaries
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();

    InstancePage {
        items,
        total,
        page,
        page_size,
        max_page,
    }
}
