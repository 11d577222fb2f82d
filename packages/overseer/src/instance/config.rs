use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use process_host::ProcessConfig;

use super::InstanceError;

/// Schema version written by this build. Records without a `version` field
/// predate versioning and use the legacy short keys (`nickname`, `cwd`,
/// `ie`, `oe`), which are accepted as aliases.
pub const CONFIG_VERSION: u32 = 1;

/// Stop command that means "send an interrupt" rather than "type this".
pub const INTERRUPT_STOP_COMMAND: &str = "^C";

pub const DEFAULT_ENCODING: &str = "utf8";

const SUPPORTED_ENCODINGS: [&str; 2] = ["utf8", "utf-8"];

/// Scheduled-action flags evaluated by the instance's self-check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventTask {
    /// Start when the daemon loads this instance
    pub auto_start: bool,
    /// Start again after the process exits on its own
    pub auto_restart: bool,
    /// Skip the next scheduled action. Set by Stop/Kill, cleared by Start and on load.
    pub ignore: bool,
}

/// Durable configuration of one instance, stored under `InstanceConfig/<id>`.
///
/// Every field falls back to its default when absent, at any nesting level,
/// so records written by older builds keep loading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceConfig {
    /// 32 hex characters; the storage key is authoritative on load
    pub id: String,
    pub version: u32,
    #[serde(alias = "nickname")]
    pub display_name: String,
    #[serde(alias = "cwd")]
    pub working_dir: PathBuf,
    pub start_command: String,
    pub stop_command: String,
    #[serde(alias = "ie")]
    pub input_encoding: String,
    #[serde(alias = "oe")]
    pub output_encoding: String,
    pub event_task: EventTask,
    pub tags: Vec<String>,
    /// RFC 3339
    pub created_at: String,
    /// RFC 3339, updated by every successful Start
    pub last_started_at: Option<String>,
    pub user_fields: BTreeMap<String, serde_json::Value>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            version: CONFIG_VERSION,
            display_name: String::new(),
            working_dir: PathBuf::from("."),
            start_command: String::new(),
            stop_command: INTERRUPT_STOP_COMMAND.to_string(),
            input_encoding: DEFAULT_ENCODING.to_string(),
            output_encoding: DEFAULT_ENCODING.to_string(),
            event_task: EventTask::default(),
            tags: Vec::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
            last_started_at: None,
            user_fields: BTreeMap::new(),
        }
    }
}

impl InstanceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Read a stored record. The storage key wins over any `id` inside the
    /// blob, and the record is upgraded to the current schema version.
    pub fn from_stored(id: &str, mut stored: InstanceConfig) -> Self {
        if stored.id != id {
            stored.id = id.to_string();
        }
        if stored.version < CONFIG_VERSION {
            stored.version = CONFIG_VERSION;
        }
        stored
    }

    /// Name shown to users; falls back to the identifier
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    pub fn is_interrupt_stop(&self) -> bool {
        self.stop_command.trim() == INTERRUPT_STOP_COMMAND
    }

    /// Check everything Start needs before anything is spawned
    pub fn validate(&self) -> Result<(), InstanceError> {
        if self.start_command.trim().is_empty() {
            return Err(InstanceError::InvalidConfig(
                "start command is empty".to_string(),
            ));
        }
        if !self.working_dir.is_dir() {
            return Err(InstanceError::InvalidConfig(format!(
                "working directory {} does not exist",
                self.working_dir.display()
            )));
        }
        for encoding in [&self.input_encoding, &self.output_encoding] {
            if !is_supported_encoding(encoding) {
                return Err(InstanceError::InvalidConfig(format!(
                    "unsupported encoding {:?}",
                    encoding
                )));
            }
        }
        Ok(())
    }

    pub fn process_config(&self) -> Result<ProcessConfig, InstanceError> {
        ProcessConfig::from_command_line(&self.start_command, Some(self.working_dir.clone()))
            .map_err(|e| InstanceError::InvalidConfig(e.to_string()))
    }

    /// Apply a partial update. The identifier is never touched.
    pub fn apply(&mut self, update: InstanceConfigUpdate) {
        if let Some(display_name) = update.display_name {
            self.display_name = display_name;
        }
        if let Some(working_dir) = update.working_dir {
            self.working_dir = working_dir;
        }
        if let Some(start_command) = update.start_command {
            self.start_command = start_command;
        }
        if let Some(stop_command) = update.stop_command {
            self.stop_command = stop_command;
        }
        if let Some(input_encoding) = update.input_encoding {
            self.input_encoding = input_encoding;
        }
        if let Some(output_encoding) = update.output_encoding {
            self.output_encoding = output_encoding;
        }
        if let Some(event_task) = update.event_task {
            self.event_task = event_task;
        }
        if let Some(tags) = update.tags {
            self.tags = tags;
        }
        if let Some(user_fields) = update.user_fields {
            self.user_fields = user_fields;
        }
    }
}

pub fn is_supported_encoding(encoding: &str) -> bool {
    SUPPORTED_ENCODINGS
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(encoding.trim()))
}

/// Partial configuration as sent by a create or update request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceConfigUpdate {
    #[serde(alias = "nickname")]
    pub display_name: Option<String>,
    #[serde(alias = "cwd")]
    pub working_dir: Option<PathBuf>,
    pub start_command: Option<String>,
    pub stop_command: Option<String>,
    #[serde(alias = "ie")]
    pub input_encoding: Option<String>,
    #[serde(alias = "oe")]
    pub output_encoding: Option<String>,
    pub event_task: Option<EventTask>,
    pub tags: Option<Vec<String>>,
    pub user_fields: Option<BTreeMap<String, serde_json::Value>>,
}

impl InstanceConfigUpdate {
    /// True when no working directory was given or it is the bare `.`
    pub fn wants_default_working_dir(&self) -> bool {
        match &self.working_dir {
            None => true,
            Some(dir) => dir.as_os_str().is_empty() || dir == Path::new("."),
        }
    }
}
