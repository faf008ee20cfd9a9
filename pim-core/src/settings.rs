//! Persistent per-agent configuration: just enough to know whether the
//! agent should come up online and what to call itself, plus the
//! derived paths the change recorder needs so two agents on one
//! machine never share a journal.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct AgentSection {
    #[serde(default = "default_true")]
    desired_online_state: bool,
    name: Option<String>,
}

fn default_true() -> bool {
    true
}

/// The legacy section name a resource's identity used to live under,
/// before it moved to `Agent/Name`.
#[derive(Debug, Clone, Deserialize, Default)]
struct ResourceSection {
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawSettings {
    agent: Option<AgentSection>,
    resource: Option<ResourceSection>,
}

/// One agent's durable configuration, loaded from `<config_path>` (plus
/// `PIMSYNC__*` environment overrides) and falling back to sensible
/// defaults when the file doesn't exist yet.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub desired_online_state: bool,
    pub name: String,
    config_path: PathBuf,
}

impl AgentSettings {
    /// `fallback_name` is used when neither `Agent/Name` nor the
    /// transitional `Resource/Name` is set.
    pub fn load(config_path: &Path, fallback_name: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(config_path).required(false))
            .add_source(Environment::with_prefix("PIMSYNC").separator("__"))
            .build()?;
        let raw: RawSettings = config.try_deserialize().unwrap_or_default();

        let name = raw
            .agent
            .as_ref()
            .and_then(|agent| agent.name.clone())
            .or_else(|| raw.resource.and_then(|resource| resource.name))
            .unwrap_or_else(|| fallback_name.to_string());
        let desired_online_state = raw.agent.map(|agent| agent.desired_online_state).unwrap_or(true);

        Ok(Self {
            desired_online_state,
            name,
            config_path: config_path.to_path_buf(),
        })
    }

    /// The change journal's path, derived from the config file's own
    /// location so that renaming an agent's config directory carries
    /// its journal along.
    pub fn journal_path(&self) -> PathBuf {
        crate::recorder::journal_path_for(&self.config_path)
    }

    /// Where a pre-migration (version-0) journal would have lived.
    pub fn legacy_journal_path(&self) -> PathBuf {
        let mut name = self
            .config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push("rc");
        self.config_path.with_file_name(name)
    }
}
