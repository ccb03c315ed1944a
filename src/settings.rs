use anyhow::{ensure, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

const ENDPOINT_ENV: &str = "STUDYTIME_SYNC_ENDPOINT";
const DEBUG_ENV: &str = "STUDYTIME_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerSettings {
    pub endpoint: String,
    pub checkpoint_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub min_sync_seconds: u64,
    /// Seconds without user input after which the clock stops counting.
    /// `None` keeps counting for as long as the tab is visible.
    pub idle_timeout_secs: Option<u64>,
    pub storage_key: String,
    pub request_timeout_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api/study-time/sync".into(),
            checkpoint_interval_secs: 60,
            sync_interval_secs: 15 * 60,
            min_sync_seconds: 60,
            idle_timeout_secs: None,
            storage_key: "studytime.ledger".into(),
            request_timeout_secs: 10,
        }
    }
}

impl TrackerSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.endpoint.trim().is_empty(), "endpoint must not be empty");
        ensure!(!self.storage_key.trim().is_empty(), "storageKey must not be empty");
        ensure!(
            self.checkpoint_interval_secs > 0,
            "checkpointIntervalSecs must be greater than zero"
        );
        ensure!(
            self.sync_interval_secs > 0,
            "syncIntervalSecs must be greater than zero"
        );
        ensure!(
            self.request_timeout_secs > 0,
            "requestTimeoutSecs must be greater than zero"
        );
        if let Some(idle) = self.idle_timeout_secs {
            ensure!(idle > 0, "idleTimeoutSecs must be greater than zero when set");
        }
        Ok(())
    }

    /// Applies `STUDYTIME_SYNC_ENDPOINT` and `STUDYTIME_DEBUG`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            if !endpoint.trim().is_empty() {
                self.endpoint = endpoint;
            }
        }

        let debug_mode = std::env::var(DEBUG_ENV)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.checkpoint_interval_secs = 5;
            self.sync_interval_secs = 30;
        }

        self
    }
}

/// Tracker settings backed by a JSON file.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<TrackerSettings>,
}

impl SettingsStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Ignoring malformed settings at {}: {err}; using defaults",
                    path.display()
                );
                TrackerSettings::default()
            })
        } else {
            TrackerSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Current settings with environment overrides applied.
    pub fn effective(&self) -> TrackerSettings {
        self.read().clone().with_env_overrides()
    }

    pub fn update(&self, settings: TrackerSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, data: &TrackerSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
