use crate::model::DEFAULT_CATEGORY;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use tracing::{info, warn};

pub const SETTINGS_FILE_NAME: &str = "settings.json";

const MIN_TICK_SECONDS: u64 = 5;
const MIN_PROMPT_MINUTES: u64 = 1;
const MIN_PROMPT_TIMEOUT_MINUTES: u64 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Selectable categories. `default` is always available and need not be listed.
    pub categories: Vec<String>,
    pub tick_seconds: u64,
    pub prompt_minutes: u64,
    pub prompt_timeout_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            categories: ["code", "research", "building", "meeting", "field", "social"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tick_seconds: 60,
            prompt_minutes: 15,
            prompt_timeout_minutes: 3,
        }
    }
}

impl Settings {
    /// Clamps intervals to their minimums and tidies the category list.
    pub fn normalized(mut self) -> Self {
        self.tick_seconds = self.tick_seconds.max(MIN_TICK_SECONDS);
        self.prompt_minutes = self.prompt_minutes.max(MIN_PROMPT_MINUTES);
        self.prompt_timeout_minutes = self.prompt_timeout_minutes.max(MIN_PROMPT_TIMEOUT_MINUTES);

        let mut seen = Vec::with_capacity(self.categories.len());
        for c in self.categories {
            let c = c.trim().to_string();
            if c.is_empty() || c == DEFAULT_CATEGORY || seen.contains(&c) {
                continue;
            }
            seen.push(c);
        }
        self.categories = seen;
        self
    }

    pub fn is_known(&self, category: &str) -> bool {
        category == DEFAULT_CATEGORY || self.categories.iter().any(|c| c == category)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn prompt_interval(&self) -> Duration {
        Duration::from_secs(self.prompt_minutes * 60)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_minutes * 60)
    }
}

/// Reads `path`, or writes `defaults` there when it is missing or unreadable.
/// The normalized result is always written back.
pub fn load_or_init_settings(path: &Path, defaults: Settings) -> anyhow::Result<Settings> {
    let loaded = match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Settings>(&text) {
            Ok(s) => {
                info!("loaded settings from {}", path.display());
                s
            }
            Err(err) => {
                warn!("settings {} unreadable ({err}); using defaults", path.display());
                defaults
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("no settings at {}; initialising", path.display());
            defaults
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read settings {}", path.display()));
        }
    };

    let settings = loaded.normalized();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create settings dir {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(&settings).context("serialize settings")?;
    fs::write(path, text).with_context(|| format!("write settings {}", path.display()))?;
    Ok(settings)
}
