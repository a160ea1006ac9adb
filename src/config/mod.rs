//! Bridge preferences
//! JSON-backed and hot-reloadable: every getter reads the live value, so an
//! outside edit followed by [`SharedPreferences::reload`] takes effect on the
//! next operation that consults it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

const PREFERENCES_FILE_NAME: &str = "preferences.json";

/// Tunables for the control channel. Missing keys fall back to their
/// defaults, so hand-edited files can stay partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Only bonded peripherals are accepted while scanning
    pub bonded_only: bool,

    /// Pause before each radio operation, in milliseconds
    pub gatt_delay_ms: u64,

    /// Connection errors trigger a silent retry instead of being surfaced
    pub auto_retry: bool,

    /// Pause before a retry's reconnect attempt, in milliseconds
    pub retry_interval_ms: u64,

    /// The mute button flips the ringer mode instead of muting the output
    pub toggle_ringer: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            bonded_only: false,
            gatt_delay_ms: 128,
            auto_retry: false,
            retry_interval_ms: 1024,
            toggle_ringer: false,
        }
    }
}

impl Preferences {
    pub fn gatt_delay(&self) -> Duration {
        Duration::from_millis(self.gatt_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Shared handle to the live preferences
#[derive(Clone)]
pub struct SharedPreferences {
    prefs: Arc<RwLock<Preferences>>,
    path: Option<PathBuf>,
}

impl SharedPreferences {
    /// A store that never touches disk, for embedders that manage their own
    /// persistence
    pub fn in_memory(prefs: Preferences) -> Self {
        SharedPreferences {
            prefs: Arc::new(RwLock::new(prefs)),
            path: None,
        }
    }

    /// Loads the preferences file from `dir`, writing one with defaults on
    /// first run
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(PREFERENCES_FILE_NAME);
        let prefs = if path.exists() {
            let json = fs::read_to_string(&path)
                .await
                .with_context(|| format!("could not read {:?}", path))?;
            let prefs: Preferences = serde_json::from_str(&json)
                .with_context(|| format!("could not parse {:?}", path))?;
            info!("Preferences loaded from {:?}", path);
            prefs
        } else {
            warn!("Preferences file not found at {:?}, writing defaults", path);
            let prefs = Preferences::default();
            write_preferences(&path, &prefs).await?;
            prefs
        };
        Ok(SharedPreferences {
            prefs: Arc::new(RwLock::new(prefs)),
            path: Some(path),
        })
    }

    /// Re-reads the backing file, picking up outside edits
    pub async fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("could not read {:?}", path))?;
        let fresh: Preferences = serde_json::from_str(&json)
            .with_context(|| format!("could not parse {:?}", path))?;
        *self.prefs.write().await = fresh;
        info!("Preferences reloaded from {:?}", path);
        Ok(())
    }

    /// Applies an edit and persists it
    pub async fn update(&self, edit: impl FnOnce(&mut Preferences)) -> Result<()> {
        let snapshot = {
            let mut guard = self.prefs.write().await;
            edit(&mut guard);
            guard.clone()
        };
        match &self.path {
            Some(path) => write_preferences(path, &snapshot).await,
            None => Ok(()),
        }
    }

    pub async fn snapshot(&self) -> Preferences {
        self.prefs.read().await.clone()
    }

    pub async fn bonded_only(&self) -> bool {
        self.prefs.read().await.bonded_only
    }

    pub async fn gatt_delay(&self) -> Duration {
        self.prefs.read().await.gatt_delay()
    }

    pub async fn auto_retry(&self) -> bool {
        self.prefs.read().await.auto_retry
    }

    pub async fn retry_interval(&self) -> Duration {
        self.prefs.read().await.retry_interval()
    }

    pub async fn toggle_ringer(&self) -> bool {
        self.prefs.read().await.toggle_ringer
    }
}

async fn write_preferences(path: &Path, prefs: &Preferences) -> Result<()> {
    if let Some(dir) = path.parent() {
        ensure_directory_exists(dir).await?;
    }
    let json = serde_json::to_string_pretty(prefs)?;
    fs::write(path, json)
        .await
        .with_context(|| format!("could not write {:?}", path))?;
    info!("Preferences saved to {:?}", path);
    Ok(())
}

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
async fn ensure_directory_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .await
            .with_context(|| format!("could not create directory {:?}", path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_run_writes_a_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = SharedPreferences::load(dir.path()).await.unwrap();

        assert!(dir.path().join(PREFERENCES_FILE_NAME).exists());
        let snapshot = prefs.snapshot().await;
        assert_eq!(snapshot.gatt_delay_ms, 128);
        assert_eq!(snapshot.retry_interval_ms, 1024);
        assert!(!snapshot.bonded_only);
        assert!(!snapshot.auto_retry);
        assert!(!snapshot.toggle_ringer);
    }

    #[tokio::test]
    async fn updates_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = SharedPreferences::load(dir.path()).await.unwrap();
        prefs
            .update(|p| {
                p.auto_retry = true;
                p.retry_interval_ms = 2048;
            })
            .await
            .unwrap();

        let reopened = SharedPreferences::load(dir.path()).await.unwrap();
        assert!(reopened.auto_retry().await);
        assert_eq!(
            reopened.retry_interval().await,
            Duration::from_millis(2048)
        );
    }

    #[tokio::test]
    async fn reload_picks_up_outside_edits() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = SharedPreferences::load(dir.path()).await.unwrap();

        std::fs::write(
            dir.path().join(PREFERENCES_FILE_NAME),
            r#"{ "bonded_only": true, "gatt_delay_ms": 16 }"#,
        )
        .unwrap();
        prefs.reload().await.unwrap();

        assert!(prefs.bonded_only().await);
        assert_eq!(prefs.gatt_delay().await, Duration::from_millis(16));
    }

    #[tokio::test]
    async fn partial_files_fall_back_to_defaults_per_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PREFERENCES_FILE_NAME),
            r#"{ "toggle_ringer": true }"#,
        )
        .unwrap();

        let prefs = SharedPreferences::load(dir.path()).await.unwrap();
        assert!(prefs.toggle_ringer().await);
        assert_eq!(prefs.gatt_delay().await, Duration::from_millis(128));
    }

    #[tokio::test]
    async fn in_memory_store_accepts_updates_without_a_file() {
        let prefs = SharedPreferences::in_memory(Preferences::default());
        prefs.update(|p| p.bonded_only = true).await.unwrap();
        assert!(prefs.bonded_only().await);
    }
}
