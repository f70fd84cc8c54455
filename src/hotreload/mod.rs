use crate::config::AuthGateConfig;
use crate::error::{ConfigError, GateError, Result};
use crate::gate::AuthGate;
use crate::policy::PolicySet;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Hot reload configuration
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct HotReloadConfig {
    /// Enable hot reload
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Debounce delay in milliseconds (to avoid reloading multiple times for rapid changes)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_enabled() -> bool {
    false
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Apply the reloadable parts of `config` to a running gate: the policy
/// set and the JWT key material.
///
/// Both are built before either is swapped in, so a bad file leaves the
/// gate exactly as it was. Server, store and fallback settings need a
/// restart.
pub fn apply_config(gate: &AuthGate, config: &AuthGateConfig) -> std::result::Result<(), ConfigError> {
    config.validate()?;
    let policies = PolicySet::from_config(&config.policies, &config.public_routes)?;

    gate.verifier().rotate(&config.auth.jwt)?;
    gate.resolver().swap(policies);
    Ok(())
}

/// Hot reload service that watches the configuration file
pub struct HotReloadService {
    config_path: PathBuf,
    gate: Arc<AuthGate>,
    debounce_duration: Duration,
}

impl HotReloadService {
    pub fn new(config_path: PathBuf, gate: Arc<AuthGate>, debounce_ms: u64) -> Self {
        Self {
            config_path,
            gate,
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    /// Start watching the configuration file for changes
    pub async fn start(self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                    ) {
                        let _ = tx.blocking_send(event);
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| GateError::Internal(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(|e| GateError::Internal(format!("Failed to watch config file: {}", e)))?;

        info!(
            path = %self.config_path.display(),
            debounce_ms = self.debounce_duration.as_millis() as u64,
            "Hot reload watcher started"
        );

        tokio::spawn(async move {
            // Dropping the watcher stops notifications.
            let _watcher = watcher;
            self.run(rx).await;
        });

        Ok(())
    }

    /// Reload once per burst of change events, after the burst has been
    /// quiet for the debounce delay, so the file is read in its final state
    async fn run(self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            debug!(kind = ?event.kind, "Config file change detected");

            tokio::time::sleep(self.debounce_duration).await;
            let mut coalesced = 0usize;
            while rx.try_recv().is_ok() {
                coalesced += 1;
            }
            if coalesced > 0 {
                debug!(coalesced, "Coalesced config change events");
            }

            match self.reload_config() {
                Ok(()) => info!("Configuration reloaded successfully"),
                Err(e) => error!(error = %e, "Failed to reload configuration, keeping the current one"),
            }
        }
    }

    fn reload_config(&self) -> std::result::Result<(), ConfigError> {
        info!(path = %self.config_path.display(), "Reloading configuration");
        let config = AuthGateConfig::from_file(&self.config_path)?;
        apply_config(&self.gate, &config)
    }
}

/// Watch a configuration file and reload on changes
pub async fn watch_config_file<P: AsRef<Path>>(
    config_path: P,
    gate: Arc<AuthGate>,
    debounce_ms: u64,
) -> Result<()> {
    HotReloadService::new(config_path.as_ref().to_path_buf(), gate, debounce_ms)
        .start()
        .await
}
