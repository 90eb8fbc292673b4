//! Multi-instance warning: flags when too many operations run at once.

use crate::config::MultiInstanceWarningConfig;
use crate::error::AppError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, instrument, warn};

/// Where the warning settings live between runs.
#[async_trait]
pub trait WarningConfigStore: Send + Sync {
    /// `Ok(None)` when nothing was saved yet.
    async fn load(&self) -> Result<Option<MultiInstanceWarningConfig>, AppError>;
    async fn save(&self, config: &MultiInstanceWarningConfig) -> Result<(), AppError>;
}

#[derive(Debug, Default)]
pub struct MemoryWarningStore {
    saved: TokioMutex<Option<MultiInstanceWarningConfig>>,
}

impl MemoryWarningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MultiInstanceWarningConfig) -> Self {
        Self {
            saved: TokioMutex::new(Some(config)),
        }
    }
}

#[async_trait]
impl WarningConfigStore for MemoryWarningStore {
    async fn load(&self) -> Result<Option<MultiInstanceWarningConfig>, AppError> {
        Ok(*self.saved.lock().await)
    }

    async fn save(&self, config: &MultiInstanceWarningConfig) -> Result<(), AppError> {
        *self.saved.lock().await = Some(*config);
        Ok(())
    }
}

/// Keeps the settings as pretty-printed JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileWarningStore {
    path: PathBuf,
}

impl JsonFileWarningStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl WarningConfigStore for JsonFileWarningStore {
    async fn load(&self) -> Result<Option<MultiInstanceWarningConfig>, AppError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, config: &MultiInstanceWarningConfig) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// Surfaces the "too many operations" condition. It never decides to
/// dismiss on its own; dismissal only comes from [`MultiInstanceGuard::dismiss`]
/// and stays until [`MultiInstanceGuard::reset`].
pub struct MultiInstanceGuard {
    config: TokioMutex<MultiInstanceWarningConfig>,
    store: Box<dyn WarningConfigStore>,
}

impl MultiInstanceGuard {
    /// Reads persisted settings, falling back to `defaults` if the store is
    /// empty or unreadable.
    pub async fn load(
        store: Box<dyn WarningConfigStore>,
        defaults: MultiInstanceWarningConfig,
    ) -> Self {
        let config = match store.load().await {
            Ok(Some(saved)) => {
                debug!(?saved, "Loaded multi-instance warning settings");
                saved
            }
            Ok(None) => defaults,
            Err(e) => {
                warn!(error = %e, "Failed to load multi-instance warning settings, using defaults");
                defaults
            }
        };
        Self {
            config: TokioMutex::new(config),
            store,
        }
    }

    pub fn evaluate(config: &MultiInstanceWarningConfig, active_count: usize) -> bool {
        config.enabled && !config.dismissed && active_count >= config.threshold.max(1)
    }

    pub async fn should_warn(&self, active_count: usize) -> bool {
        Self::evaluate(&*self.config.lock().await, active_count)
    }

    pub async fn config(&self) -> MultiInstanceWarningConfig {
        *self.config.lock().await
    }

    #[instrument(skip(self))]
    pub async fn dismiss(&self) {
        self.mutate(|c| c.dismissed = true).await;
        info!("Multi-instance warning dismissed");
    }

    #[instrument(skip(self))]
    pub async fn reset(&self) {
        self.mutate(|c| c.dismissed = false).await;
        info!("Multi-instance warning re-armed");
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.mutate(|c| c.enabled = enabled).await;
    }

    pub async fn set_threshold(&self, threshold: usize) {
        self.mutate(|c| c.threshold = threshold.max(1)).await;
    }

    async fn mutate(&self, f: impl FnOnce(&mut MultiInstanceWarningConfig)) {
        let snapshot = {
            let mut config = self.config.lock().await;
            f(&mut config);
            *config
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "Failed to persist multi-instance warning settings");
        }
    }
}

impl std::fmt::Debug for MultiInstanceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiInstanceGuard").finish_non_exhaustive()
    }
}
