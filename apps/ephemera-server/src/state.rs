//! Application state management

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::csrf::CsrfProtection;
use crate::rate_limit::RateLimiters;
use crate::retrieval::FileService;
use crate::store::{ObjectStore, StoreConfig, StoreError};
use crate::upload::{ChunkStore, SessionManager, UploadPolicy, UploadService};

/// Error type for state initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to open object store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to prepare staging directory: {0}")]
    Staging(#[from] std::io::Error),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: ObjectStore,
    uploads: UploadService,
    files: FileService,
    csrf: CsrfProtection,
    rate_limiters: RateLimiters,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Open the object store and build every service.
    ///
    /// Background sweeps are not started here; see [`AppState::start_background_tasks`].
    pub fn new(config: Config) -> Result<Self, StateError> {
        let store = ObjectStore::open(&StoreConfig {
            data_dir: config.storage.data_path.clone(),
            max_upload_size: config.upload.max_upload_size,
            sync_writes: config.storage.sync_writes,
            max_segment_size: crate::store::log::DEFAULT_MAX_SEGMENT_SIZE,
        })?;

        std::fs::create_dir_all(&config.storage.staging_path)?;

        let uploads = UploadService::new(
            SessionManager::new(),
            ChunkStore::with_local_storage(config.storage.staging_path.clone()),
            store.clone(),
            UploadPolicy {
                max_upload_size: config.upload.max_upload_size,
                allowed_types: config.upload.allowed_types.clone(),
            },
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                files: FileService::new(store.clone()),
                csrf: CsrfProtection::new(config.csrf.expiration),
                rate_limiters: RateLimiters::from_config(&config.rate_limit),
                uploads,
                store,
                config,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.inner.store
    }

    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }

    pub fn files(&self) -> &FileService {
        &self.inner.files
    }

    pub fn csrf(&self) -> &CsrfProtection {
        &self.inner.csrf
    }

    pub fn rate_limiters(&self) -> &RateLimiters {
        &self.inner.rate_limiters
    }

    /// Spawn the expiry, session, CSRF and rate limit sweeps
    pub fn start_background_tasks(&self) {
        let cancel = &self.inner.shutdown;
        let config = &self.inner.config;

        let handles = [
            self.inner
                .store
                .clone()
                .start_cleanup_task(config.storage.cleanup_interval, cancel.clone()),
            self.inner.uploads.clone().start_cleanup_task(cancel.clone()),
            self.inner.csrf.clone().start_cleanup_task(cancel.clone()),
            self.inner
                .rate_limiters
                .clone()
                .start_cleanup_task(config.rate_limit.cleanup_interval, cancel.clone()),
        ];

        self.inner.tasks.lock().extend(handles);
        tracing::info!(
            cleanup_interval_secs = config.storage.cleanup_interval.as_secs(),
            "Background cleanup tasks started"
        );
    }

    /// Stop the sweeps, wait for them, then flush the store
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let handles: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        let store = self.inner.store.clone();
        match tokio::task::spawn_blocking(move || store.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to close object store"),
            Err(e) => tracing::error!(error = %e, "Store close task failed"),
        }
    }
}
