//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::SqliteFileRepository;
use crate::upload::{TempJanitor, UploadCoordinator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    coordinator: UploadCoordinator,
}

impl AppState {
    /// Create the application state, wiring the upload core to the file repository
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let repository = Arc::new(SqliteFileRepository::new(db.clone()));
        let coordinator = UploadCoordinator::from_config(&config.upload, repository);

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                coordinator,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the upload coordinator
    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.inner.coordinator
    }

    /// Janitor over the upload temp root
    pub fn janitor(&self) -> TempJanitor {
        self.inner.coordinator.janitor()
    }
}
