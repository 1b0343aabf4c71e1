//! Store connection management with lazy initialization.

use std::sync::LazyLock;

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use tokio::sync::OnceCell;

use crate::error::StoreError;

/// Global connection instance using lazy initialization.
static DB: LazyLock<OnceCell<Surreal<Any>>> = LazyLock::new(OnceCell::new);

/// Store connection handle.
pub type Database = Surreal<Any>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection mode: "mem://" or "rocksdb://path"
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "quarry".to_string(),
            database: "jobs".to_string(),
            credentials: None,
        }
    }
}

impl StoreConfig {
    /// Create a config for in-memory use (tests, local development).
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for file-based persistence.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create a config for RocksDB persistence (requires the rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Initialize the store connection.
///
/// Called once at startup before any store operations; later calls reuse
/// the existing connection.
pub async fn init_store(config: StoreConfig) -> Result<&'static Database, StoreError> {
    DB.get_or_try_init(|| async {
        tracing::info!("Connecting to job store: {}", config.endpoint);

        let db = connect(&config.endpoint).await?;

        if let Some((username, password)) = &config.credentials {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await?;

        tracing::info!(
            "Connected to job store: {}/{}",
            config.namespace,
            config.database
        );

        Ok(db)
    })
    .await
}

/// Get the store connection.
pub fn get_db() -> Result<&'static Database, StoreError> {
    DB.get().ok_or(StoreError::NotInitialized)
}

/// Get the store connection if it has been initialized.
pub fn try_get_db() -> Option<&'static Database> {
    DB.get()
}
