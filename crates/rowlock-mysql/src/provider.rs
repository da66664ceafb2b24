//! MySQL lock client.

use std::ops::Deref;

use rowlock_core::error::{LockError, LockResult};
use rowlock_core::holder::InstanceId;
use rowlock_core::traits::LockClient;
use rowlock_engine::{DatabaseLock, DatabaseLockClient, LockOptions};
use sqlx::MySqlPool;

use crate::connection::MySqlConnection;
use crate::schema::ensure_schema;
use crate::store::MySqlLockStore;

/// Builder for MySQL lock client configuration.
pub struct MySqlLockClientBuilder {
    connection: Option<MySqlConnection>,
    options: LockOptions,
    instance_id: Option<InstanceId>,
    max_connections: u32,
    ensure_schema: bool,
}

impl MySqlLockClientBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            connection: None,
            options: LockOptions::default(),
            instance_id: None,
            max_connections: 10,
            ensure_schema: true,
        }
    }

    /// Sets the MySQL connection string.
    pub fn connection_string(mut self, conn_str: impl Into<String>) -> Self {
        self.connection = Some(MySqlConnection::ConnectionString(conn_str.into()));
        self
    }

    /// Sets an existing connection pool.
    pub fn pool(mut self, pool: MySqlPool) -> Self {
        self.connection = Some(MySqlConnection::Pool(pool));
        self
    }

    pub fn options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn instance_id(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Pool size used when the builder creates the pool itself.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Whether `build` creates missing tables (default: `true`).
    pub fn ensure_schema(mut self, ensure_schema: bool) -> Self {
        self.ensure_schema = ensure_schema;
        self
    }

    /// Builds the client.
    pub async fn build(self) -> LockResult<MySqlLockClient> {
        let connection = self
            .connection
            .ok_or_else(|| LockError::Config("connection not specified".to_string()))?;
        let pool = connection.get_pool(self.max_connections).await?;
        if self.ensure_schema {
            ensure_schema(&pool).await?;
        }

        let mut builder = DatabaseLockClient::builder()
            .store(MySqlLockStore::new(pool))
            .options(self.options);
        if let Some(instance_id) = self.instance_id {
            builder = builder.instance_id(instance_id);
        }
        Ok(MySqlLockClient {
            inner: builder.build()?,
        })
    }
}

impl Default for MySqlLockClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock client backed by MySQL tables.
///
/// Dereferences to [`DatabaseLockClient`] for shutdown, reaping and owner
/// management.
#[derive(Clone)]
pub struct MySqlLockClient {
    inner: DatabaseLockClient<MySqlLockStore>,
}

impl MySqlLockClient {
    /// Returns a new builder for configuring the client.
    pub fn builder() -> MySqlLockClientBuilder {
        MySqlLockClientBuilder::new()
    }

    /// Creates a client using the specified connection string.
    pub async fn new(connection_string: impl Into<String>) -> LockResult<Self> {
        Self::builder()
            .connection_string(connection_string)
            .build()
            .await
    }

    pub fn into_inner(self) -> DatabaseLockClient<MySqlLockStore> {
        self.inner
    }
}

impl Deref for MySqlLockClient {
    type Target = DatabaseLockClient<MySqlLockStore>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl LockClient for MySqlLockClient {
    type Lock = DatabaseLock<MySqlLockStore>;

    fn get_lock(&self, name: &str) -> Self::Lock {
        self.inner.get_lock(name)
    }
}
