use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{DatabaseError, DeadLetterStore, DeliveryStore, LinkStore};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{PostgresDeadLetterStore, PostgresDeliveryStore, PostgresLinkStore};
#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{SqliteDeadLetterStore, SqliteDeliveryStore, SqliteLinkStore};
#[cfg(feature = "sqlite")]
use diesel::Connection;
#[cfg(feature = "sqlite")]
use diesel::sqlite::SqliteConnection;

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    link_store: Arc<dyn LinkStore>,
    delivery_store: Arc<dyn DeliveryStore>,
    dead_letter_store: Arc<dyn DeadLetterStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                let link_store = Arc::new(PostgresLinkStore::new(pool.clone()));
                let delivery_store = Arc::new(PostgresDeliveryStore::new(pool.clone()));
                let dead_letter_store = Arc::new(PostgresDeadLetterStore::new(pool.clone()));

                Ok(Self {
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    link_store,
                    delivery_store,
                    dead_letter_store,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config
                    .sqlite_path()
                    .ok_or_else(|| DatabaseError::Connection("missing sqlite path".to_string()))?;
                let path_arc = Arc::new(path.clone());

                let link_store = Arc::new(SqliteLinkStore::new(path_arc.clone()));
                let delivery_store = Arc::new(SqliteDeliveryStore::new(path_arc.clone()));
                let dead_letter_store = Arc::new(SqliteDeadLetterStore::new(path_arc));

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    link_store,
                    delivery_store,
                    dead_letter_store,
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path not initialized".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS crosspost_links (
                    id BIGSERIAL PRIMARY KEY,
                    owner_id BIGINT NOT NULL,
                    telegram_chat_id BIGINT NOT NULL,
                    max_channel_id TEXT NOT NULL,
                    enabled BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    UNIQUE (telegram_chat_id, max_channel_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS delivery_records (
                    id BIGSERIAL PRIMARY KEY,
                    link_id BIGINT NOT NULL,
                    source_post_id BIGINT NOT NULL,
                    max_message_id TEXT,
                    status TEXT NOT NULL,
                    kind TEXT,
                    error TEXT,
                    latency_ms BIGINT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    sent_at TIMESTAMP WITH TIME ZONE,
                    UNIQUE (link_id, source_post_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS dead_letters (
                    id BIGSERIAL PRIMARY KEY,
                    link_id BIGINT NOT NULL,
                    source_post_id BIGINT NOT NULL,
                    error TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_retry_at TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    resolved_at TIMESTAMP WITH TIME ZONE,
                    UNIQUE (link_id, source_post_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_crosspost_links_chat ON crosspost_links(telegram_chat_id)",
                "CREATE INDEX IF NOT EXISTS idx_delivery_records_link ON delivery_records(link_id)",
                "CREATE INDEX IF NOT EXISTS idx_delivery_records_status ON delivery_records(status)",
                "CREATE INDEX IF NOT EXISTS idx_dead_letters_unresolved ON dead_letters(resolved_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = SqliteConnection::establish(&path)
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS crosspost_links (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL,
                    telegram_chat_id INTEGER NOT NULL,
                    max_channel_id TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE (telegram_chat_id, max_channel_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS delivery_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    link_id INTEGER NOT NULL,
                    source_post_id INTEGER NOT NULL,
                    max_message_id TEXT,
                    status TEXT NOT NULL,
                    kind TEXT,
                    error TEXT,
                    latency_ms INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    sent_at TEXT,
                    UNIQUE (link_id, source_post_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS dead_letters (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    link_id INTEGER NOT NULL,
                    source_post_id INTEGER NOT NULL,
                    error TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_retry_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    resolved_at TEXT,
                    UNIQUE (link_id, source_post_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_crosspost_links_chat ON crosspost_links(telegram_chat_id)",
                "CREATE INDEX IF NOT EXISTS idx_delivery_records_link ON delivery_records(link_id)",
                "CREATE INDEX IF NOT EXISTS idx_delivery_records_status ON delivery_records(status)",
                "CREATE INDEX IF NOT EXISTS idx_dead_letters_unresolved ON dead_letters(resolved_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn link_store(&self) -> Arc<dyn LinkStore> {
        self.link_store.clone()
    }

    pub fn delivery_store(&self) -> Arc<dyn DeliveryStore> {
        self.delivery_store.clone()
    }

    pub fn dead_letter_store(&self) -> Arc<dyn DeadLetterStore> {
        self.dead_letter_store.clone()
    }

    #[cfg(feature = "postgres")]
    pub fn pool(&self) -> Option<&Pool> {
        self.postgres_pool.as_ref()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
