/*!
Persistent store.

A single SQLite file owns every durable row: the FSM catalog, the signal
queue, timed signals, plan registry/instances/runs, slice tables, principals
and preferences, and the FSM trace. Repositories expose typed operations;
mutations that must be atomic with the FSM step take an explicit executor so
they can run inside the engine's transaction.

Durability mode is WAL + `synchronous=NORMAL`; foreign keys are enforced.
Embedded migrations run on connect and a migration failure is fatal at boot.
*/

use std::path::Path;
use std::str::FromStr;

use miette::Diagnostic;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::instrument;

pub mod catalog;
pub mod fsm;
pub mod plans;
pub mod principals;
pub mod signal_queue;
pub mod slices;
pub mod timed;

pub use catalog::CatalogRepo;
pub use fsm::FsmRuntimeRepo;
pub use plans::PlanRepo;
pub use principals::PrincipalRepo;
pub use signal_queue::SignalQueueRepo;
pub use slices::SliceRepo;
pub use timed::TimedRepo;

pub type SqliteTx<'t> = sqlx::Transaction<'t, sqlx::Sqlite>;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    #[diagnostic(
        code(nervecore::store::sqlx),
        help("Ensure NERVE_DB_PATH points at a writable location.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failure: {0}")]
    #[diagnostic(
        code(nervecore::store::migrate),
        help("The embedded schema could not be applied; the database may be from a newer build.")
    )]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON serialization error: {0}")]
    #[diagnostic(code(nervecore::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("conflict: {message}")]
    #[diagnostic(code(nervecore::store::conflict))]
    Conflict { message: String },

    #[error("missing persisted field: {0}")]
    #[diagnostic(code(nervecore::store::missing))]
    Missing(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the single relational store. Cheap to clone; all repositories
/// share the underlying pool.
#[derive(Clone)]
pub struct NerveStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for NerveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NerveStore").finish()
    }
}

impl NerveStore {
    /// Open (or create) the store at `path` and apply embedded migrations.
    #[instrument(skip(path))]
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests. Uses a single connection so every query
    /// sees the same database.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Sqlx)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin the transaction unit used by the FSM step: consuming a signal,
    /// writing the trace, advancing the state marker, and persisting side
    /// effects commit together or not at all.
    pub async fn begin(&self) -> Result<SqliteTx<'static>> {
        Ok(self.pool.begin().await?)
    }

    /// Cheap liveness probe used by the run-time health check.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn catalog(&self) -> CatalogRepo {
        CatalogRepo::new(self.pool.clone())
    }

    pub fn fsm(&self) -> FsmRuntimeRepo {
        FsmRuntimeRepo::new(self.pool.clone())
    }

    pub fn signal_queue(&self) -> SignalQueueRepo {
        SignalQueueRepo::new(self.pool.clone())
    }

    pub fn timed(&self) -> TimedRepo {
        TimedRepo::new(self.pool.clone())
    }

    pub fn plans(&self) -> PlanRepo {
        PlanRepo::new(self.pool.clone())
    }

    pub fn slices(&self) -> SliceRepo {
        SliceRepo::new(self.pool.clone())
    }

    pub fn principals(&self) -> PrincipalRepo {
        PrincipalRepo::new(self.pool.clone())
    }
}
