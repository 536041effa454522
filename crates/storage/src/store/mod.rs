#![forbid(unsafe_code)]

mod error;
mod jobs;
mod requests;
mod retry;
mod schema;

pub use error::StoreError;
pub use requests::*;
pub use retry::RetryPolicy;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// SQLite's own wait on a locked database before reporting BUSY.
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(2_000),
            retry: RetryPolicy::default(),
        }
    }
}

/// Job store over one SQLite file shared by every supervisor, worker and
/// client process. Each process opens its own handle.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    db_path: PathBuf,
    config: StoreConfig,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(config.busy_timeout)?;

        let mut store = Self {
            conn,
            db_path,
            config,
        };
        let retry = store.config.retry;
        retry.run("open", || {
            store
                .conn
                .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            Ok(())
        })?;
        store.write("install_schema", |tx| schema::install(tx))?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Runs `op` in a `BEGIN IMMEDIATE` transaction, retrying the whole
    /// transaction while another process holds the write lock.
    fn write<T>(
        &mut self,
        op: &'static str,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let retry = self.config.retry;
        let conn = &mut self.conn;
        retry.run(op, || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn read<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.config.retry.run(op, || f(&self.conn))
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
