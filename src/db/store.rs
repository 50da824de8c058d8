//! Storage-client handle.
//!
//! A [`Store`] is constructed once at process start from a [`Connector`] and
//! passed explicitly to everything that touches the database. It owns an
//! `r2d2` pool whose connections come from the connector; each request checks
//! out its own connection, so requests only contend on SQLite's locks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use r2d2::{ManageConnection, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::info;

use super::retry::{CancelToken, ErrorClass, RetryPolicy};
use crate::config::StorageConfig;
use crate::error::Result;

/// Source of fresh connections (and whatever credential they carry).
pub trait Connector: Send + Sync {
    fn connect(&self) -> rusqlite::Result<Connection>;

    /// Human-readable target for log lines.
    fn describe(&self) -> String;
}

/// Opens a SQLite database file in WAL mode with foreign keys enforced.
pub struct SqliteConnector {
    path: PathBuf,
    manager: SqliteConnectionManager,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        let path = path.into();
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        });
        Self { path, manager }
    }
}

impl Connector for SqliteConnector {
    fn connect(&self) -> rusqlite::Result<Connection> {
        self.manager.connect()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Adapts a [`Connector`] to the pool's connection manager.
pub struct ConnectorManager(Arc<dyn Connector>);

impl ManageConnection for ConnectorManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        self.0.connect()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("")
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

type Pooled = PooledConnection<ConnectorManager>;

pub struct Store {
    connector: Arc<dyn Connector>,
    pool: Pool<ConnectorManager>,
    policy: RetryPolicy,
}

impl Store {
    pub fn open(connector: Box<dyn Connector>, storage: &StorageConfig) -> Result<Self> {
        let connector: Arc<dyn Connector> = Arc::from(connector);
        let pool = Pool::builder()
            .max_size(storage.pool_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(storage.busy_timeout().max(Duration::from_secs(1)))
            .build(ConnectorManager(connector.clone()))?;
        // Fail at startup rather than on the first request.
        drop(pool.get()?);
        info!(
            "Opened catalog store at {} (pool of {})",
            connector.describe(),
            pool.max_size()
        );
        Ok(Self {
            connector,
            pool,
            policy: storage.retry_policy(),
        })
    }

    /// Run `op` on a pooled connection under the retry policy.
    ///
    /// The connection goes back to the pool before any backoff sleep. After
    /// an expired authorization the checked-out connection is replaced by a
    /// fresh one from the connector, and the stale handle is closed.
    pub fn run<T>(
        &self,
        cancel: &CancelToken,
        mut op: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let classifier = self.policy.classifier;
        let mut slot: Option<Pooled> = None;

        self.policy.execute(
            cancel,
            &mut slot,
            |slot| {
                let conn = match slot.take() {
                    Some(conn) => conn,
                    None => self.pool.get()?,
                };
                let conn = slot.insert(conn);
                let result = op(&mut **conn);
                if let Err(err) = &result {
                    if classifier(err) != ErrorClass::AuthExpired {
                        *slot = None;
                    }
                }
                result
            },
            |slot| {
                let fresh = self.connector.connect()?;
                let mut conn = match slot.take() {
                    Some(conn) => conn,
                    None => self.pool.get()?,
                };
                *conn = fresh;
                *slot = Some(conn);
                info!("Reconnected catalog store at {}", self.connector.describe());
                Ok(())
            },
        )
    }

    /// Run `op` inside a deferred (read) transaction so multi-statement
    /// reads observe one snapshot.
    pub fn read<T>(
        &self,
        cancel: &CancelToken,
        mut op: impl FnMut(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.run(cancel, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run `op` inside an immediate (write) transaction. Either every
    /// statement in `op` commits or none does.
    pub fn write<T>(
        &self,
        cancel: &CancelToken,
        mut op: impl FnMut(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.run(cancel, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use rusqlite::ffi;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    struct CountingConnector {
        inner: SqliteConnector,
        connects: Arc<AtomicU32>,
    }

    impl Connector for CountingConnector {
        fn connect(&self) -> rusqlite::Result<Connection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect()
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    fn fast_storage(busy_timeout_ms: u64) -> StorageConfig {
        StorageConfig {
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            busy_timeout_ms,
            ..StorageConfig::default()
        }
    }

    fn open_store(path: &std::path::Path, storage: &StorageConfig) -> Store {
        let connector = SqliteConnector::new(path, storage.busy_timeout());
        Store::open(Box::new(connector), storage).unwrap()
    }

    fn count_rows(store: &Store) -> i64 {
        store
            .read(&CancelToken::new(), |tx| {
                Ok(tx.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
            })
            .unwrap()
    }

    #[test]
    fn test_auth_expiry_reconnects_through_connector() {
        let dir = tempfile::tempdir().unwrap();
        let connects = Arc::new(AtomicU32::new(0));
        let connector = CountingConnector {
            inner: SqliteConnector::new(dir.path().join("store.db"), Duration::from_millis(100)),
            connects: connects.clone(),
        };
        let store = Store::open(Box::new(connector), &StorageConfig::default()).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        let mut first = true;
        let value = store
            .run(&CancelToken::new(), |conn| {
                if first {
                    first = false;
                    return Err(CatalogError::Storage(rusqlite::Error::SqliteFailure(
                        ffi::Error::new(ffi::SQLITE_AUTH),
                        None,
                    )));
                }
                Ok(conn.query_row("SELECT 41 + 1", [], |row| row.get::<_, i64>(0))?)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("store.db"), &StorageConfig::default());
        let cancel = CancelToken::new();

        store
            .run(&cancel, |conn| {
                conn.execute_batch("CREATE TABLE t (v INTEGER)")?;
                Ok(())
            })
            .unwrap();

        let result: Result<()> = store.write(&cancel, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Err(CatalogError::validation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(count_rows(&store), 0);
    }

    #[test]
    fn test_reads_run_alongside_an_open_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("store.db"), &StorageConfig::default());
        let store = &store;
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        std::thread::scope(|s| {
            let slow = s.spawn(move || {
                store.read(&CancelToken::new(), |tx| {
                    let _: i64 = tx.query_row("SELECT 1", [], |r| r.get(0))?;
                    started_tx.send(()).ok();
                    // True only if the other read finished while this one was open.
                    Ok(release_rx.recv_timeout(Duration::from_secs(5)).is_ok())
                })
            });

            started_rx.recv().unwrap();
            let value: i64 = store
                .read(&CancelToken::new(), |tx| Ok(tx.query_row("SELECT 2", [], |r| r.get(0))?))
                .unwrap();
            assert_eq!(value, 2);
            release_tx.send(()).unwrap();

            assert!(slow.join().unwrap().unwrap());
        });
    }

    #[test]
    fn test_external_writer_blocks_writes_but_not_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = fast_storage(50);
        let store = open_store(&path, &storage);
        let cancel = CancelToken::new();
        store
            .run(&cancel, |conn| {
                conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t (v) VALUES (1);")?;
                Ok(())
            })
            .unwrap();

        let external = Connection::open(&path).unwrap();
        external
            .execute_batch("BEGIN IMMEDIATE; INSERT INTO t (v) VALUES (2);")
            .unwrap();

        // WAL readers see the last committed snapshot.
        assert_eq!(count_rows(&store), 1);

        let blocked: Result<()> = store.write(&cancel, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (3)", [])?;
            Ok(())
        });
        match blocked {
            Err(CatalogError::Unavailable { attempts, .. }) => assert_eq!(attempts, storage.max_attempts),
            other => panic!("expected Unavailable, got {:?}", other),
        }

        external.execute_batch("COMMIT").unwrap();
        store
            .write(&cancel, |tx| {
                tx.execute("INSERT INTO t (v) VALUES (3)", [])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count_rows(&store), 3);
    }
}
