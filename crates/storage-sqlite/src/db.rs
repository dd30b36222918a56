//! Connection pool, embedded migrations, and the serialized write actor.

use std::sync::Arc;
use std::thread;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::error;

use fintrack_core::{Error, Result};

use crate::errors::StorageError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Durability and contention pragmas applied to every pooled connection.
#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Opens (or creates) the sqlite database at `database_url`, runs pending
/// migrations, and returns the shared pool.
pub fn create_pool(database_url: &str) -> Result<Arc<DbPool>> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(8)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .map_err(|e| Error::QueueStorage(format!("failed to open '{database_url}': {e}")))?;

    let mut conn = pool.get().map_err(StorageError::from)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(Arc::new(pool))
}

pub fn get_connection(pool: &DbPool) -> Result<DbConnection> {
    pool.get().map_err(|e| StorageError::from(e).into())
}

type WriteJob = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

/// Handle to the dedicated write thread. All queue mutations flow through it,
/// so writes are serialized and committed before [`WriteHandle::exec`]
/// returns.
#[derive(Clone)]
pub struct WriteHandle {
    sender: std::sync::mpsc::Sender<WriteJob>,
}

impl WriteHandle {
    pub async fn exec<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(Box::new(move |conn: &mut SqliteConnection| {
                let _ = done_tx.send(job(conn));
            }))
            .map_err(|_| Error::QueueStorage("write actor is no longer running".to_string()))?;
        done_rx
            .await
            .map_err(|_| Error::QueueStorage("write actor dropped the job".to_string()))?
    }
}

/// Spawns the write actor thread for `pool`. The thread exits once every
/// `WriteHandle` clone has been dropped.
pub fn spawn_write_actor(pool: Arc<DbPool>) -> WriteHandle {
    let (sender, receiver) = std::sync::mpsc::channel::<WriteJob>();
    thread::Builder::new()
        .name("fintrack-sqlite-writer".to_string())
        .spawn(move || {
            while let Ok(job) = receiver.recv() {
                match pool.get() {
                    Ok(mut conn) => job(&mut conn),
                    Err(e) => {
                        // Dropping the job closes its completion channel; the
                        // caller sees a queue-storage error.
                        error!("write actor could not get a connection: {e}");
                    }
                }
            }
        })
        .expect("Failed to spawn the sqlite write actor thread");
    WriteHandle { sender }
}
