use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

pub mod helpers;
mod migrations;
pub mod models;
pub mod repositories;

use migrations::run_migrations;

pub use models::{Event, EventClassification, EventStatus, QueueEntry, Screenshot};
pub use repositories::events::{EventFilter, MergeOutcome, NewCapture};
pub use repositories::projects::NormalizationReport;
pub use repositories::queue::{AttemptOutcome, ClaimedWork};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Message {
    Run(Job),
    Close,
}

struct StoreThread {
    jobs: mpsc::Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreThread {
    fn drop(&mut self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };

        if self.jobs.send(Message::Close).is_err() {
            warn!("event store thread already gone at shutdown");
        }
        if let Err(err) = handle.join() {
            error!("event store thread panicked: {err:?}");
        }
    }
}

/// Opens the file, applies the pragmas the repositories depend on and brings
/// the schema up to date.
fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;

    // screenshot and queue rows rely on ON DELETE CASCADE
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        warn!("WAL unavailable, staying on the default journal: {err}");
    }

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn serve(mut conn: Connection, jobs: mpsc::Receiver<Message>) {
    while let Ok(Message::Run(job)) = jobs.recv() {
        job(&mut conn);
    }
    info!("event store thread stopped");
}

/// The event store. One SQLite connection lives on a dedicated thread; every
/// call ships a closure to it, so each closure sees the database exclusively
/// and multi-statement work inside one transaction is never interleaved.
#[derive(Clone)]
pub struct Database {
    thread: Arc<StoreThread>,
    path: Arc<PathBuf>,
}

impl Database {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (jobs_tx, jobs_rx) = mpsc::channel::<Message>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_path = path.clone();

        let handle = thread::Builder::new()
            .name("screentrail-db".into())
            .spawn(move || match open_connection(&thread_path) {
                Ok(conn) => {
                    if ready_tx.send(Ok(())).is_ok() {
                        serve(conn, jobs_rx);
                    }
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .context("failed to spawn event store thread")?;

        ready_rx
            .recv()
            .context("event store thread exited during startup")??;
        info!("event store ready at {}", path.display());

        Ok(Self {
            thread: Arc::new(StoreThread {
                jobs: jobs_tx,
                handle: Mutex::new(Some(handle)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Runs `task` on the store thread and waits for its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // the caller may have been cancelled; the work is committed regardless
            let _ = reply_tx.send(task(conn));
        });

        self.thread
            .jobs
            .send(Message::Run(job))
            .map_err(|_| anyhow!("event store thread is not running"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("event store thread dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("nested").join("trail.sqlite3")).unwrap();
        assert!(db.path().exists());

        let tables: Vec<String> = db
            .execute(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();

        assert!(tables.contains(&"events".to_string()));
        assert!(tables.contains(&"screenshots".to_string()));
        assert!(tables.contains(&"queue_entries".to_string()));
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trail.sqlite3");
        {
            let _db = Database::new(path.clone()).unwrap();
        }
        let db = Database::new(path).unwrap();
        let version: i32 = db
            .execute(|conn| {
                Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(version, 1);
    }
}
