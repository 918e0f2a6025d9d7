//! Asynchronous write-behind cookie persistence.
//!
//! A [`CookieBackingStore`] is the manager's handle to a dedicated worker
//! thread that exclusively owns the SQLite [`CookieTable`](sqlite::CookieTable).
//!
//! ## Design
//! - `insert` / `update` / `remove` never touch the table. They append a
//!   [`PendingWrite`] to a mutex-guarded queue and ask the worker to arm its
//!   coalescing timer, which is a no-op when already armed.
//! - When the timer fires (or on a forced flush) the worker swaps the whole
//!   queue out under the lock and applies it in one transaction. A failing row
//!   is logged and skipped; the rest still commits.
//! - Reads (`get_cookies`, `open_and_load_synchronously`) flush first, so they
//!   observe every write queued before them.
//! - If the database cannot be opened, every operation quietly degrades to a
//!   no-op returning nothing.
//!
//! ## Concurrency
//! The worker runs a single-threaded `tokio` runtime on its own OS thread.
//! Commands travel over an unbounded `mpsc` channel; blocking calls wait on a
//! `oneshot` reply and must not be made from inside an async context (use the
//! `async` variants there). `shutdown`, and therefore dropping the handle,
//! joins the worker thread instead and may run anywhere.
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use gosub_cookies::cookies::{Cookie, CookieBackingStore};
//!
//! let mut store = CookieBackingStore::spawn(Duration::from_secs(2)).unwrap();
//! let restored = store.open_and_load_synchronously("cookies.db");
//!
//! let mut c = Cookie::new("id", "1", "example.com", "/", "https", 0);
//! c.expiry = Some(4_102_444_800_000);
//! store.insert(&c);
//! store.shutdown();
//! ```

mod sqlite;
mod worker;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{error, warn};
use tokio::sync::{mpsc, oneshot};

use crate::cookies::cookie::Cookie;
use crate::errors::StoreError;
use worker::{StoreCommand, StoreWorker};

pub use sqlite::CookieTable;

/// What a queued write does to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Insert,
    Update,
    Delete,
}

/// One queued write.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub cookie: Cookie,
    pub action: WriteAction,
}

/// The queue shared between the manager's thread and the worker.
pub(crate) type PendingQueue = Arc<Mutex<Vec<PendingWrite>>>;

/// Handle to the cookie persistence worker.
pub struct CookieBackingStore {
    cmd_tx: mpsc::UnboundedSender<StoreCommand>,
    pending: PendingQueue,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for CookieBackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieBackingStore")
            .field("pending", &self.pending_len())
            .field("running", &self.join_handle.is_some())
            .finish()
    }
}

impl CookieBackingStore {
    /// Starts the worker thread. Writes are coalesced for `flush_delay`.
    pub fn spawn(flush_delay: Duration) -> Result<Self, StoreError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let pending: PendingQueue = Arc::new(Mutex::new(Vec::new()));

        let worker_pending = pending.clone();
        let join_handle = thread::Builder::new()
            .name("cookie-store".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Cannot start cookie store runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(StoreWorker::new(cmd_rx, worker_pending, flush_delay).run());
            })?;

        Ok(Self {
            cmd_tx,
            pending,
            join_handle: Some(join_handle),
        })
    }

    fn send(&self, cmd: StoreCommand) -> Result<(), StoreError> {
        self.cmd_tx.send(cmd).map_err(|_| StoreError::WorkerGone)
    }

    fn enqueue(&self, cookie: &Cookie, action: WriteAction) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingWrite {
                cookie: cookie.clone(),
                action,
            });

        if let Err(e) = self.send(StoreCommand::ScheduleFlush) {
            warn!("Cannot schedule cookie flush: {}", e);
        }
    }

    /// Number of writes waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Opens the database in the background.
    pub fn open(&self, path: impl Into<PathBuf>) {
        let cmd = StoreCommand::Open {
            path: path.into(),
            load: None,
        };
        if let Err(e) = self.send(cmd) {
            error!("Cannot open cookie database: {}", e);
        }
    }

    /// Opens the database and blocks until every stored cookie is read back.
    pub fn open_and_load_synchronously(&self, path: impl Into<PathBuf>) -> Vec<Cookie> {
        let (tx, rx) = oneshot::channel();
        let cmd = StoreCommand::Open {
            path: path.into(),
            load: Some(tx),
        };

        match self.send(cmd) {
            Ok(()) => rx.blocking_recv().unwrap_or_default(),
            Err(e) => {
                error!("Cannot load cookie database: {}", e);
                Vec::new()
            }
        }
    }

    pub fn insert(&self, cookie: &Cookie) {
        self.enqueue(cookie, WriteAction::Insert);
    }

    pub fn update(&self, cookie: &Cookie) {
        self.enqueue(cookie, WriteAction::Update);
    }

    pub fn remove(&self, cookie: &Cookie) {
        self.enqueue(cookie, WriteAction::Delete);
    }

    /// Flushes every queued write and waits for the commit.
    pub fn flush_synchronously(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(StoreCommand::Flush { reply: Some(tx) }).is_ok() {
            let _ = rx.blocking_recv();
        }
    }

    /// Async variant of [`flush_synchronously`](Self::flush_synchronously).
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreCommand::Flush { reply: Some(tx) })?;
        rx.await.map_err(|_| StoreError::WorkerGone)
    }

    /// Reads stored cookies, blocking. With `limit > 0` only the `limit` least
    /// recently accessed ones are returned.
    pub fn get_cookies(&self, limit: usize) -> Vec<Cookie> {
        let (tx, rx) = oneshot::channel();
        match self.send(StoreCommand::Load { limit, reply: tx }) {
            Ok(()) => rx.blocking_recv().unwrap_or_default(),
            Err(e) => {
                error!("Cannot read cookie database: {}", e);
                Vec::new()
            }
        }
    }

    /// Async variant of [`get_cookies`](Self::get_cookies).
    pub async fn load(&self, limit: usize) -> Result<Vec<Cookie>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreCommand::Load { limit, reply: tx })?;
        rx.await.map_err(|_| StoreError::WorkerGone)
    }

    /// Drops queued writes and deletes every stored cookie, blocking.
    pub fn remove_all(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let (tx, rx) = oneshot::channel();
        if self.send(StoreCommand::RemoveAll { reply: tx }).is_ok() {
            let _ = rx.blocking_recv();
        }
    }

    /// Final flush, then stops and joins the worker. Idempotent.
    ///
    /// Unlike the other blocking calls this is safe inside an async context:
    /// it waits by joining the worker thread, which exits right after the
    /// flush, rather than on a `oneshot` reply.
    pub fn shutdown(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };

        if let Err(e) = self.send(StoreCommand::Shutdown) {
            warn!("Cannot stop cookie store worker: {}", e);
        }

        if join_handle.join().is_err() {
            error!("Cookie store worker panicked");
        }
    }
}

impl Drop for CookieBackingStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistent(name: &str, value: &str) -> Cookie {
        let mut c = Cookie::new(name, value, "example.com", "/", "http", 1_000);
        c.expiry = Some(9_000_000_000_000);
        c
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn writes_are_queued_until_flush() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        store.open(dir.path().join("cookies.db"));

        store.insert(&persistent("a", "1"));
        store.insert(&persistent("b", "2"));
        assert_eq!(store.pending_len(), 2);

        store.flush_synchronously();
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.get_cookies(0).len(), 2);
    }

    #[test]
    fn queued_actions_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        store.open(dir.path().join("cookies.db"));

        let mut c = persistent("a", "1");
        store.insert(&c);
        c.value = "2".into();
        store.update(&c);
        store.remove(&persistent("a", "ignored"));
        store.insert(&persistent("b", "3"));

        let rows = store.get_cookies(0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "b");
    }

    #[test]
    fn coalescing_timer_flushes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieBackingStore::spawn(Duration::from_millis(20)).unwrap();
        store.open(dir.path().join("cookies.db"));

        store.insert(&persistent("a", "1"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.pending_len() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn reload_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.db");

        let mut c = persistent("id", "42");
        c.secure = true;
        {
            let mut store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
            store.open_and_load_synchronously(&path);
            store.insert(&c);
            store.shutdown();
        }

        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        let rows = store.open_and_load_synchronously(&path);
        assert_eq!(rows, vec![c]);
    }

    #[test]
    fn remove_all_drops_queue_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        store.open(dir.path().join("cookies.db"));

        store.insert(&persistent("a", "1"));
        store.flush_synchronously();
        store.insert(&persistent("b", "2"));

        store.remove_all();
        assert_eq!(store.pending_len(), 0);
        assert!(store.get_cookies(0).is_empty());
    }

    #[test]
    fn unavailable_database_degrades_to_noop() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        // A directory cannot be opened as a database file.
        store.open(dir.path());

        store.insert(&persistent("a", "1"));
        store.flush_synchronously();
        assert_eq!(store.pending_len(), 0);
        assert!(store.get_cookies(0).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_variants_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        store.open(dir.path().join("cookies.db"));

        store.insert(&persistent("a", "1"));
        store.flush().await.unwrap();
        let rows = store.load(0).await.unwrap();
        assert_eq!(rows.len(), 1);

        drop(store);
    }

    #[tokio::test]
    async fn dropping_inside_runtime_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.db");

        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        store.open(&path);
        store.insert(&persistent("a", "1"));
        drop(store);

        let store = CookieBackingStore::spawn(Duration::from_secs(3600)).unwrap();
        store.open(&path);
        let rows = store.load(0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "a");
    }
}
