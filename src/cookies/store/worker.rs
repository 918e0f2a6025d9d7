use std::path::PathBuf;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::cookies::cookie::Cookie;
use crate::cookies::scheduler::DeferredTask;
use crate::cookies::store::sqlite::CookieTable;
use crate::cookies::store::PendingQueue;

/// Requests posted from the manager's thread to the store worker.
#[derive(Debug)]
pub enum StoreCommand {
    /// Open the table; with `load` set, flush and reply with every row.
    Open {
        path: PathBuf,
        load: Option<oneshot::Sender<Vec<Cookie>>>,
    },
    /// New writes were queued; arm the coalescing timer.
    ScheduleFlush,
    /// Flush now, disarming the timer first.
    Flush { reply: Option<oneshot::Sender<()>> },
    /// Flush, then read rows (`limit == 0` means all).
    Load {
        limit: usize,
        reply: oneshot::Sender<Vec<Cookie>>,
    },
    RemoveAll { reply: oneshot::Sender<()> },
    /// Final flush; the worker exits afterwards.
    Shutdown,
}

/// Owns the durable table. Lives on the dedicated store thread.
pub struct StoreWorker {
    cmd_rx: mpsc::UnboundedReceiver<StoreCommand>,
    pending: PendingQueue,
    table: Option<CookieTable>,
    flush_timer: DeferredTask,
}

impl StoreWorker {
    pub fn new(
        cmd_rx: mpsc::UnboundedReceiver<StoreCommand>,
        pending: PendingQueue,
        flush_delay: Duration,
    ) -> Self {
        Self {
            cmd_rx,
            pending,
            table: None,
            flush_timer: DeferredTask::new(flush_delay),
        }
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self.flush_timer.deadline();
            let sleep_until = tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => {
                            // Every handle is gone without an explicit shutdown.
                            self.flush();
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    self.flush();
                }
            }
        }

        debug!("Cookie store worker stopped");
    }

    /// Returns `false` when the worker must stop.
    fn handle_command(&mut self, cmd: StoreCommand) -> bool {
        match cmd {
            StoreCommand::Open { path, load } => {
                self.open(path);
                if let Some(reply) = load {
                    self.flush();
                    let _ = reply.send(self.load(0));
                }
            }
            StoreCommand::ScheduleFlush => {
                self.flush_timer.arm();
            }
            StoreCommand::Flush { reply } => {
                self.flush();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            StoreCommand::Load { limit, reply } => {
                self.flush();
                let _ = reply.send(self.load(limit));
            }
            StoreCommand::RemoveAll { reply } => {
                self.remove_all();
                let _ = reply.send(());
            }
            StoreCommand::Shutdown => {
                self.flush();
                return false;
            }
        }

        true
    }

    fn open(&mut self, path: PathBuf) {
        if self.table.is_some() {
            return;
        }

        match CookieTable::open(&path) {
            Ok(table) => {
                info!("Opened cookie database {}", path.display());
                self.table = Some(table);
            }
            Err(e) => error!("Cannot open cookie database {}: {}", path.display(), e),
        }
    }

    /// Writes out everything queued so far. The queue is always left empty.
    fn flush(&mut self) {
        self.flush_timer.disarm();

        let batch = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        if batch.is_empty() {
            return;
        }

        let Some(table) = &self.table else {
            warn!("Cookie database unavailable, dropping {} queued writes", batch.len());
            return;
        };

        let total = batch.len();
        match table.write_batch(batch) {
            Ok(applied) => debug!("Flushed {}/{} cookie writes", applied, total),
            Err(e) => error!("Cookie flush failed: {}", e),
        }
    }

    fn load(&self, limit: usize) -> Vec<Cookie> {
        let Some(table) = &self.table else {
            return Vec::new();
        };

        table.load(limit).unwrap_or_else(|e| {
            error!("Cannot load cookies: {}", e);
            Vec::new()
        })
    }

    fn remove_all(&mut self) {
        self.flush_timer.disarm();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if let Some(table) = &self.table {
            if let Err(e) = table.delete_all() {
                error!("Cannot clear cookie database: {}", e);
            }
        }
    }
}
