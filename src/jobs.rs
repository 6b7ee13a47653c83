use chrono::Local;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::audit::SqliteAudit;
use crate::db;
use crate::reconcile::{reconcile, ReconcileRequest};
use crate::store::{load_timetable, SqliteStore};

/// Background reconciliation queue, keyed by classroom id.
///
/// One worker thread with its own connection drains the channel, so at most
/// one reconciliation is ever in flight; the pending set coalesces repeated
/// enqueues for the same classroom while a job is still queued. Worker
/// failures go to stderr and never take the process down.
pub struct ReconcileQueue {
    tx: Option<Sender<String>>,
    pending: Arc<Mutex<HashSet<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl ReconcileQueue {
    pub fn start(workspace: PathBuf) -> Self {
        let (tx, rx) = channel::<String>();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let worker_pending = Arc::clone(&pending);
        let worker = std::thread::spawn(move || {
            let conn = match db::open_db(&workspace) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("reconcile worker: cannot open workspace db: {e:?}");
                    return;
                }
            };
            while let Ok(classroom_id) = rx.recv() {
                if let Ok(mut set) = worker_pending.lock() {
                    set.remove(&classroom_id);
                }
                match run_one(&conn, &classroom_id) {
                    Ok(()) => {}
                    Err(e) => {
                        eprintln!("reconcile worker: classroom {classroom_id}: {e:?}");
                    }
                }
            }
        });
        ReconcileQueue {
            tx: Some(tx),
            pending,
            worker: Some(worker),
        }
    }

    pub fn enqueue(&self, classroom_id: &str) {
        let queued = self
            .pending
            .lock()
            .map(|mut set| set.insert(classroom_id.to_string()))
            .unwrap_or(false);
        if !queued {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(classroom_id.to_string()).is_err() {
                if let Ok(mut set) = self.pending.lock() {
                    set.remove(classroom_id);
                }
            }
        }
    }
}

impl Drop for ReconcileQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_one(conn: &rusqlite::Connection, classroom_id: &str) -> anyhow::Result<()> {
    let Some(timetable) = load_timetable(conn, classroom_id)? else {
        // Timetable deleted between enqueue and run; nothing to do.
        return Ok(());
    };
    let store = SqliteStore::new(conn);
    let audit = SqliteAudit::new(conn);
    reconcile(
        &store,
        &audit,
        &ReconcileRequest {
            timetable: &timetable,
            template: &timetable.value,
            current_week_only: true,
            disable_logging: false,
            as_of: Local::now().date_naive(),
        },
    )?;
    Ok(())
}
