//! Per-session output taps.
//!
//! `pipe-pane` is per-pane, not per-consumer, so the manager is the one
//! reference counter: the first subscriber activates the tap into a private
//! spool file and starts a tail task; the last one deactivates it and
//! removes the spool. Fan-out is best effort per subscriber: a full channel
//! drops the chunk rather than stalling the reader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::MuxCommands;
use crate::error::{AdapterError, Result};

/// Buffered chunks per subscriber before drops set in.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Tail read granularity.
const READ_CHUNK: usize = 4096;

/// Poll interval once the spool is drained to EOF.
const TAIL_IDLE: Duration = Duration::from_millis(50);

type SubscriberMap = Arc<StdMutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>>;

/// One fan-out subscription. Dropping the receiver alone does not release
/// the tap; callers must pair it with `unsubscribe(name, id)`.
#[derive(Debug)]
pub struct OutputSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

struct PipeEntry {
    subscribers: SubscriberMap,
    spool: PathBuf,
    stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

/// Reference-counted pipe-pane taps with per-subscriber fan-out.
pub struct PipePaneManager {
    mux: Arc<dyn MuxCommands>,
    spool_root: PathBuf,
    entries: Mutex<HashMap<String, PipeEntry>>,
    next_id: AtomicU64,
}

/// Default spool directory, private to this process.
pub fn default_spool_root() -> PathBuf {
    std::env::temp_dir().join(format!("tmux-adapter-{}", std::process::id()))
}

impl PipePaneManager {
    pub fn new(mux: Arc<dyn MuxCommands>, spool_root: PathBuf) -> Self {
        Self {
            mux,
            spool_root,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a subscriber to the session's byte stream, activating the
    /// pipe-pane tap if this is the first one.
    pub async fn subscribe(&self, name: &str) -> Result<OutputSubscription> {
        let mut entries = self.entries.lock().await;

        if !entries.contains_key(name) {
            let entry = self.activate(name).await?;
            entries.insert(name.to_string(), entry);
        }

        let entry = entries.get_mut(name).expect("entry just ensured");
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entry
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        debug!(session = name, id, "output subscriber attached");
        Ok(OutputSubscription { id, rx })
    }

    /// Detach one subscriber; the last one tears the tap down.
    pub async fn unsubscribe(&self, name: &str, id: u64) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(name) else {
            return;
        };

        let remaining = {
            let mut subs = entry.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subs.remove(&id);
            subs.len()
        };
        debug!(session = name, id, remaining, "output subscriber detached");

        if remaining == 0 {
            let entry = entries.remove(name).expect("entry present");
            self.deactivate(name, entry).await;
        }
    }

    /// Close every subscriber of a session (agent removed or shutdown).
    pub async fn force_unsubscribe(&self, name: &str) {
        let entry = self.entries.lock().await.remove(name);
        if let Some(entry) = entry {
            entry
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            self.deactivate(name, entry).await;
        }
    }

    /// Tear down every active tap.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        for name in names {
            self.force_unsubscribe(&name).await;
        }
    }

    /// Chunks dropped so far for a session's slow subscribers.
    pub async fn dropped_chunks(&self, name: &str) -> u64 {
        self.entries
            .lock()
            .await
            .get(name)
            .map(|e| e.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn activate(&self, name: &str) -> Result<PipeEntry> {
        tokio::fs::create_dir_all(&self.spool_root).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &self.spool_root,
                std::fs::Permissions::from_mode(0o700),
            );
        }

        let spool = self.spool_root.join(format!("{}.out", spool_stem(name)));
        // Pre-create so the tail task always has a file to open.
        tokio::fs::write(&spool, b"").await?;

        let command = format!("cat >> '{}'", spool.display());
        if let Err(e) = self.mux.pipe_pane_start(name, &command).await {
            let _ = tokio::fs::remove_file(&spool).await;
            return Err(AdapterError::CommandFailed(format!(
                "pipe-pane start for {name}: {e}"
            )));
        }

        let subscribers: SubscriberMap = Arc::new(StdMutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let reader = tokio::spawn(tail_spool(
            name.to_string(),
            spool.clone(),
            Arc::clone(&subscribers),
            Arc::clone(&stop),
            Arc::clone(&dropped),
        ));

        info!(session = name, spool = %spool.display(), "pipe-pane activated");
        Ok(PipeEntry {
            subscribers,
            spool,
            stop,
            reader,
            dropped,
        })
    }

    async fn deactivate(&self, name: &str, entry: PipeEntry) {
        if let Err(e) = self.mux.pipe_pane_stop(name).await {
            warn!(session = name, error = %e, "pipe-pane stop failed");
        }
        entry.stop.store(true, Ordering::Relaxed);
        entry.reader.abort();
        let _ = tokio::fs::remove_file(&entry.spool).await;

        let dropped = entry.dropped.load(Ordering::Relaxed);
        info!(session = name, dropped, "pipe-pane deactivated");
    }
}

fn spool_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Tail the spool file and fan chunks out to every registered subscriber in
/// emission order. Never blocks on a subscriber: full channels lose the
/// chunk and the loss is counted.
async fn tail_spool(
    session: String,
    spool: PathBuf,
    subscribers: SubscriberMap,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    let mut file = match tokio::fs::File::open(&spool).await {
        Ok(f) => f,
        Err(e) => {
            warn!(session = %session, error = %e, "spool open failed");
            return;
        }
    };

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match file.read(&mut buf).await {
            Ok(0) => tokio::time::sleep(TAIL_IDLE).await,
            Ok(n) => {
                let chunk = &buf[..n];
                let subs: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
                    let guard = subscribers.lock().unwrap_or_else(|e| e.into_inner());
                    guard.iter().map(|(id, tx)| (*id, tx.clone())).collect()
                };
                for (id, tx) in subs {
                    match tx.try_send(chunk.to_vec()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!(session = %session, subscriber = id, total, "slow subscriber, chunk dropped");
                        }
                        // Receiver went away; unsubscribe cleans the map up.
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
            Err(e) => {
                warn!(session = %session, error = %e, "spool read failed");
                return;
            }
        }
    }
}
