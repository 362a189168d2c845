//! Invalidation fan-out.
//!
//! The shared backend runs exactly one listener thread. It keeps a
//! dedicated connection subscribed to the invalidation channel; every
//! payload is a TID, resolved to the set of zoids that TID committed and
//! pushed into the queue of every live instance. LISTEN/NOTIFY has no
//! replay, so after any reconnect the listener marks every instance for a
//! full refresh instead of guessing at missed TIDs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use postgres::fallible_iterator::FallibleIterator;
use postgres::{Client, NoTls};

use crate::db::schema::INVALIDATION_CHANNEL;

/// Batches buffered beyond this are traded for a full refresh.
const MAX_QUEUED_BATCHES: usize = 1024;

/// How long the listener sleeps in the notification poll before checking
/// for shutdown, and how long it backs off after a connection failure.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) type Registry = Arc<Mutex<HashMap<u64, Arc<InvalQueue>>>>;

/// One instance's pending invalidations.
pub(crate) struct InvalQueue {
    state: Mutex<QueueState>,
}

struct QueueState {
    batches: VecDeque<Vec<u64>>,
    polled_once: bool,
    needs_refresh: bool,
}

impl InvalQueue {
    pub fn new() -> Self {
        InvalQueue {
            state: Mutex::new(QueueState {
                batches: VecDeque::new(),
                polled_once: false,
                needs_refresh: false,
            }),
        }
    }

    pub fn push(&self, zoids: Vec<u64>) {
        let mut state = self.state.lock();
        if state.batches.len() >= MAX_QUEUED_BATCHES {
            // The poller is not keeping up; drop history and make it start
            // cold instead of growing without bound.
            state.batches.pop_front();
            state.needs_refresh = true;
        }
        state.batches.push_back(zoids);
    }

    pub fn mark_refresh(&self) {
        let mut state = self.state.lock();
        state.needs_refresh = true;
        state.batches.clear();
    }

    /// Drain pending invalidations. `None` means the caller's cache must be
    /// treated as cold: first poll ever, overflow, or listener reconnect.
    pub fn poll(&self) -> Option<HashSet<u64>> {
        let mut state = self.state.lock();
        if !state.polled_once || state.needs_refresh {
            state.polled_once = true;
            state.needs_refresh = false;
            state.batches.clear();
            return None;
        }
        let mut zoids = HashSet::new();
        for batch in state.batches.drain(..) {
            zoids.extend(batch);
        }
        Some(zoids)
    }
}

pub(crate) struct Listener {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn spawn(dsn: String, history_preserving: bool, registry: Registry) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("pgjsonb-listener".into())
            .spawn(move || listen_loop(&dsn, history_preserving, &registry, &flag, &ready_tx))
            .expect("spawn listener thread");
        // Wait for the first LISTEN so a commit right after open cannot
        // publish into the void.
        if ready_rx.recv_timeout(Duration::from_secs(5)).is_err() {
            warn!("invalidation listener not subscribed yet; instances will start cold");
        }
        Listener {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("invalidation listener panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(
    dsn: &str,
    history_preserving: bool,
    registry: &Registry,
    shutdown: &AtomicBool,
    ready: &crossbeam_channel::Sender<()>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let mut client = match connect_and_listen(dsn) {
            Ok(client) => client,
            Err(e) => {
                warn!("invalidation listener cannot connect: {e}");
                std::thread::sleep(RECONNECT_BACKOFF);
                continue;
            }
        };
        // Anything published before LISTEN took effect is lost; every
        // instance has to start cold.
        mark_all_refresh(registry);
        let _ = ready.try_send(());
        info!("invalidation listener subscribed to {INVALIDATION_CHANNEL}");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            // The iterator borrows the client, so take one notification at
            // a time and drop the borrow before querying; further
            // notifications stay buffered inside the client meanwhile.
            let next = {
                let mut notifications = client.notifications();
                let mut iter = notifications.timeout_iter(POLL_INTERVAL);
                iter.next()
            };
            match next {
                Ok(Some(notification)) => {
                    let payload = notification.payload();
                    let Ok(tid) = payload.parse::<u64>() else {
                        warn!("ignoring malformed invalidation payload {payload:?}");
                        continue;
                    };
                    match committed_zoids(&mut client, tid, history_preserving) {
                        Ok(zoids) => fan_out(registry, tid, zoids),
                        Err(e) => {
                            warn!("failed to resolve invalidation for tid {tid}: {e}");
                            mark_all_refresh(registry);
                        }
                    }
                }
                Ok(None) => {} // poll timeout; loop around for shutdown
                Err(e) => {
                    warn!("invalidation listener lost its connection: {e}");
                    break; // reconnect
                }
            }
        }
    }
}

fn connect_and_listen(dsn: &str) -> Result<Client, postgres::Error> {
    let mut client = Client::connect(dsn, NoTls)?;
    client.batch_execute(&format!("LISTEN {INVALIDATION_CHANNEL}"))?;
    Ok(client)
}

fn committed_zoids(
    client: &mut Client,
    tid: u64,
    history_preserving: bool,
) -> Result<Vec<u64>, postgres::Error> {
    let sql = if history_preserving {
        // An object overwritten again since `tid` has moved to history; it
        // still belongs to this invalidation.
        "SELECT zoid FROM object_state WHERE tid = $1
         UNION
         SELECT zoid FROM object_history WHERE tid = $1"
    } else {
        "SELECT zoid FROM object_state WHERE tid = $1"
    };
    let rows = client.query(sql, &[&(tid as i64)])?;
    Ok(rows.iter().map(|r| r.get::<_, i64>(0) as u64).collect())
}

fn fan_out(registry: &Registry, tid: u64, zoids: Vec<u64>) {
    let registry = registry.lock();
    debug!("invalidating {} zoids for tid {tid} across {} instances", zoids.len(), registry.len());
    for queue in registry.values() {
        queue.push(zoids.clone());
    }
}

fn mark_all_refresh(registry: &Registry) {
    for queue in registry.lock().values() {
        queue.mark_refresh();
    }
}
