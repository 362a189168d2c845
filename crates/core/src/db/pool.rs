//! Bounded connection pool.
//!
//! A lending pool in the blocking flavor: `lease` hands out a guard that
//! returns the connection on drop. The idle list is LIFO so a busy storage
//! keeps reusing warm connections while the tail of the pool ages out of
//! the server's cache on its own.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use postgres::{Client, NoTls};

use crate::error::{Result, StorageError};

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    dsn: String,
    max_size: usize,
    timeout: Duration,
    state: Mutex<PoolState>,
    returned: Condvar,
}

struct PoolState {
    idle: Vec<Client>,
    /// Connections in existence, leased or idle (plus reservations while a
    /// connect is in flight).
    open: usize,
    draining: bool,
}

impl ConnectionPool {
    /// Open a pool, eagerly connecting `min_size` clients so a bad DSN
    /// fails here rather than on first use.
    pub fn open(dsn: &str, min_size: usize, max_size: usize, timeout: Duration) -> Result<Self> {
        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                dsn: dsn.to_owned(),
                max_size: max_size.max(1),
                timeout,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                    draining: false,
                }),
                returned: Condvar::new(),
            }),
        };
        for _ in 0..min_size.min(max_size.max(1)) {
            let client = pool.inner.connect()?;
            let mut state = pool.inner.state.lock();
            state.idle.push(client);
            state.open += 1;
        }
        Ok(pool)
    }

    /// Lease a connection, blocking up to the pool timeout when every slot
    /// is taken.
    pub fn lease(&self) -> Result<PooledConn> {
        let deadline = Instant::now() + self.inner.timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.draining {
                return Err(StorageError::Closed);
            }
            if let Some(client) = state.idle.pop() {
                if client.is_closed() {
                    // Server went away while the connection sat idle.
                    state.open -= 1;
                    continue;
                }
                return Ok(PooledConn::new(client, self.inner.clone()));
            }
            if state.open < self.inner.max_size {
                // Reserve the slot, then connect without holding the lock.
                state.open += 1;
                drop(state);
                match self.inner.connect() {
                    Ok(client) => return Ok(PooledConn::new(client, self.inner.clone())),
                    Err(e) => {
                        let mut state = self.inner.state.lock();
                        state.open -= 1;
                        self.inner.returned.notify_one();
                        return Err(e);
                    }
                }
            }
            if self.inner.returned.wait_until(&mut state, deadline).timed_out() {
                return Err(StorageError::PoolExhausted);
            }
        }
    }

    /// Close idle connections and wait for every lease to come home.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock();
        state.draining = true;
        let idle = std::mem::take(&mut state.idle);
        state.open -= idle.len();
        drop(state);
        drop(idle);

        let mut state = self.inner.state.lock();
        while state.open > 0 {
            self.inner.returned.wait(&mut state);
        }
        debug!("connection pool drained");
    }
}

impl PoolInner {
    fn connect(&self) -> Result<Client> {
        Ok(Client::connect(&self.dsn, NoTls)?)
    }
}

/// A leased connection. Dropping it returns the connection to the pool; if
/// a transaction was left open on an error path, it is rolled back first so
/// the next lessee starts clean.
pub struct PooledConn {
    client: Option<Client>,
    in_tx: bool,
    pool: Arc<PoolInner>,
}

impl PooledConn {
    fn new(client: Client, pool: Arc<PoolInner>) -> Self {
        PooledConn {
            client: Some(client),
            in_tx: false,
            pool,
        }
    }

    /// Note that an explicit transaction was opened on this connection.
    /// Cleared by [`Self::mark_idle`]; a guard dropped while marked rolls
    /// the transaction back.
    pub fn mark_in_tx(&mut self) {
        self.in_tx = true;
    }

    pub fn mark_idle(&mut self) {
        self.in_tx = false;
    }

    /// Run `f` inside a REPEATABLE READ read-only transaction.
    pub fn read_snapshot<T>(&mut self, f: impl FnOnce(&mut Client) -> Result<T>) -> Result<T> {
        let client = self.client.as_mut().expect("connection present until drop");
        client.batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY")?;
        self.in_tx = true;
        let res = f(client);
        let end = if res.is_ok() { "COMMIT" } else { "ROLLBACK" };
        match client.batch_execute(end) {
            Ok(()) => self.in_tx = false,
            Err(e) => {
                // Leave in_tx set; the drop path discards the connection.
                warn!("failed to {end} read snapshot: {e}");
                if res.is_ok() {
                    return Err(e.into());
                }
            }
        }
        res
    }
}

impl Deref for PooledConn {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let mut client = self.client.take().expect("double drop");
        let mut broken = client.is_closed();
        if !broken && self.in_tx {
            if let Err(e) = client.batch_execute("ROLLBACK") {
                warn!("rollback on lease return failed, discarding connection: {e}");
                broken = true;
            }
        }
        let mut state = self.pool.state.lock();
        if broken || state.draining {
            state.open -= 1;
        } else {
            state.idle.push(client);
        }
        self.pool.returned.notify_one();
    }
}
