//! Bounded connection pool.
//!
//! At most `size + max_overflow` connections are leased at once. Released
//! connections go back to the idle set until it holds `size` connections;
//! surplus overflow connections are closed.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{Connection, Connector, PoolOptions, UowError, UowResult};

const EXPECT_LEASED: &str = "BUG: pooled connection used after release";

/// Point-in-time counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Connections currently leased out.
    pub leased: usize,
    /// Live connections owned by the pool (idle + leased).
    pub open: usize,
    /// Successful acquisitions since creation.
    pub acquired: u64,
    /// Leases returned since creation, recycled or not.
    pub released: u64,
    /// Connections closed because they were dead or surplus.
    pub discarded: u64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Box<dyn Connection>>,
    open: usize,
    leased: usize,
    acquired: u64,
    released: u64,
    discarded: u64,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

impl PoolInner {
    /// Returns the connection when it should be closed instead of recycled.
    fn check_in(&self, conn: Box<dyn Connection>) -> Option<Box<dyn Connection>> {
        let mut state = self.state.lock();
        state.leased -= 1;
        state.released += 1;

        if !conn.is_alive() || self.closed.load(Ordering::Acquire) || state.idle.len() >= self.options.size {
            state.open -= 1;
            state.discarded += 1;
            return Some(conn);
        }
        state.idle.push_back(conn);
        None
    }
}

/// Shared handle to a connection pool. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("options", &self.inner.options)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool over the given connector. No connection is opened up front.
    pub fn new(connector: impl Connector, options: PoolOptions) -> UowResult<Self> {
        Self::with_connector(Arc::new(connector), options)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, options: PoolOptions) -> UowResult<Self> {
        options.validate()?;
        let slots = Arc::new(Semaphore::new(options.capacity()));
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                options,
                slots,
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            leased: state.leased,
            open: state.open,
            acquired: state.acquired,
            released: state.released,
            discarded: state.discarded,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Lease a connection.
    ///
    /// Waits for a free slot for at most `acquire_timeout`. With `pre_ping`
    /// each idle candidate is pinged first; dead ones are discarded and a
    /// fresh connection is opened in their place.
    pub async fn acquire(&self) -> UowResult<PooledConnection> {
        if self.is_closed() {
            return Err(UowError::PoolClosed);
        }

        let waited = self.inner.options.acquire_timeout;
        let permit = match tokio::time::timeout(waited, self.inner.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(UowError::PoolClosed),
            Err(_) => {
                warn!(timeout = ?waited, status = ?self.status(), "timed out waiting for a pooled connection");
                return Err(UowError::PoolTimeout { waited });
            }
        };

        let conn = self.checkout().await?;

        let mut state = self.inner.state.lock();
        state.open += 1;
        state.leased += 1;
        state.acquired += 1;
        debug!(idle = state.idle.len(), leased = state.leased, open = state.open, "connection acquired");
        drop(state);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    // A candidate is not counted as open while it is being pinged, so a
    // cancelled acquire cannot leave the counters inconsistent.
    async fn checkout(&self) -> UowResult<Box<dyn Connection>> {
        loop {
            let candidate = {
                let mut state = self.inner.state.lock();
                let conn = state.idle.pop_front();
                if conn.is_some() {
                    state.open -= 1;
                }
                conn
            };
            let Some(mut conn) = candidate else { break };

            if !conn.is_alive() {
                self.discard(conn, "dead in idle set").await;
                continue;
            }
            if self.inner.options.pre_ping {
                let probing = Probing {
                    state: &self.inner.state,
                    done: false,
                };
                let pinged = conn.ping().await;
                probing.finish();
                if let Err(e) = pinged {
                    debug!(error = %e, "pre-ping failed, replacing connection");
                    self.discard(conn, "failed pre-ping").await;
                    continue;
                }
            }
            return Ok(conn);
        }

        let conn = self.inner.connector.connect().await?;
        debug!("opened new connection");
        Ok(conn)
    }

    async fn discard(&self, conn: Box<dyn Connection>, reason: &'static str) {
        self.inner.state.lock().discarded += 1;
        debug!(reason, "discarding connection");
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing discarded connection");
        }
    }

    /// Return a leased connection. Dead connections, and connections beyond
    /// `size` idle ones, are closed instead of recycled.
    pub async fn release(&self, mut lease: PooledConnection) {
        let Some(conn) = lease.conn.take() else {
            return;
        };
        let surplus = self.inner.check_in(conn);
        // Frees the slot only after the connection is back in the idle set.
        drop(lease);

        if let Some(conn) = surplus {
            debug!("closing released connection instead of recycling it");
            if let Err(e) = conn.close().await {
                debug!(error = %e, "error closing released connection");
            }
        } else {
            debug!("connection returned to idle set");
        }
    }

    /// Close every idle connection and refuse further acquisitions.
    /// Leased connections are closed when they are released.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.slots.close();

        let idle: Vec<_> = {
            let mut state = self.inner.state.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open -= drained.len();
            state.discarded += drained.len() as u64;
            drained
        };
        for conn in idle {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "error closing idle connection");
            }
        }
    }
}

// Counts the candidate as discarded when an acquire is cancelled mid-ping.
struct Probing<'a> {
    state: &'a Mutex<PoolState>,
    done: bool,
}

impl Probing<'_> {
    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for Probing<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.lock().discarded += 1;
            debug!("acquire cancelled during pre-ping; candidate dropped");
        }
    }
}

/// A connection leased from a [`ConnectionPool`].
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it instead frees
/// its slot and discards the connection, since its transaction state is
/// unknown.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("alive", &self.conn.as_ref().map(|c| c.is_alive()))
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect(EXPECT_LEASED)
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect(EXPECT_LEASED)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.pool.state.lock();
            state.leased -= 1;
            state.released += 1;
            state.open -= 1;
            state.discarded += 1;
            warn!("pooled connection dropped without release; discarding it");
            drop(state);
            drop(conn);
        }
    }
}
