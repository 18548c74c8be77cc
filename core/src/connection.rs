//! Bounded per-pool connection pooling.
//!
//! Each pool gets at most `connection_limit` outbound connections. A lease
//! hands one out and puts it back on drop; broken connections are
//! invalidated instead so the next lease opens a fresh one.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{EngineError, Result};

/// Small fixed cap for delay-sensitive setups, otherwise scale with the
/// amount of work in flight.
pub fn connection_limit(worker_threads: usize, queue_depth: usize, delay_sensitive: bool) -> usize {
    if delay_sensitive {
        5
    } else {
        ((worker_threads + queue_depth) * 2).max(2)
    }
}

type Connector<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

pub struct ConnectionPool<C> {
    idle: Mutex<VecDeque<(C, Instant)>>,
    permits: Arc<Semaphore>,
    limit: usize,
    created: AtomicUsize,
    connector: Connector<C>,
}

impl<C: Clone + Send + 'static> ConnectionPool<C> {
    pub fn new<F>(limit: usize, connector: F) -> Arc<Self>
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        let limit = limit.max(1);
        Arc::new(Self {
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            created: AtomicUsize::new(0),
            connector: Box::new(connector),
        })
    }

    /// Borrow a connection, waiting while all of them are in use.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease<C>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)?;
        let reused = self.idle.lock().pop_back().map(|(conn, _)| conn);
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = (self.connector)()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                conn
            }
        };
        Ok(Lease {
            conn,
            pool: Arc::clone(self),
            healthy: true,
            _permit: permit,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Connections opened so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Drop idle connections unused for `max_idle`, keeping at least one.
    pub fn reap(&self, max_idle: Duration) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        let mut kept = VecDeque::with_capacity(before);
        for (conn, since) in idle.drain(..) {
            if since.elapsed() < max_idle {
                kept.push_back((conn, since));
            } else if kept.is_empty() && before > 0 {
                // never go fully cold
                kept.push_back((conn, since));
            }
        }
        *idle = kept;
        let reaped = before - idle.len();
        if reaped > 0 {
            debug!("Reaped {} idle connections", reaped);
        }
        reaped
    }

    /// Refuse new leases and drop every idle connection.
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }

    fn give_back(&self, conn: C) {
        self.idle.lock().push_back((conn, Instant::now()));
    }
}

/// A borrowed connection. Returned to the pool when dropped.
pub struct Lease<C: Clone + Send + 'static> {
    conn: C,
    pool: Arc<ConnectionPool<C>>,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Clone + Send + 'static> Lease<C> {
    /// The connection is broken; close it instead of returning it.
    pub fn invalidate(mut self) {
        self.healthy = false;
    }
}

impl<C: Clone + Send + 'static> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Clone + Send + 'static> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.healthy {
            self.pool.give_back(self.conn.clone());
        }
    }
}
