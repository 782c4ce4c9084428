//! Pool of pre-dialed backend connections
//!
//! A background refiller keeps `target_size` idle connections to the local
//! backend. Every idle connection has a watcher that peeks at the socket and
//! evicts it once the backend closes it, resets it or sends anything at all
//! (an idle backend has nothing to say). Connections leave the pool for good:
//! `get()` hands them out and they are never returned.

use rand::Rng;
use std::future::poll_fn;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::ReadBuf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Delay before the refiller retries a failed dial
pub const DIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to connect to backend {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Pool is closed")]
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One idle connection
struct Entry {
    /// Position in the idle array while `removed` is false
    idx: AtomicUsize,
    removed: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
    /// Wakes the watcher once the entry left the idle set
    evicted: Notify,
}

enum Liveness {
    /// Backend closed its end
    Closed,
    /// Backend sent bytes while idle
    Unsolicited(usize),
    Failed(io::Error),
    /// Stream already taken
    Gone,
}

impl Entry {
    fn new(stream: Option<TcpStream>) -> Self {
        Self {
            idx: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            stream: Mutex::new(stream),
            evicted: Notify::new(),
        }
    }

    fn take(&self) -> Option<TcpStream> {
        lock(&self.stream).take()
    }

    /// Non-destructive peek; pending while the socket is quiet
    fn poll_liveness(&self, cx: &mut Context<'_>) -> Poll<Liveness> {
        let guard = lock(&self.stream);
        let Some(stream) = guard.as_ref() else {
            return Poll::Ready(Liveness::Gone);
        };

        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        match stream.poll_peek(cx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(0)) => Poll::Ready(Liveness::Closed),
            Poll::Ready(Ok(n)) => Poll::Ready(Liveness::Unsolicited(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Liveness::Failed(e)),
        }
    }
}

/// Dense idle array with O(1) removal.
///
/// Every entry's `idx` equals its position in `entries`.
#[derive(Default)]
struct IdleSet {
    entries: Vec<Arc<Entry>>,
}

impl IdleSet {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, entry: Arc<Entry>) {
        entry.idx.store(self.entries.len(), Ordering::SeqCst);
        self.entries.push(entry);
    }

    /// Remove `entry` if it is still idle
    fn remove(&mut self, entry: &Arc<Entry>) -> bool {
        if entry
            .removed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let idx = entry.idx.load(Ordering::SeqCst);
        debug_assert!(Arc::ptr_eq(&self.entries[idx], entry));
        self.entries.swap_remove(idx);
        if let Some(moved) = self.entries.get(idx) {
            moved.idx.store(idx, Ordering::SeqCst);
        }
        true
    }

    fn random(&self) -> Option<Arc<Entry>> {
        if self.entries.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..self.entries.len());
        Some(self.entries[i].clone())
    }

    fn drain(&mut self) -> Vec<Arc<Entry>> {
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            entry.removed.store(true, Ordering::SeqCst);
        }
        entries
    }

    #[cfg(test)]
    fn indexes_consistent(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.idx.load(Ordering::SeqCst) == i && !e.removed.load(Ordering::SeqCst))
    }
}

struct PoolInner {
    address: String,
    target_size: usize,
    idle: Mutex<IdleSet>,
    /// Signalled on every removal from the idle set
    slot_freed: Notify,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn idle_len(&self) -> usize {
        lock(&self.idle).len()
    }

    async fn dial(&self) -> Result<TcpStream, PoolError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| PoolError::Dial {
                address: self.address.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("Failed to set TCP_NODELAY on backend connection: {}", e);
        }
        Ok(stream)
    }

    fn remove(&self, entry: &Arc<Entry>) -> bool {
        let removed = lock(&self.idle).remove(entry);
        if removed {
            self.slot_freed.notify_one();
            entry.evicted.notify_one();
        }
        removed
    }

    fn add(self: &Arc<Self>, stream: TcpStream) {
        let entry = Arc::new(Entry::new(Some(stream)));
        {
            let mut idle = lock(&self.idle);
            if self.shutdown.is_cancelled() {
                return;
            }
            idle.push(entry.clone());
        }
        tokio::spawn(self.clone().watch(entry));
    }

    /// Take a random idle connection out of the pool
    fn take_idle(&self) -> Option<TcpStream> {
        loop {
            let entry = lock(&self.idle).random()?;
            if self.remove(&entry) {
                if let Some(stream) = entry.take() {
                    return Some(stream);
                }
            }
        }
    }

    async fn refill(self: Arc<Self>) {
        debug!(backend = %self.address, target = self.target_size, "Pool refiller started");

        loop {
            while self.idle_len() >= self.target_size {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = self.slot_freed.notified() => {}
                }
            }

            let dialed = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                dialed = self.dial() => dialed,
            };

            match dialed {
                Ok(stream) => {
                    trace!(backend = %self.address, "Pooled backend connection");
                    self.add(stream);
                }
                Err(e) => {
                    warn!("{}, retrying in {}s", e, DIAL_BACKOFF.as_secs());
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(DIAL_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn watch(self: Arc<Self>, entry: Arc<Entry>) {
        let liveness = tokio::select! {
            _ = entry.evicted.notified() => return,
            _ = self.shutdown.cancelled() => return,
            liveness = poll_fn(|cx| entry.poll_liveness(cx)) => liveness,
        };

        let reason = match liveness {
            Liveness::Gone => return,
            Liveness::Closed => "closed by backend".to_string(),
            Liveness::Unsolicited(n) => format!("{} unsolicited byte(s)", n),
            Liveness::Failed(e) => e.to_string(),
        };

        // Lost the race against get(): the caller owns the connection now
        if !self.remove(&entry) {
            return;
        }
        drop(entry.take());
        debug!(backend = %self.address, %reason, "Evicted idle backend connection");
    }
}

/// Pre-dialed connections to one backend address
pub struct LocalPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for LocalPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPool")
            .field("address", &self.inner.address)
            .field("target_size", &self.inner.target_size)
            .field("idle", &self.inner.idle_len())
            .finish()
    }
}

impl LocalPool {
    /// Start a pool for `address`. A `target_size` of 0 disables pooling and
    /// every `get()` dials.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(address: impl Into<String>, target_size: usize) -> Self {
        let inner = Arc::new(PoolInner {
            address: address.into(),
            target_size,
            idle: Mutex::new(IdleSet::default()),
            slot_freed: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        if target_size > 0 {
            tokio::spawn(inner.clone().refill());
        }

        Self { inner }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Hand out an idle connection, or dial a fresh one when none is idle
    pub async fn get(&self) -> Result<TcpStream, PoolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }
        if let Some(stream) = self.inner.take_idle() {
            return Ok(stream);
        }
        self.inner.dial().await
    }

    /// Number of idle connections
    pub fn idle_len(&self) -> usize {
        self.inner.idle_len()
    }

    /// Stop refilling and close every idle connection
    pub fn close(&self) {
        let entries = {
            let mut idle = lock(&self.inner.idle);
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            self.inner.shutdown.cancel();
            idle.drain()
        };

        for entry in &entries {
            drop(entry.take());
        }
        info!(backend = %self.inner.address, closed = entries.len(), "Backend pool closed");
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        self.close();
    }
}
