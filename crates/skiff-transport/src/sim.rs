//! # Simulated Channel
//!
//! [`SimulatedChannel`] wraps any [`Transport`] and impairs its inbound side:
//! each datagram is dropped with probability `loss`, otherwise held for a
//! latency drawn uniformly from `[min_latency, max_latency]`. Held datagrams
//! sit in a [`DelayQueue`] and are released in release-time order, so
//! independent latency draws reorder traffic the way a real path does.
//!
//! Parameters live behind a [`SimulationHandle`] that can be cloned into
//! another thread and adjusted while the session runs.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use quanta::{Clock, Instant};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;

use crate::config::SimulationConfig;
use crate::transport::Transport;

// ─── Parameters ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParams {
    pub loss: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl SimulationParams {
    /// Pass-through: no loss, no delay.
    pub fn perfect() -> Self {
        SimulationParams {
            loss: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        }
    }
}

impl From<&SimulationConfig> for SimulationParams {
    fn from(cfg: &SimulationConfig) -> Self {
        SimulationParams {
            loss: cfg.loss,
            min_latency: cfg.min_latency,
            max_latency: cfg.max_latency,
        }
    }
}

/// Shared, thread-safe access to a channel's [`SimulationParams`].
#[derive(Debug, Clone)]
pub struct SimulationHandle {
    params: Arc<Mutex<SimulationParams>>,
}

impl SimulationHandle {
    fn lock(&self) -> MutexGuard<'_, SimulationParams> {
        self.params.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn params(&self) -> SimulationParams {
        self.lock().clone()
    }

    pub fn set(&self, params: SimulationParams) {
        *self.lock() = params;
    }

    pub fn set_loss(&self, loss: f64) {
        self.lock().loss = loss.clamp(0.0, 1.0);
    }

    pub fn set_latency(&self, min: Duration, max: Duration) {
        let mut p = self.lock();
        p.min_latency = min.min(max);
        p.max_latency = max.max(min);
    }
}

// ─── Delay Queue ────────────────────────────────────────────────────────────

/// A held datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub data: Bytes,
}

/// Lock-protected queue ordered by release time. Ties release in push
/// order.
#[derive(Debug, Default)]
pub struct DelayQueue {
    entries: Mutex<BTreeMap<(Instant, u64), Datagram>>,
    next_seq: AtomicU64,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(Instant, u64), Datagram>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, release_at: Instant, datagram: Datagram) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.lock().insert((release_at, seq), datagram);
    }

    /// Earliest datagram due at or before `now`.
    pub fn pop_ready(&self, now: Instant) -> Option<Datagram> {
        let mut entries = self.lock();
        let (&(release_at, _), _) = entries.first_key_value()?;
        if release_at > now {
            return None;
        }
        entries.pop_first().map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

/// Counters of what the channel did to inbound traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationStats {
    pub received: u64,
    pub dropped: u64,
    pub delayed: u64,
}

/// [`Transport`] wrapper that drops and delays inbound datagrams.
pub struct SimulatedChannel<T> {
    inner: T,
    clock: Clock,
    handle: SimulationHandle,
    queue: Arc<DelayQueue>,
    rng: StdRng,
    stats: SimulationStats,
}

impl<T: Transport> SimulatedChannel<T> {
    pub fn new(inner: T, params: SimulationParams, seed: u64, clock: Clock) -> Self {
        SimulatedChannel {
            inner,
            clock,
            handle: SimulationHandle {
                params: Arc::new(Mutex::new(params)),
            },
            queue: Arc::new(DelayQueue::new()),
            rng: StdRng::seed_from_u64(seed),
            stats: SimulationStats::default(),
        }
    }

    pub fn from_config(inner: T, cfg: &SimulationConfig, clock: Clock) -> Self {
        Self::new(inner, SimulationParams::from(cfg), cfg.seed, clock)
    }

    pub fn handle(&self) -> SimulationHandle {
        self.handle.clone()
    }

    /// The held-datagram queue; shared so other threads can observe it.
    pub fn queue(&self) -> Arc<DelayQueue> {
        Arc::clone(&self.queue)
    }

    pub fn stats(&self) -> SimulationStats {
        self.stats
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Move everything the inner transport has into the delay queue.
    fn pull_inbound(&mut self) -> io::Result<()> {
        while let Some((from, data)) = self.inner.recv_from()? {
            self.stats.received += 1;
            let params = self.handle.params();

            if params.loss > 0.0 && self.rng.random::<f64>() < params.loss {
                self.stats.dropped += 1;
                tracing::trace!(%from, len = data.len(), "simulated loss");
                continue;
            }

            let delay = if params.max_latency > params.min_latency {
                let lo = params.min_latency.as_micros() as u64;
                let hi = params.max_latency.as_micros() as u64;
                Duration::from_micros(self.rng.random_range(lo..=hi))
            } else {
                params.min_latency
            };
            if !delay.is_zero() {
                self.stats.delayed += 1;
            }
            self.queue
                .push(self.clock.now() + delay, Datagram { from, data });
        }
        Ok(())
    }
}

impl<T: Transport> Transport for SimulatedChannel<T> {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.inner.send_to(addr, data)
    }

    fn recv_from(&mut self) -> io::Result<Option<(SocketAddr, Bytes)>> {
        self.pull_inbound()?;
        Ok(self
            .queue
            .pop_ready(self.clock.now())
            .map(|d| (d.from, d.data)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
