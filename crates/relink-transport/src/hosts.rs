//! Destination pool with per-host failure accounting and rotation.
//!
//! Every candidate controller host carries its own failure budget: a flaky
//! host is retried up to `max_retries` times before it is marked dead and
//! the pool rotates, while a healthy alternate is picked up immediately on
//! the next send. Hosts are never removed, only marked dead, and the only
//! path that resurrects them is the explicit retry-forever policy
//! (`max_retries == 0`).

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::debug;

use crate::config::RotationStrategy;
use crate::proxy::ProxyCache;

/// One candidate destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    /// Host name or address.
    pub address: String,
    /// TCP port.
    pub port: u16,
    /// Consecutive failures charged against this host.
    pub failures: u32,
    /// Whether the host exhausted its budget.
    pub dead: bool,
}

impl HostEntry {
    /// `address:port` form for logging and URL building.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Ordered pool of candidate hosts plus the active selection.
///
/// Entries are prepended on [`add`](Self::add), so the head of the pool is
/// the most recently added host and the pool lists hosts in
/// reverse-configuration order.
pub struct HostPool {
    entries: Vec<HostEntry>,
    active: Option<usize>,
    strategy: RotationStrategy,
    max_retries: u32,
    rng: Box<dyn RngCore + Send>,
}

impl HostPool {
    /// Create an empty pool. `max_retries == 0` means retry forever.
    pub fn new(strategy: RotationStrategy, max_retries: u32) -> Self {
        Self::with_rng(strategy, max_retries, StdRng::from_entropy())
    }

    /// Create an empty pool with an injected random source.
    pub fn with_rng<R>(strategy: RotationStrategy, max_retries: u32, rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        HostPool {
            entries: Vec::new(),
            active: None,
            strategy,
            max_retries,
            rng: Box::new(rng),
        }
    }

    /// Prepend a host; the new entry becomes the head of the pool.
    /// Returns its index.
    pub fn add(&mut self, address: impl Into<String>, port: u16) -> usize {
        self.entries.insert(
            0,
            HostEntry {
                address: address.into(),
                port,
                failures: 0,
                dead: false,
            },
        );
        // Keep the active selection pointing at the same entry.
        if let Some(idx) = self.active {
            self.active = Some(idx + 1);
        }
        0
    }

    /// Number of configured hosts.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// The active entry, if one has been selected.
    pub fn active_entry(&self) -> Option<&HostEntry> {
        self.active.and_then(|idx| self.entries.get(idx))
    }

    /// Index of the active entry.
    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    /// Entry at `idx`.
    pub fn entry(&self, idx: usize) -> Option<&HostEntry> {
        self.entries.get(idx)
    }

    /// Charge a failed attempt against the active host.
    ///
    /// Within budget the host keeps its slot and only its counter moves; at
    /// the budget the host is marked dead and the pool rotates. Returns the
    /// entry to use for the next attempt (`None` when no selection exists,
    /// or when rotation found nothing alive).
    pub fn report_failure(&mut self, proxy: &mut ProxyCache) -> Option<usize> {
        let Some(idx) = self.active else {
            return None;
        };

        if self.entries[idx].failures == self.max_retries {
            self.entries[idx].dead = true;
            debug!(
                host = %self.entries[idx].authority(),
                "host exhausted its retry budget, rotating"
            );
            return self.rotate(proxy);
        }

        self.entries[idx].failures += 1;
        debug!(
            host = %self.entries[idx].authority(),
            failures = self.entries[idx].failures,
            "host failure counter increased"
        );
        Some(idx)
    }

    /// Select a new active host according to the configured strategy.
    ///
    /// Rotating a pool of more than one host invalidates the proxy cache:
    /// different destinations may sit behind different proxy policies.
    pub fn rotate(&mut self, proxy: &mut ProxyCache) -> Option<usize> {
        if self.entries.len() > 1 {
            proxy.invalidate();
        }

        let mut next = match self.strategy {
            RotationStrategy::RoundRobin => self.next_round_robin(),
            RotationStrategy::Random => match self.random_entry() {
                Some(idx) if !self.entries[idx].dead => Some(idx),
                _ => self.next_round_robin(),
            },
        };

        if self.max_retries == 0 && next.is_none() && !self.entries.is_empty() {
            debug!("retry-forever policy: resurrecting every host");
            for entry in &mut self.entries {
                entry.failures = 0;
                entry.dead = false;
            }
            next = Some(0);
        }

        self.active = next;
        next
    }

    /// Round-robin selection: the head if nothing is active yet, otherwise
    /// the first alive host scanning from the head.
    fn next_round_robin(&self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        if self.active.is_none() {
            return Some(0);
        }
        self.entries.iter().position(|entry| !entry.dead)
    }

    /// Uniformly random entry, or `None` on an empty pool.
    pub fn random_entry(&mut self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.rng.next_u32() as usize % self.entries.len())
    }

    /// False iff every configured host is dead (or none are configured).
    pub fn checkup(&self) -> bool {
        self.entries.iter().any(|entry| !entry.dead)
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("entries", &self.entries)
            .field("active", &self.active)
            .field("strategy", &self.strategy)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
