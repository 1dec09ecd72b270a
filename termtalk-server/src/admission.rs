//! Admission control for inbound sockets.
//!
//! One mutex guards every counter, so the three checks and the increments
//! that follow them are a single decision. Two simultaneous connections
//! racing for the last slot cannot both pass.
//!
//! Rate-limit history outlives the connections it recorded: releasing a
//! connection frees its open slot but not its place in the window.
//!
//! The address table is bounded. When a new address arrives at a full table,
//! the least recently seen address with no open connection is forgotten,
//! preferring one whose window has already emptied.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::HostConfig;

/// Addresses tracked at once.
pub const MAX_TRACKED_ADDRESSES: usize = 4096;

/// Why a socket was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The global open-connection ceiling is reached.
    #[error("global connection ceiling reached")]
    GlobalCapacity,
    /// This address is at its open-connection ceiling.
    #[error("per-address connection ceiling reached")]
    PerIpCapacity,
    /// This address opened too many connections within the window.
    #[error("rate limited")]
    RateLimited,
    /// Every tracked address holds an open connection.
    #[error("address table full")]
    AddressTableFull,
}

/// Ceilings applied by the [`AdmissionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Open connections allowed from one address.
    pub max_per_ip: usize,
    /// Open connections allowed in total.
    pub max_global: usize,
    /// Admissions allowed per address within `window`.
    pub rate_limit: usize,
    /// Length of the sliding window.
    pub window: Duration,
    /// Addresses remembered at once.
    pub max_tracked: usize,
}

impl From<&HostConfig> for AdmissionLimits {
    fn from(config: &HostConfig) -> Self {
        Self {
            max_per_ip: config.max_connections_per_ip,
            max_global: config.max_connections,
            rate_limit: config.rate_limit,
            window: config.rate_window(),
            max_tracked: MAX_TRACKED_ADDRESSES,
        }
    }
}

#[derive(Debug, Default)]
struct IpEntry {
    open: usize,
    recent: VecDeque<Instant>,
}

impl IpEntry {
    fn evict_before(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_stale(&self, now: Instant, window: Duration) -> bool {
        self.open == 0
            && self
                .recent
                .back()
                .map_or(true, |&last| now.saturating_duration_since(last) >= window)
    }
}

#[derive(Debug)]
struct Counters {
    per_ip: LruCache<IpAddr, IpEntry>,
    global_open: usize,
}

impl Counters {
    fn new(max_tracked: usize) -> Self {
        Self {
            per_ip: LruCache::new(NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN)),
            global_open: 0,
        }
    }

    /// Forget one address without open connections, least recently seen
    /// first. Returns `false` if every tracked address is in use.
    fn evict_idle(&mut self, now: Instant, window: Duration) -> bool {
        let victim = self
            .per_ip
            .iter()
            .rev()
            .find(|(_, entry)| entry.is_stale(now, window))
            .or_else(|| self.per_ip.iter().rev().find(|(_, entry)| entry.open == 0))
            .map(|(ip, _)| *ip);

        match victim {
            Some(ip) => {
                self.per_ip.pop(&ip);
                tracing::debug!(%ip, "address table full, forgot idle address");
                true
            }
            None => false,
        }
    }
}

/// Process-wide admission counters.
#[derive(Debug)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    counters: Mutex<Counters>,
}

impl AdmissionController {
    /// Create a controller with the given ceilings.
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            counters: Mutex::new(Counters::new(limits.max_tracked)),
        }
    }

    /// Configured ceilings.
    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    // The critical sections never panic mid-update, so a poisoned lock
    // still holds consistent counters.
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit or reject a connection from `ip` now.
    ///
    /// On `true` the caller owns one open slot and must call
    /// [`release`](Self::release) exactly once.
    pub fn try_admit(&self, ip: IpAddr) -> bool {
        self.admit_at(ip, Instant::now()).is_ok()
    }

    /// Admit or reject a connection from `ip` at `now`.
    pub fn admit_at(&self, ip: IpAddr, now: Instant) -> Result<(), Rejection> {
        let limits = self.limits;
        let mut counters = self.lock();

        if counters.global_open >= limits.max_global {
            tracing::debug!(%ip, open = counters.global_open, "rejected: global ceiling");
            return Err(Rejection::GlobalCapacity);
        }

        let full = counters.per_ip.len() >= counters.per_ip.cap().get();
        if full && !counters.per_ip.contains(&ip) && !counters.evict_idle(now, limits.window) {
            tracing::debug!(%ip, tracked = counters.per_ip.len(), "rejected: address table full");
            return Err(Rejection::AddressTableFull);
        }

        let entry = counters.per_ip.get_or_insert_mut(ip, IpEntry::default);
        if entry.open >= limits.max_per_ip {
            tracing::debug!(%ip, open = entry.open, "rejected: per-address ceiling");
            return Err(Rejection::PerIpCapacity);
        }

        entry.evict_before(now, limits.window);
        if entry.recent.len() >= limits.rate_limit {
            tracing::debug!(%ip, recent = entry.recent.len(), "rejected: rate limit");
            return Err(Rejection::RateLimited);
        }

        entry.open += 1;
        entry.recent.push_back(now);
        counters.global_open += 1;
        Ok(())
    }

    /// Return one open slot for `ip`. Never drops a count below zero.
    pub fn release(&self, ip: IpAddr) {
        let mut counters = self.lock();
        counters.global_open = counters.global_open.saturating_sub(1);
        if let Some(entry) = counters.per_ip.get_mut(&ip) {
            entry.open = entry.open.saturating_sub(1);
        }
    }

    /// Scoped admission: the returned permit releases its slot on drop.
    pub fn admit(self: &Arc<Self>, ip: IpAddr) -> Result<AdmissionPermit, Rejection> {
        self.admit_at(ip, Instant::now())?;
        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            ip,
        })
    }

    /// Drop rate history older than the window, and addresses with nothing
    /// left to track. Returns how many addresses were forgotten.
    pub fn prune(&self, now: Instant) -> usize {
        let window = self.limits.window;
        let mut counters = self.lock();
        let stale: Vec<IpAddr> = counters
            .per_ip
            .iter_mut()
            .filter_map(|(ip, entry)| {
                entry.evict_before(now, window);
                (entry.open == 0 && entry.recent.is_empty()).then_some(*ip)
            })
            .collect();
        for ip in &stale {
            counters.per_ip.pop(ip);
        }
        stale.len()
    }

    /// Open connections in total.
    pub fn open_connections(&self) -> usize {
        self.lock().global_open
    }

    /// Open connections from `ip`.
    pub fn open_from(&self, ip: IpAddr) -> usize {
        self.lock().per_ip.peek(&ip).map_or(0, |entry| entry.open)
    }

    /// Addresses currently tracked.
    pub fn tracked_addresses(&self) -> usize {
        self.lock().per_ip.len()
    }
}

/// One admitted connection's open slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    ip: IpAddr,
}

impl AdmissionPermit {
    /// Address the slot belongs to.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(self.ip);
    }
}
