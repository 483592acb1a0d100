use super::backend::Backend;
use super::RequestContext;
use crate::error::ProxyError;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Virtual nodes per backend on the consistent-hash ring
const RING_VNODES: usize = 160;

/// Fixed-point scale for the weighted least-connections ratio
const WLC_SCALE: u64 = 1_000_000;

/// Backend selection algorithm for a pool.
///
/// A closed enumeration: the dispatcher matches on variants, no runtime
/// type discovery. Every variant honors the same contract: skip backends
/// that are not alive or whose `try_acquire` fails, and return a backend
/// only with a slot already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    WeightedLeastConnections,
    ResponseTime,
    IpHash,
    ConsistentHash,
    Adaptive,
}

impl Policy {
    /// Parse a config policy name. Hyphenated spellings are accepted.
    pub fn parse(name: &str) -> Result<Self, ProxyError> {
        match name.replace('-', "_").as_str() {
            "round_robin" => Ok(Policy::RoundRobin),
            "weighted_round_robin" => Ok(Policy::WeightedRoundRobin),
            "least_connections" => Ok(Policy::LeastConnections),
            "weighted_least_connections" => Ok(Policy::WeightedLeastConnections),
            "response_time" => Ok(Policy::ResponseTime),
            "ip_hash" => Ok(Policy::IpHash),
            "consistent_hash" => Ok(Policy::ConsistentHash),
            "adaptive" => Ok(Policy::Adaptive),
            _ => Err(ProxyError::UnknownPolicy(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::RoundRobin => "round_robin",
            Policy::WeightedRoundRobin => "weighted_round_robin",
            Policy::LeastConnections => "least_connections",
            Policy::WeightedLeastConnections => "weighted_least_connections",
            Policy::ResponseTime => "response_time",
            Policy::IpHash => "ip_hash",
            Policy::ConsistentHash => "consistent_hash",
            Policy::Adaptive => "adaptive",
        }
    }

    /// Choose a backend from a pool snapshot. The returned backend has a
    /// connection slot reserved; the caller must `release()` it.
    pub fn select(
        &self,
        backends: &[Arc<Backend>],
        cursor: &AtomicU64,
        ctx: &RequestContext,
    ) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        match self {
            Policy::RoundRobin => select_round_robin(backends, cursor),
            Policy::WeightedRoundRobin => select_weighted_round_robin(backends),
            Policy::LeastConnections => {
                select_ranked(backends, |b| u64::from(b.connection_count()))
            }
            Policy::WeightedLeastConnections => select_ranked(backends, |b| {
                u64::from(b.connection_count()) * WLC_SCALE / u64::from(b.weight())
            }),
            Policy::ResponseTime => select_ranked(backends, |b| b.ewma_micros()),
            Policy::IpHash => select_ip_hash(backends, ctx),
            Policy::ConsistentHash => select_consistent_hash(backends, ctx),
            Policy::Adaptive => select_adaptive(backends),
        }
    }
}

/// Advance the cursor and scan cyclically for the first usable backend
fn select_round_robin(backends: &[Arc<Backend>], cursor: &AtomicU64) -> Option<Arc<Backend>> {
    let n = backends.len() as u64;
    let next = cursor.fetch_add(1, Ordering::AcqRel) + 1;
    let start = (next % n) as usize;

    for i in 0..backends.len() {
        let backend = &backends[(start + i) % backends.len()];
        if backend.is_alive() && backend.try_acquire() {
            return Some(Arc::clone(backend));
        }
    }
    None
}

/// Smooth weighted round-robin: every alive backend gains its weight, the
/// largest working weight wins and pays back the total. Over a window of
/// `sum(weight)` calls each backend wins exactly `weight` times.
fn select_weighted_round_robin(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    let alive: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.is_alive()).collect();
    if alive.is_empty() {
        return None;
    }

    let mut total: i64 = 0;
    let mut ranked: Vec<(i64, usize)> = Vec::with_capacity(alive.len());
    for (idx, backend) in alive.iter().enumerate() {
        let weight = i64::from(backend.weight());
        let working = backend.current_weight().fetch_add(weight, Ordering::AcqRel) + weight;
        total += weight;
        ranked.push((working, idx));
    }

    // Largest working weight first, index as the tie-break
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (_, idx) in ranked {
        let backend = alive[idx];
        if backend.try_acquire() {
            backend.current_weight().fetch_sub(total, Ordering::AcqRel);
            return Some(Arc::clone(backend));
        }
    }
    None
}

/// Rank alive backends by a key (smaller is better, index breaks ties) and
/// take the first that yields a slot
fn select_ranked<F>(backends: &[Arc<Backend>], key: F) -> Option<Arc<Backend>>
where
    F: Fn(&Backend) -> u64,
{
    let mut ranked: Vec<(u64, usize)> = backends
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_alive())
        .map(|(idx, b)| (key(b.as_ref()), idx))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    for (_, idx) in ranked {
        let backend = &backends[idx];
        if backend.try_acquire() {
            return Some(Arc::clone(backend));
        }
    }
    None
}

/// Map the client key onto the alive sub-list, stably ordered by URL
fn select_ip_hash(backends: &[Arc<Backend>], ctx: &RequestContext) -> Option<Arc<Backend>> {
    let mut alive: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.is_alive()).collect();
    if alive.is_empty() {
        return None;
    }
    alive.sort_by(|a, b| a.url_str().cmp(b.url_str()));

    let mut hasher = DefaultHasher::new();
    ctx.hash_key().hash(&mut hasher);
    let start = (hasher.finish() % alive.len() as u64) as usize;

    for i in 0..alive.len() {
        let backend = alive[(start + i) % alive.len()];
        if backend.try_acquire() {
            return Some(Arc::clone(backend));
        }
    }
    None
}

/// First 8 bytes of SHA-1, big-endian
fn ring_hash(key: &str) -> u64 {
    let digest = Sha1::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest is 20 bytes"))
}

/// Consistent hashing over a ring of 160 virtual nodes per alive backend.
/// Removing one backend from an N-pool reassigns about 1/N of keys.
fn select_consistent_hash(backends: &[Arc<Backend>], ctx: &RequestContext) -> Option<Arc<Backend>> {
    let alive: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.is_alive()).collect();
    if alive.is_empty() {
        return None;
    }

    let mut ring: BTreeMap<u64, usize> = BTreeMap::new();
    for (idx, backend) in alive.iter().enumerate() {
        for vnode in 0..RING_VNODES {
            ring.insert(ring_hash(&format!("{}#{}", backend.url_str(), vnode)), idx);
        }
    }

    let point = ring_hash(ctx.hash_key());
    let mut tried: HashSet<usize> = HashSet::new();
    for (_, &idx) in ring.range(point..).chain(ring.range(..point)) {
        if !tried.insert(idx) {
            continue;
        }
        let backend = alive[idx];
        if backend.try_acquire() {
            return Some(Arc::clone(backend));
        }
    }
    None
}

/// Blend of inverse connection count and inverse EWMA latency with a small
/// random jitter to break deterministic oscillation
fn select_adaptive(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    let alive: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.is_alive()).collect();
    if alive.is_empty() {
        return None;
    }

    let max_conns = alive
        .iter()
        .map(|b| b.connection_count())
        .max()
        .unwrap_or(0)
        .max(1) as f64;
    let max_ewma = alive.iter().map(|b| b.ewma_micros()).max().unwrap_or(0).max(1) as f64;

    let mut rng = rand::thread_rng();
    let mut ranked: Vec<(f64, usize)> = alive
        .iter()
        .enumerate()
        .map(|(idx, b)| {
            let conns = b.connection_count() as f64;
            let ewma = b.ewma_micros() as f64;
            let score = 0.5 * (1.0 - conns / max_conns) + 0.5 * (1.0 - ewma / max_ewma)
                + rng.gen_range(0.0..0.05);
            (score, idx)
        })
        .collect();

    // Highest score first; index breaks exact ties
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
        .then(a.1.cmp(&b.1)));

    for (_, idx) in ranked {
        let backend = alive[idx];
        if backend.try_acquire() {
            return Some(Arc::clone(backend));
        }
    }
    None
}
