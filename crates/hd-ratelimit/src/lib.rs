//! Multi-tier token-bucket rate limiting for the UDP/TCP receive path.
//!
//! Three independent tiers: a global bucket, a network-prefix bucket
//! (IPv4 /24, IPv6 /64) and a per-address bucket. A packet is admitted
//! only when every enabled tier has a token for it. Keys are derived
//! from the binary address so the per-packet path never allocates.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateTier {
    /// Sustained queries per second. Zero or negative disables the tier.
    pub rate: f64,
    /// Bucket depth. Zero or negative disables the tier.
    pub burst: f64,
}

impl RateTier {
    pub fn disabled() -> Self {
        Self { rate: 0.0, burst: 0.0 }
    }

    fn is_enabled(&self) -> bool {
        self.rate > 0.0 && self.burst > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_tier")]
    pub global: RateTier,
    #[serde(default = "default_prefix_tier")]
    pub prefix: RateTier,
    #[serde(default = "default_address_tier")]
    pub address: RateTier,
    /// Per-tier cap on tracked keys.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Entries idle longer than this are dropped during cleanup sweeps.
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_global_tier() -> RateTier {
    RateTier {
        rate: 50_000.0,
        burst: 100_000.0,
    }
}
fn default_prefix_tier() -> RateTier {
    RateTier {
        rate: 2_000.0,
        burst: 4_000.0,
    }
}
fn default_address_tier() -> RateTier {
    RateTier {
        rate: 500.0,
        burst: 1_000.0,
    }
}
fn default_max_entries() -> usize {
    100_000
}
fn default_cleanup_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: default_global_tier(),
            prefix: default_prefix_tier(),
            address: default_address_tier(),
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_secs(),
        }
    }
}

/// Bucket key. Binary so deriving one from a peer address is copy-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BucketKey {
    Global,
    V4Prefix([u8; 3]),
    V6Prefix([u8; 8]),
    V4Addr(u32),
    V6Addr(u128),
}

fn prefix_key(ip: IpAddr) -> BucketKey {
    match ip {
        IpAddr::V4(addr) => {
            let [a, b, c, _] = addr.octets();
            BucketKey::V4Prefix([a, b, c])
        }
        IpAddr::V6(addr) => {
            let octets = addr.octets();
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&octets[..8]);
            BucketKey::V6Prefix(prefix)
        }
    }
}

fn address_key(ip: IpAddr) -> BucketKey {
    match ip {
        IpAddr::V4(addr) => BucketKey::V4Addr(addr.to_bits()),
        IpAddr::V6(addr) => BucketKey::V6Addr(addr.to_bits()),
    }
}

struct BucketState {
    tokens: f64,
    last_update: Instant,
}

struct BucketMap {
    entries: FxHashMap<BucketKey, BucketState>,
    last_cleanup: Instant,
}

/// One keyed token-bucket tier.
struct TokenBucket {
    tier: RateTier,
    max_entries: usize,
    cleanup_interval: Duration,
    inner: Mutex<BucketMap>,
}

impl TokenBucket {
    fn new(tier: RateTier, max_entries: usize, cleanup_interval: Duration, now: Instant) -> Self {
        Self {
            tier,
            max_entries,
            cleanup_interval,
            inner: Mutex::new(BucketMap {
                entries: FxHashMap::default(),
                last_cleanup: now,
            }),
        }
    }

    fn allow_at(&self, key: BucketKey, now: Instant) -> bool {
        if !self.tier.is_enabled() {
            return true;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if now.duration_since(inner.last_cleanup) >= self.cleanup_interval {
            self.sweep(&mut inner, now);
        }

        if let Some(state) = inner.entries.get_mut(&key) {
            let elapsed = now.duration_since(state.last_update).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.tier.rate).min(self.tier.burst);
            state.last_update = now;
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                true
            } else {
                false
            }
        } else {
            if inner.entries.len() >= self.max_entries {
                self.sweep(&mut inner, now);
                if inner.entries.len() >= self.max_entries {
                    debug!("rate limiter table full, denying new source");
                    return false;
                }
            }
            inner.entries.insert(
                key,
                BucketState {
                    tokens: self.tier.burst - 1.0,
                    last_update: now,
                },
            );
            true
        }
    }

    fn sweep(&self, inner: &mut BucketMap, now: Instant) {
        let interval = self.cleanup_interval;
        inner
            .entries
            .retain(|_, state| now.duration_since(state.last_update) < interval);
        inner.last_cleanup = now;
    }
}

/// The composed three-tier gate.
pub struct RateLimiter {
    global: TokenBucket,
    prefix: TokenBucket,
    address: TokenBucket,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let now = Instant::now();
        let cleanup = Duration::from_secs(config.cleanup_interval_secs.max(1));
        Self {
            global: TokenBucket::new(config.global, 1, cleanup, now),
            prefix: TokenBucket::new(config.prefix, config.max_entries, cleanup, now),
            address: TokenBucket::new(config.address, config.max_entries, cleanup, now),
        }
    }

    /// Admission check for one packet from `ip`.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.global.allow_at(BucketKey::Global, now)
            && self.prefix.allow_at(prefix_key(ip), now)
            && self.address.allow_at(address_key(ip), now)
    }
}
