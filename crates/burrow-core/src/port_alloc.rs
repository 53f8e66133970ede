//! Bounded allocator for tunnel acceptor ports.
//!
//! When the relay is configured with a `first:last` range, every client
//! acceptor binds a port from that interval and returns it on teardown. With
//! no range configured the allocator is a no-op and the OS picks ephemeral
//! ports.

use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Errors raised while parsing a port range expression.
#[derive(Debug, Error)]
pub enum PortRangeError {
    #[error("bad port range expression {0:?}, expected \"first:last\"")]
    BadRangeExpression(String),

    #[error("bad port range {first}:{last}, first port is greater than last")]
    BadRangeExpressionMinGtMax { first: u16, last: u16 },
}

/// Every port in the configured range is taken.
#[derive(Debug, Error)]
#[error("no free ports left in range {first}:{last}")]
pub struct ExhaustedRange {
    pub first: u16,
    pub last: u16,
}

struct Pool {
    first: u16,
    last: u16,
    /// Port to owning client id; `None` marks a free slot. Kept ordered so
    /// acquisition always hands out the lowest free port.
    slots: Mutex<BTreeMap<u16, Option<String>>>,
}

/// Hands out TCP ports from a `[first, last]` interval, lowest-free-first.
///
/// Shared by every [`crate::TunnelAgent`] in the process; acquire and release
/// serialize on an internal lock.
pub struct PortAllocator {
    pool: Option<Pool>,
}

impl PortAllocator {
    /// Create an allocator for the given `"first:last"` expression, or an
    /// unconfigured (pass-through) allocator when `range` is `None`.
    pub fn new(range: Option<&str>) -> Result<Self, PortRangeError> {
        let Some(expr) = range else {
            return Ok(Self { pool: None });
        };

        let (first, last) = expr
            .split_once(':')
            .filter(|(a, b)| {
                !a.is_empty()
                    && !b.is_empty()
                    && a.chars().all(|c| c.is_ascii_digit())
                    && b.chars().all(|c| c.is_ascii_digit())
            })
            .ok_or_else(|| PortRangeError::BadRangeExpression(expr.to_string()))?;

        let first: u16 = first
            .parse()
            .map_err(|_| PortRangeError::BadRangeExpression(expr.to_string()))?;
        let last: u16 = last
            .parse()
            .map_err(|_| PortRangeError::BadRangeExpression(expr.to_string()))?;

        if first > last {
            return Err(PortRangeError::BadRangeExpressionMinGtMax { first, last });
        }

        let slots = (first..=last).map(|p| (p, None)).collect();
        Ok(Self {
            pool: Some(Pool {
                first,
                last,
                slots: Mutex::new(slots),
            }),
        })
    }

    /// The configured range as `"first:last"`, if any.
    pub fn range(&self) -> Option<String> {
        self.pool.as_ref().map(|p| format!("{}:{}", p.first, p.last))
    }

    pub fn first(&self) -> Option<u16> {
        self.pool.as_ref().map(|p| p.first)
    }

    pub fn last(&self) -> Option<u16> {
        self.pool.as_ref().map(|p| p.last)
    }

    /// Reserve the lowest free port for `owner`.
    ///
    /// Returns `Ok(None)` when no range is configured, meaning the caller
    /// should let the OS assign an ephemeral port.
    pub fn acquire(&self, owner: &str) -> Result<Option<u16>, ExhaustedRange> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        let mut slots = pool.slots.lock().unwrap_or_else(|e| e.into_inner());
        for (port, slot) in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(owner.to_string());
                debug!(port, owner, "acquired tunnel port");
                return Ok(Some(*port));
            }
        }
        Err(ExhaustedRange {
            first: pool.first,
            last: pool.last,
        })
    }

    /// Return `port` to the pool. Idempotent; ports outside the range (and
    /// any port when no range is configured) are ignored.
    pub fn release(&self, port: u16) {
        let Some(pool) = &self.pool else { return };

        let mut slots = pool.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&port) {
            if let Some(owner) = slot.take() {
                debug!(port, owner, "released tunnel port");
            }
        }
    }
}
