//! Loopback port allocation for RPC and callback listeners.
//!
//! The allocator is advisory: a port is test-bound and released, then handed
//! out. Another process can take it before the real listener binds, so callers
//! treat a later bind failure as retryable.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;

use crate::error::{Result, SprError};

pub const DEFAULT_MIN_PORT: u16 = 49152;
pub const DEFAULT_MAX_PORT: u16 = 65535;

pub const PORT_MIN_ENV: &str = "SPR_PORT_MIN";
pub const PORT_MAX_ENV: &str = "SPR_PORT_MAX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
    min: u16,
    max: u16,
    /// 0 until the first successful allocation.
    last_assigned: u16,
}

/// Shared cursor over a TCP port range.
///
/// One allocator is normally shared (via `Arc`) by every caller and callback
/// listener in the process so concurrent spawns do not hand out the same port.
#[derive(Debug)]
pub struct PortAllocator {
    range: Mutex<PortRange>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            range: Mutex::new(PortRange {
                min: DEFAULT_MIN_PORT,
                max: DEFAULT_MAX_PORT,
                last_assigned: 0,
            }),
        }
    }
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Result<Self> {
        validate_range(min, max)?;
        Ok(Self {
            range: Mutex::new(PortRange {
                min,
                max,
                last_assigned: 0,
            }),
        })
    }

    /// Build from `SPR_PORT_MIN` / `SPR_PORT_MAX`, defaulting unset bounds.
    pub fn from_env() -> Result<Self> {
        let min = port_from_env(PORT_MIN_ENV)?.unwrap_or(DEFAULT_MIN_PORT);
        let max = port_from_env(PORT_MAX_ENV)?.unwrap_or(DEFAULT_MAX_PORT);
        Self::new(min, max)
    }

    /// Replace the range. The cursor restarts if it falls outside.
    pub fn set_range(&self, min: u16, max: u16) -> Result<()> {
        validate_range(min, max)?;
        let mut range = self.lock();
        range.min = min;
        range.max = max;
        if range.last_assigned < min || range.last_assigned > max {
            range.last_assigned = 0;
        }
        Ok(())
    }

    pub fn range(&self) -> (u16, u16) {
        let range = self.lock();
        (range.min, range.max)
    }

    /// Find a bindable loopback port, scanning forward from the last one
    /// handed out and wrapping once. `None` when the whole range is taken.
    pub fn allocate(&self) -> Option<u16> {
        let mut range = self.lock();
        let (min, max) = (u32::from(range.min), u32::from(range.max));
        let start = min.max(u32::from(range.last_assigned) + 1);

        let found = (start..=max)
            .chain(min..start.min(max + 1))
            .filter_map(|p| u16::try_from(p).ok())
            .find(|p| is_port_available(*p));

        match found {
            Some(port) => {
                range.last_assigned = port;
                Some(port)
            }
            None => {
                tracing::warn!(min, max, "No available port in range");
                None
            }
        }
    }

    /// Like [`allocate`](Self::allocate) but as a typed error.
    pub fn try_allocate(&self) -> Result<u16> {
        self.allocate().ok_or_else(|| {
            let (min, max) = self.range();
            SprError::NoPortAvailable { min, max }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortRange> {
        // The range is plain data; a panic elsewhere cannot leave it torn.
        self.range.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_range(min: u16, max: u16) -> Result<()> {
    if min == 0 {
        return Err(SprError::invalid_param("port range must not include 0"));
    }
    if min > max {
        return Err(SprError::invalid_param(format!(
            "invalid port range {min}..={max}"
        )));
    }
    Ok(())
}

fn port_from_env(key: &str) -> Result<Option<u16>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|e| SprError::invalid_param(format!("{key}={value}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
