//! Resource limiting for the restricted backend.
//!
//! Linear memory and tables are capped through wasmtime's `ResourceLimiter`.
//! Wall-clock time is an epoch deadline, fuel is optional.

use std::time::Duration;

use wasmtime::{ResourceLimiter, Store};
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::sandbox::cache::EPOCH_TICK;

/// Table elements a run may hold. RustPython's function table is far below.
const MAX_TABLE_ELEMENTS: usize = 100_000;

/// Extra ticks past the timeout before the store traps on its own. The
/// supervisor reports the timeout first; this only stops abandoned runs.
const GRACE_TICKS: u64 = 2;

/// Deadlines are added to the engine's current epoch, so keep headroom.
const MAX_DEADLINE_TICKS: u64 = u64::MAX / 2;

/// Resource limiter that enforces the memory and table ceilings.
#[derive(Debug)]
pub struct SandboxLimiter {
    max_memory: u64,
    peak_memory: u64,
    max_table_elements: usize,
    limit_exceeded: bool,
}

impl SandboxLimiter {
    /// Create a limiter with a memory ceiling in bytes.
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            peak_memory: 0,
            max_table_elements: MAX_TABLE_ELEMENTS,
            limit_exceeded: false,
        }
    }

    /// Whether a growth request was denied.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    /// Largest memory size granted so far.
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    /// The configured ceiling.
    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired = u64::try_from(desired).unwrap_or(u64::MAX);
        if desired > self.max_memory {
            self.limit_exceeded = true;
            return Ok(false);
        }
        self.peak_memory = self.peak_memory.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.max_table_elements {
            self.limit_exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }
}

/// Per-run store state: the limiter and the WASI context.
pub struct StoreData {
    /// The resource limiter.
    pub limiter: SandboxLimiter,
    /// WASI Preview 1 context with piped stdio and nothing else.
    pub wasi: WasiP1Ctx,
}

impl StoreData {
    /// Create store data with the given memory ceiling and WASI context.
    pub fn new(max_memory: u64, wasi: WasiP1Ctx) -> Self {
        Self {
            limiter: SandboxLimiter::new(max_memory),
            wasi,
        }
    }
}

/// Extension trait for Store to configure resource limiting.
pub trait StoreLimiterExt {
    /// Install the limiter and arm the epoch deadline for `timeout`.
    fn configure_limits(&mut self, timeout: Duration);
}

impl StoreLimiterExt for Store<StoreData> {
    fn configure_limits(&mut self, timeout: Duration) {
        self.limiter(|data| &mut data.limiter);
        self.epoch_deadline_trap();
        self.set_epoch_deadline(deadline_ticks(timeout));
    }
}

/// Epoch ticks a run may use before its store traps.
pub fn deadline_ticks(timeout: Duration) -> u64 {
    let tick = EPOCH_TICK.as_nanos().max(1);
    let ticks = timeout.as_nanos().div_ceil(tick);
    u64::try_from(ticks)
        .unwrap_or(u64::MAX)
        .saturating_add(GRACE_TICKS)
        .min(MAX_DEADLINE_TICKS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_allows_within_limit() {
        let mut limiter = SandboxLimiter::new(1024 * 1024); // 1MB

        let result = limiter.memory_growing(0, 512 * 1024, None).unwrap();
        assert!(result);
        assert!(!limiter.limit_exceeded());
        assert_eq!(limiter.peak_memory(), 512 * 1024);
    }

    #[test]
    fn test_limiter_denies_over_limit() {
        let mut limiter = SandboxLimiter::new(1024 * 1024); // 1MB

        let result = limiter.memory_growing(0, 2 * 1024 * 1024, None).unwrap();
        assert!(!result);
        assert!(limiter.limit_exceeded());
        assert_eq!(limiter.peak_memory(), 0);
    }

    #[test]
    fn test_limiter_denies_huge_tables() {
        let mut limiter = SandboxLimiter::new(1024 * 1024);
        assert!(limiter.table_growing(0, 1_000, None).unwrap());
        assert!(!limiter.table_growing(0, MAX_TABLE_ELEMENTS + 1, None).unwrap());
        assert!(limiter.limit_exceeded());
    }

    #[test]
    fn test_deadline_ticks() {
        assert_eq!(deadline_ticks(Duration::from_millis(100)), 10 + GRACE_TICKS);
        assert_eq!(deadline_ticks(Duration::from_millis(101)), 11 + GRACE_TICKS);
        assert_eq!(deadline_ticks(Duration::MAX), MAX_DEADLINE_TICKS);
    }
}
