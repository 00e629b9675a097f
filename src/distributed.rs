//! Process role in a multi-process launch
//!
//! Side effects that must happen once per process group (validation, telemetry,
//! checkpoint and sample writes, config persistence) are gated on the
//! coordinator role instead of a global rank check.

use std::env;

/// Rank of this process and size of the process group it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRole {
    pub rank: usize,
    pub world_size: usize,
}

impl ProcessRole {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size: world_size.max(1),
        }
    }

    /// Single-process run.
    pub fn single() -> Self {
        Self::new(0, 1)
    }

    /// Read the role from the launcher environment (`RANK`/`WORLD_SIZE`,
    /// falling back to `LOCAL_RANK`). Missing or malformed values mean a
    /// single-process run.
    pub fn from_env() -> Self {
        let rank = read_usize("RANK").or_else(|| read_usize("LOCAL_RANK")).unwrap_or(0);
        let world_size = read_usize("WORLD_SIZE").unwrap_or(1);
        if rank >= world_size.max(1) {
            log::warn!(
                "Rank {} is outside of world size {}, treating this process as a single run",
                rank,
                world_size
            );
            return Self::single();
        }
        Self::new(rank, world_size)
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

impl Default for ProcessRole {
    fn default() -> Self {
        Self::single()
    }
}

fn read_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `log::info!` on the coordinator only.
#[macro_export]
macro_rules! rank_zero_info {
    ($role:expr, $($arg:tt)+) => {
        if $role.is_coordinator() {
            log::info!($($arg)+);
        }
    };
}

/// `log::warn!` on the coordinator only.
#[macro_export]
macro_rules! rank_zero_warn {
    ($role:expr, $($arg:tt)+) => {
        if $role.is_coordinator() {
            log::warn!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_is_rank_zero() {
        assert!(ProcessRole::single().is_coordinator());
        assert!(!ProcessRole::new(1, 2).is_coordinator());
        assert!(ProcessRole::new(1, 2).is_distributed());
    }

    #[test]
    fn test_world_size_never_zero() {
        let role = ProcessRole::new(0, 0);
        assert_eq!(role.world_size, 1);
        assert!(!role.is_distributed());
    }
}
