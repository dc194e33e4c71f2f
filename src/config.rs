use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::Error;

/// Sentinel for "use the table kind's own default occupancy".
pub const INVALID_OCCUPANCY: u32 = 0;

/// Default cap on cuckoo hash functions before insertion gives up.
pub const DEFAULT_MAX_NUM_HASH_FUNC: u8 = 8;

/// Default depth bound for the cuckoo eviction search.
pub const DEFAULT_BFS_DEPTH: u32 = 100;

/// Options applied when a table is mounted for write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTableOptions {
    /// Target percentage of live keys to buckets (0 = table default)
    pub occupancy_pct: u32,

    /// Reserve headroom for one in-place `stretch` (cuckoo only)
    pub may_stretch: bool,

    /// Upper bound on cuckoo hash functions (default: 8)
    pub max_num_hash_func: u8,

    /// Depth bound for the cuckoo eviction search (default: 100)
    pub bfs_depth: u32,
}

impl Default for HashTableOptions {
    fn default() -> Self {
        Self {
            occupancy_pct: INVALID_OCCUPANCY,
            may_stretch: false,
            max_num_hash_func: DEFAULT_MAX_NUM_HASH_FUNC,
            bfs_depth: DEFAULT_BFS_DEPTH,
        }
    }
}

impl HashTableOptions {
    /// Create options with the given occupancy target
    pub fn new(occupancy_pct: u32) -> Self {
        Self {
            occupancy_pct,
            ..Default::default()
        }
    }

    /// Set the occupancy target
    pub fn occupancy_pct(mut self, pct: u32) -> Self {
        self.occupancy_pct = pct;
        self
    }

    /// Reserve stretch headroom at mount time
    pub fn may_stretch(mut self, enabled: bool) -> Self {
        self.may_stretch = enabled;
        self
    }

    /// Set the maximum number of cuckoo hash functions
    pub fn max_num_hash_func(mut self, max: u8) -> Self {
        self.max_num_hash_func = max;
        self
    }

    /// Set the eviction search depth bound
    pub fn bfs_depth(mut self, depth: u32) -> Self {
        self.bfs_depth = depth;
        self
    }

    /// Resolve the occupancy target against a table kind's default and
    /// ceiling.
    pub(crate) fn resolve_occupancy(&self, default_pct: u32, max_pct: u32) -> Result<u32> {
        let pct = if self.occupancy_pct == INVALID_OCCUPANCY {
            default_pct
        } else {
            self.occupancy_pct
        };
        if pct == 0 || pct > max_pct {
            return Err(Error::InvalidOptions(format!(
                "occupancy_pct {} outside [1, {}]",
                pct, max_pct
            )));
        }
        Ok(pct)
    }

    pub(crate) fn validate_hash_funcs(&self) -> Result<()> {
        if self.max_num_hash_func < 2 {
            return Err(Error::InvalidOptions(format!(
                "max_num_hash_func {} is below 2",
                self.max_num_hash_func
            )));
        }
        Ok(())
    }
}
