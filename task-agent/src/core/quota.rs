//! Depth and global quota limits for sub-task delegation.

use std::fmt;

/// Limits derived from the configured maximum depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTaskQuota {
    max_depth: u32,
}

/// Why a sub-task request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitNotice {
    /// The requesting agent already sits at the deepest allowed level.
    Depth { depth: u32, max_depth: u32 },
    /// The run has created as many sub-tasks as it may.
    Quota { used: u32, limit: u32 },
}

impl SubTaskQuota {
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Total sub-tasks a run may create: `max_depth²`.
    pub fn global_limit(&self) -> u32 {
        self.max_depth.saturating_mul(self.max_depth)
    }

    /// Sub-tasks still available given `used`.
    pub fn remaining(&self, used: u32) -> u32 {
        self.global_limit().saturating_sub(used)
    }

    /// Admit one child of an agent at `parent_depth`, bumping `used` on
    /// success. Nothing changes when a limit is hit.
    pub fn admit(&self, parent_depth: u32, used: &mut u32) -> Result<(), LimitNotice> {
        if parent_depth >= self.max_depth {
            return Err(LimitNotice::Depth {
                depth: parent_depth,
                max_depth: self.max_depth,
            });
        }
        let limit = self.global_limit();
        if *used >= limit {
            return Err(LimitNotice::Quota { used: *used, limit });
        }
        *used += 1;
        Ok(())
    }
}

impl fmt::Display for LimitNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitNotice::Depth { depth, max_depth } => write!(
                f,
                "[depth limit] depth {depth} reached the maximum of {max_depth}; execute the task directly instead of creating a sub-task"
            ),
            LimitNotice::Quota { used, limit } => write!(
                f,
                "[quota limit] {used}/{limit} sub-tasks already created; execute the task directly instead of creating a sub-task"
            ),
        }
    }
}
