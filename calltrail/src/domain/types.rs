//! Newtype wrappers for identifiers that cross the process boundary

use std::fmt;

/// Process id of the profiled target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Method id as assigned by the target's runtime
///
/// Unique within one session. Ids `0`, `1` and `2` never name a method:
/// they mark empty slots, leaves and tail calls in the record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

impl MethodId {
    /// True for ids that identify a real method
    #[must_use]
    pub fn is_method(self) -> bool {
        self.0 > calltrail_common::TAIL_CALL
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
