//! # Call Record Recycling
//!
//! Completed calls move between two lists:
//!
//! ```text
//!   FreeList ──take──▶ live stack ──leave──▶ PendingList
//!      ▲                                         │
//!      └──────────── return_all ◀── drain_all ───┘
//! ```
//!
//! Each list sits behind its own spin section. Every operation under the
//! lock is O(1) apart from the occasional `Vec` growth of the pending list,
//! and no list lock is ever held while the other one is taken.

use spin::Mutex as SpinMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::vec;

use crate::domain::MethodIdentity;

/// One invocation of a method, complete once its leave has been seen.
#[derive(Debug, Clone)]
pub struct CallRecord {
    method: Arc<MethodIdentity>,
    caller: Option<Arc<MethodIdentity>>,
    timestamp: u64,
    elapsed: u64,
}

impl CallRecord {
    /// An entered, not yet completed, call.
    #[must_use]
    pub fn new(
        method: Arc<MethodIdentity>,
        caller: Option<Arc<MethodIdentity>>,
        timestamp: u64,
    ) -> Self {
        Self { method, caller, timestamp, elapsed: 0 }
    }

    #[must_use]
    pub fn method(&self) -> &Arc<MethodIdentity> {
        &self.method
    }

    /// Frame below this one when it was entered
    #[must_use]
    pub fn caller(&self) -> Option<&Arc<MethodIdentity>> {
        self.caller.as_ref()
    }

    /// Entry timestamp, in the target's clock
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Close the call at `end`. A clock that went backwards reads as 0.
    pub fn complete(&mut self, end: u64) {
        self.elapsed = end.saturating_sub(self.timestamp);
    }
}

/// Owned batch of records handed between the lists and their users.
#[derive(Debug, Default)]
pub struct RecordChain {
    records: Vec<Box<CallRecord>>,
}

impl RecordChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Box<CallRecord>) {
        self.records.push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallRecord> {
        self.records.iter().map(AsRef::as_ref)
    }
}

impl IntoIterator for RecordChain {
    type Item = Box<CallRecord>;
    type IntoIter = vec::IntoIter<Box<CallRecord>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordChain {
    type Item = &'a Box<CallRecord>;
    type IntoIter = std::slice::Iter<'a, Box<CallRecord>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<Box<CallRecord>> for RecordChain {
    fn from_iter<I: IntoIterator<Item = Box<CallRecord>>>(iter: I) -> Self {
        Self { records: iter.into_iter().collect() }
    }
}

// ============================================================================
// Free List
// ============================================================================

/// Recyclable record allocations.
///
/// Returned chains are queued whole, so `return_all` never walks the chain;
/// `take` pulls from the oldest chain first.
#[derive(Debug, Default)]
pub struct FreeList {
    chains: SpinMutex<VecDeque<vec::IntoIter<Box<CallRecord>>>>,
    allocations: AtomicUsize,
}

impl FreeList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill a recycled allocation with `record`, or allocate when empty.
    pub fn take(&self, record: CallRecord) -> Box<CallRecord> {
        let recycled = {
            let mut chains = self.chains.lock();
            loop {
                let Some(front) = chains.front_mut() else {
                    break None;
                };
                if let Some(boxed) = front.next() {
                    break Some(boxed);
                }
                chains.pop_front();
            }
        };

        match recycled {
            Some(mut boxed) => {
                *boxed = record;
                boxed
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Box::new(record)
            }
        }
    }

    /// Append a whole chain for reuse.
    pub fn return_all(&self, chain: RecordChain) {
        if chain.is_empty() {
            return;
        }
        let chain = chain.into_iter();
        self.chains.lock().push_back(chain);
    }

    /// Records available for reuse
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.lock().iter().map(ExactSizeIterator::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh allocations made by `take` so far
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Pending List
// ============================================================================

/// Completed records waiting for the aggregator.
#[derive(Debug, Default)]
pub struct PendingList {
    records: SpinMutex<Vec<Box<CallRecord>>>,
}

impl PendingList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: Box<CallRecord>) {
        self.records.lock().push(record);
    }

    /// Take every pending record; the caller returns them to a [`FreeList`].
    pub fn drain_all(&self) -> RecordChain {
        let records = std::mem::take(&mut *self.records.lock());
        RecordChain { records }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MethodId;

    fn method(id: u64) -> Arc<MethodIdentity> {
        Arc::new(MethodIdentity::new(MethodId(id), format!("Ns.Type.M{id}")))
    }

    fn addr(record: &CallRecord) -> usize {
        std::ptr::from_ref(record) as usize
    }

    #[test]
    fn test_complete_sets_elapsed() {
        let mut record = CallRecord::new(method(3), None, 100);
        record.complete(250);
        assert_eq!(record.elapsed(), 150);
        record.complete(50);
        assert_eq!(record.elapsed(), 0);
    }

    #[test]
    fn test_empty_free_list_allocates() {
        let free = FreeList::new();
        let _a = free.take(CallRecord::new(method(3), None, 1));
        let _b = free.take(CallRecord::new(method(4), None, 2));
        assert_eq!(free.allocations(), 2);
    }

    #[test]
    fn test_returned_records_are_reused_before_allocating() {
        let free = FreeList::new();
        let chain: RecordChain =
            (0..3).map(|i| free.take(CallRecord::new(method(10 + i), None, i))).collect();
        let returned: Vec<usize> = chain.iter().map(addr).collect();
        free.return_all(chain);
        assert_eq!(free.len(), 3);
        assert_eq!(free.allocations(), 3);

        let reused: Vec<Box<CallRecord>> =
            (0..3).map(|i| free.take(CallRecord::new(method(20 + i), None, i))).collect();
        let mut reused_addrs: Vec<usize> = reused.iter().map(|r| addr(r)).collect();
        let mut expected = returned.clone();
        reused_addrs.sort_unstable();
        expected.sort_unstable();
        assert_eq!(reused_addrs, expected);
        assert_eq!(free.allocations(), 3);

        // Recycled boxes carry the new contents, not the old.
        assert_eq!(reused[0].method().id(), MethodId(20));

        let _extra = free.take(CallRecord::new(method(99), None, 9));
        assert_eq!(free.allocations(), 4);
    }

    #[test]
    fn test_take_drains_chains_in_order() {
        let free = FreeList::new();
        let first: RecordChain = vec![free.take(CallRecord::new(method(3), None, 1))].into_iter().collect();
        let second: RecordChain = vec![free.take(CallRecord::new(method(4), None, 2))].into_iter().collect();
        let first_addr = addr(first.iter().next().unwrap());
        free.return_all(first);
        free.return_all(second);
        free.return_all(RecordChain::new());

        let taken = free.take(CallRecord::new(method(5), None, 3));
        assert_eq!(addr(&taken), first_addr);
        assert_eq!(free.len(), 1);
    }

    #[test]
    fn test_drain_all_empties_pending() {
        let pending = PendingList::new();
        pending.push(Box::new(CallRecord::new(method(3), None, 1)));
        pending.push(Box::new(CallRecord::new(method(4), Some(method(3)), 2)));

        let chain = pending.drain_all();
        assert_eq!(chain.len(), 2);
        assert!(pending.is_empty());
        assert!(pending.drain_all().is_empty());

        let ids: Vec<u64> = chain.iter().map(|r| r.method().id().0).collect();
        assert_eq!(ids, vec![3, 4]);
    }
}
