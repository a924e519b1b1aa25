//! Two-way request bookkeeping: id allocation and reply correlation.
//!
//! The correlator lives inside the connection's locked state, so `resolve`
//! and `cancel` are serialized: whichever removes an entry first owns the
//! pending request, and the other sees `None`.

use std::collections::HashMap;
use tracing::trace;

#[derive(Debug)]
pub struct RequestCorrelator<T> {
    next_id: i32,
    pending: HashMap<i32, T>,
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestCorrelator<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate a request id. Ids are strictly positive; after `i32::MAX`
    /// the counter restarts at 1. Ids still awaiting a reply are skipped.
    pub fn next_request_id(&mut self) -> i32 {
        loop {
            let mut id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id <= 0 {
                id = 1;
                self.next_id = 2;
            }
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a pending request. Returns the previous entry if `id` was
    /// already registered, which indicates a bookkeeping bug in the caller.
    pub fn register(&mut self, id: i32, pending: T) -> Option<T> {
        debug_assert!(id > 0, "request id {} is reserved", id);
        trace!(request_id = id, outstanding = self.pending.len() + 1, "Registered request");
        self.pending.insert(id, pending)
    }

    /// Remove the request a reply belongs to.
    pub fn resolve(&mut self, id: i32) -> Option<T> {
        self.pending.remove(&id)
    }

    /// Remove a request on cancellation.
    pub fn cancel(&mut self, id: i32) -> Option<T> {
        self.pending.remove(&id)
    }

    /// Remove the first entry matching `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<(i32, T)> {
        let id = self
            .pending
            .iter()
            .find(|(_, pending)| predicate(pending))
            .map(|(id, _)| *id)?;
        self.pending.remove(&id).map(|pending| (id, pending))
    }

    /// Remove every entry, in request id order.
    pub fn drain(&mut self) -> Vec<(i32, T)> {
        let mut all: Vec<_> = self.pending.drain().collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn contains(&self, id: i32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&mut self, id: i32) {
        self.next_id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_start_at_one() {
        let mut correlator: RequestCorrelator<()> = RequestCorrelator::new();
        assert_eq!(correlator.next_request_id(), 1);
        assert_eq!(correlator.next_request_id(), 2);
    }

    #[test]
    fn test_wraparound_skips_zero_and_negatives() {
        let mut correlator: RequestCorrelator<()> = RequestCorrelator::new();
        correlator.set_next_id(i32::MAX);
        assert_eq!(correlator.next_request_id(), i32::MAX);
        assert_eq!(correlator.next_request_id(), 1);
        assert_eq!(correlator.next_request_id(), 2);

        correlator.set_next_id(0);
        assert_eq!(correlator.next_request_id(), 1);
    }

    #[test]
    fn test_outstanding_ids_are_not_reused_after_wrap() {
        let mut correlator = RequestCorrelator::new();
        let first = correlator.next_request_id();
        correlator.register(first, "first");
        correlator.set_next_id(i32::MAX);
        assert_eq!(correlator.next_request_id(), i32::MAX);
        assert_eq!(correlator.next_request_id(), 2);
    }

    #[test]
    fn test_resolve_and_cancel_remove_exactly_once() {
        let mut correlator = RequestCorrelator::new();
        let id = correlator.next_request_id();
        correlator.register(id, "pending");

        assert_eq!(correlator.resolve(id), Some("pending"));
        assert_eq!(correlator.cancel(id), None);
        assert_eq!(correlator.resolve(id), None);
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_unknown_reply_is_not_found() {
        let mut correlator: RequestCorrelator<()> = RequestCorrelator::new();
        assert!(correlator.resolve(99).is_none());
    }

    #[test]
    fn test_drain_orders_by_id() {
        let mut correlator = RequestCorrelator::new();
        for name in ["a", "b", "c"] {
            let id = correlator.next_request_id();
            correlator.register(id, name);
        }
        let drained: Vec<_> = correlator.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_cancel_where() {
        let mut correlator = RequestCorrelator::new();
        correlator.register(1, 10);
        correlator.register(2, 20);
        assert_eq!(correlator.cancel_where(|v| *v == 20), Some((2, 20)));
        assert_eq!(correlator.cancel_where(|v| *v == 20), None);
        assert_eq!(correlator.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_ids_unique_and_positive(start in 1i32..=i32::MAX, count in 1usize..2000) {
            let mut correlator: RequestCorrelator<()> = RequestCorrelator::new();
            correlator.set_next_id(start);
            let mut seen = HashSet::new();
            for _ in 0..count {
                let id = correlator.next_request_id();
                prop_assert!(id > 0);
                prop_assert!(seen.insert(id));
            }
        }
    }
}
