//! Lock-free aggregator collections.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::aggregator::SeriesAggregator;

struct Node {
    aggregator: Arc<SeriesAggregator>,
    next: Option<Arc<Node>>,
}

impl Drop for Node {
    fn drop(&mut self) {
        // Unlink iteratively, so that dropping a long list cannot overflow the stack.
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

struct Snapshot {
    sealed: bool,
    head: Option<Arc<Node>>,
    len: usize,
}

/// An append-only collection of aggregators, belonging to one period of one aggregation cycle.
///
/// Appends are lock-free. Once the period ends, the collection is sealed: sealing atomically takes every aggregator
/// added so far, and any append racing with, or following, the seal fails, so that the caller can retry against the
/// collection of the next period.
pub(crate) struct AggregatorCollection {
    state: ArcSwap<Snapshot>,
}

impl AggregatorCollection {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(Snapshot {
                sealed: false,
                head: None,
                len: 0,
            }),
        }
    }

    /// Adds an aggregator, returning `false` if the collection was already sealed.
    pub fn add(&self, aggregator: Arc<SeriesAggregator>) -> bool {
        let mut current = self.state.load_full();
        loop {
            if current.sealed {
                return false;
            }

            let next = Arc::new(Snapshot {
                sealed: false,
                head: Some(Arc::new(Node {
                    aggregator: Arc::clone(&aggregator),
                    next: current.head.clone(),
                })),
                len: current.len + 1,
            });

            let previous = self.state.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                return true;
            }
            current = arc_swap::Guard::into_inner(previous);
        }
    }

    /// Seals the collection, returning its aggregators in the order they were added.
    ///
    /// Sealing an already sealed collection returns nothing.
    pub fn seal(&self) -> Vec<Arc<SeriesAggregator>> {
        let sealed = self.state.swap(Arc::new(Snapshot {
            sealed: true,
            head: None,
            len: 0,
        }));

        let mut aggregators = Vec::with_capacity(sealed.len);
        let mut next = sealed.head.as_ref();
        while let Some(node) = next {
            aggregators.push(Arc::clone(&node.aggregator));
            next = node.next.as_ref();
        }
        aggregators.reverse();
        aggregators
    }

    /// Returns the aggregators added so far, without sealing.
    pub fn snapshot(&self) -> Vec<Arc<SeriesAggregator>> {
        let current = self.state.load_full();
        let mut aggregators = Vec::with_capacity(current.len);
        let mut next = current.head.as_ref();
        while let Some(node) = next {
            aggregators.push(Arc::clone(&node.aggregator));
            next = node.next.as_ref();
        }
        aggregators.reverse();
        aggregators
    }
}
