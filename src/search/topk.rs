//! Bounded accumulator for the K best-scoring candidates of a stream.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A candidate with its score and arrival order.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub score: f32,
    pub value: T,
    seq: u64,
}

impl<T> PartialEq for Scored<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Scored<T> {}

impl<T> PartialOrd for Scored<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Higher scores rank greater; among equal scores the earlier arrival wins.
impl<T> Ord for Scored<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Keeps the `k` highest scores offered so far in O(k) memory.
///
/// Not synchronized; each query owns its own tracker.
#[derive(Debug)]
pub struct TopK<T> {
    k: usize,
    heap: BinaryHeap<Reverse<Scored<T>>>,
    seq: u64,
}

impl<T> TopK<T> {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The lowest score currently kept.
    pub fn min_score(&self) -> Option<f32> {
        self.heap.peek().map(|Reverse(entry)| entry.score)
    }

    /// Offers a candidate. Once full, it replaces the current minimum only if
    /// its score is strictly greater. Returns whether it was kept.
    pub fn push(&mut self, value: T, score: f32) -> bool {
        if self.k == 0 {
            return false;
        }
        let entry = Scored {
            score,
            value,
            seq: self.seq,
        };
        self.seq += 1;

        if self.heap.len() < self.k {
            self.heap.push(Reverse(entry));
            return true;
        }

        match self.heap.peek_mut() {
            Some(mut min) if score > min.0.score => {
                *min = Reverse(entry);
                true
            }
            _ => false,
        }
    }

    /// Consumes the tracker, best first. Equal scores keep arrival order.
    pub fn into_sorted_vec(self) -> Vec<Scored<T>> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(entry)| entry)
            .collect()
    }
}
