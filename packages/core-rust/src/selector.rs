//! Weighted round-robin selection over named targets.
//!
//! The weight map is expanded once into a flat pick list where every name
//! appears `weight` times. `next()` walks that list cyclically, so any window
//! of `sum(weights)` consecutive picks returns each name exactly `weight`
//! times. There is no randomness and no key affinity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deterministic cyclic picker built from a name -> weight map.
///
/// Names are expanded in ascending name order. Names with a weight of zero
/// or below never appear. The cursor is atomic, so a selector shared behind
/// an `Arc` can be advanced through `&self` by concurrent callers.
#[derive(Debug, Default)]
pub struct WeightedSelector {
    order: Vec<String>,
    cursor: AtomicUsize,
}

impl WeightedSelector {
    /// Builds a selector from the given weights.
    #[must_use]
    pub fn new(weights: &BTreeMap<String, i64>) -> Self {
        let mut order = Vec::new();
        for (name, &weight) in weights {
            if weight <= 0 {
                continue;
            }
            for _ in 0..weight {
                order.push(name.clone());
            }
        }
        Self {
            order,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Returns the next name in the cycle, or `None` when nothing is selectable.
    pub fn next(&self) -> Option<&str> {
        let len = self.order.len();
        if len == 0 {
            return None;
        }
        let idx = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some((cur + 1) % len))
            .unwrap_or(0);
        self.order.get(idx % len).map(String::as_str)
    }

    /// Number of slots in one full cycle (the sum of positive weights).
    #[must_use]
    pub fn cycle_len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
