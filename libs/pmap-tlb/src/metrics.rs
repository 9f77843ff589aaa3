// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TLB event counters
//!
//! Every TLB record keeps a small set of counters answering questions like "how often did we run
//! out of ASIDs?" or "how many shootdowns were avoided?". Counters are monotonic and only ever
//! read for diagnostics, so all accesses are relaxed.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// A named, monotonically increasing event counter.
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.get())
    }
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment the counter.
    pub fn increment(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Counters kept per TLB.
#[derive(Debug)]
pub struct TlbCounters {
    /// ASID space reinitializations, for any reason
    pub asid_reinits: Counter,
    /// Reinitializations that had to drop every user ASID
    pub full_invalidations: Counter,
    /// Remote associations reset instead of sending a shootdown
    pub lazy_shots: Counter,
    /// Shootdown IPIs sent to a CPU of this TLB
    pub shootdown_ipis: Counter,
    /// Shootdown requests processed on this TLB
    pub shootdowns: Counter,
}

impl TlbCounters {
    pub const fn new() -> Self {
        Self {
            asid_reinits: Counter::new("asid-reinits"),
            full_invalidations: Counter::new("full-invalidations"),
            lazy_shots: Counter::new("lazy-shots"),
            shootdown_ipis: Counter::new("shootdown-ipis"),
            shootdowns: Counter::new("shootdowns"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Counter> {
        [
            &self.asid_reinits,
            &self.full_invalidations,
            &self.lazy_shots,
            &self.shootdown_ipis,
            &self.shootdowns,
        ]
        .into_iter()
    }
}

impl Default for TlbCounters {
    fn default() -> Self {
        Self::new()
    }
}
