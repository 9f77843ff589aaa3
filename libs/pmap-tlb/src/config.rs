// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// The maximum number of logical CPUs
pub const MAX_CPUS: usize = 64;
/// The maximum number of distinct TLBs, every CPU may have its own
pub const MAX_TLBS: usize = MAX_CPUS;

/// Runtime policy knobs of the ASID layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub(crate) flush_asid_on_reset: bool,
    pub(crate) need_shootdown: bool,
    pub(crate) multiprocessor: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            flush_asid_on_reset: false,
            need_shootdown: true,
            multiprocessor: true,
        }
    }

    /// Return the ASID of a reset association to the free pool right away instead of waiting for
    /// the next reinitialization. The stale entries are invalidated at reset time on uniprocessor
    /// configurations and when the ASID is handed out again on multiprocessor configurations.
    #[must_use]
    pub const fn with_flush_asid_on_reset(mut self, flush: bool) -> Self {
        self.flush_asid_on_reset = flush;
        self
    }

    /// Whether remote TLBs are kept coherent with shootdown IPIs. Without shootdowns the resident
    /// ASIDs of other CPUs can't be inspected, so reclaiming ASIDs always invalidates everything.
    #[must_use]
    pub const fn with_shootdown(mut self, need_shootdown: bool) -> Self {
        self.need_shootdown = need_shootdown;
        self
    }

    #[must_use]
    pub const fn with_multiprocessor(mut self, multiprocessor: bool) -> Self {
        self.multiprocessor = multiprocessor;
        self
    }

    pub const fn flush_asid_on_reset(&self) -> bool {
        self.flush_asid_on_reset
    }

    pub const fn need_shootdown(&self) -> bool {
        self.need_shootdown
    }

    pub const fn multiprocessor(&self) -> bool {
        self.multiprocessor
    }
}
