// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::cpu_set::{AtomicCpuSet, CpuSet};

static NEXT_PMAP_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of a [`Pmap`], unique for the lifetime of the program.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PmapId(u64);

impl PmapId {
    pub const KERNEL: Self = Self(0);

    fn next() -> Self {
        Self(NEXT_PMAP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// The parts of a physical map (address space) the TLB layer keeps track of.
///
/// The page tables themselves live elsewhere. What is tracked here is on which CPUs the address
/// space is loaded (`onproc`) and on which CPUs the TLB holds a valid ASID for it (`active`).
pub struct Pmap {
    id: PmapId,
    kernel: bool,
    /// CPUs of every TLB that has an ASID assigned to this pmap. The bits belonging to a TLB are
    /// only changed while holding that TLB's lock.
    pub(crate) active: AtomicCpuSet,
    /// CPUs currently running with this pmap.
    pub(crate) onproc: AtomicCpuSet,
    shootdown_pending: AtomicBool,
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .field("active", &self.active)
            .field("onproc", &self.onproc)
            .field("shootdown_pending", &self.shootdown_pending())
            .finish()
    }
}

impl Default for Pmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Pmap {
    /// Returns a new user pmap that has no ASID assigned on any TLB.
    pub fn new() -> Self {
        Self {
            id: PmapId::next(),
            kernel: false,
            active: AtomicCpuSet::default(),
            onproc: AtomicCpuSet::default(),
            shootdown_pending: AtomicBool::new(false),
        }
    }

    /// Returns the kernel pmap. All of its mappings are global and tagged with the kernel ASID.
    pub const fn kernel() -> Self {
        Self {
            id: PmapId::KERNEL,
            kernel: true,
            active: AtomicCpuSet::new(CpuSet::EMPTY),
            onproc: AtomicCpuSet::new(CpuSet::EMPTY),
            shootdown_pending: AtomicBool::new(false),
        }
    }

    pub const fn id(&self) -> PmapId {
        self.id
    }

    pub const fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn active(&self) -> CpuSet {
        self.active.load()
    }

    pub fn onproc(&self) -> CpuSet {
        self.onproc.load()
    }

    /// Whether TLB entries were changed locally that other CPUs may still cache.
    pub fn shootdown_pending(&self) -> bool {
        self.shootdown_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_shootdown_pending(&self, pending: bool) {
        self.shootdown_pending.store(pending, Ordering::Release);
    }

    /// Clears the pending flag, returning whether it was set.
    pub fn take_shootdown_pending(&self) -> bool {
        self.shootdown_pending.swap(false, Ordering::AcqRel)
    }
}
