// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::arch::Arch;
use crate::{Asid, CpuId};

/// Execution context of a single CPU.
///
/// Every operation that touches TLB hardware takes the context of the CPU it runs on. The context
/// is owned by that CPU, so nothing in here needs synchronization.
pub struct CpuContext<A> {
    id: CpuId,
    tlb: usize,
    asid_cur: Asid,
    arch: A,
}

impl<A> fmt::Debug for CpuContext<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuContext")
            .field("id", &self.id)
            .field("tlb", &self.tlb)
            .field("asid_cur", &self.asid_cur)
            .finish_non_exhaustive()
    }
}

impl<A> CpuContext<A> {
    pub(crate) const fn new(id: CpuId, tlb: usize, arch: A) -> Self {
        Self {
            id,
            tlb,
            asid_cur: Asid::KERNEL,
            arch,
        }
    }

    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// Index of the TLB this CPU translates through.
    pub const fn tlb(&self) -> usize {
        self.tlb
    }

    /// The ASID this CPU is supposed to be running with.
    pub const fn asid_cur(&self) -> Asid {
        self.asid_cur
    }

    pub const fn arch(&self) -> &A {
        &self.arch
    }
}

impl<A: Arch> CpuContext<A> {
    pub(crate) fn switch_asid(&mut self, asid: Asid) {
        self.asid_cur = asid;
        self.arch.set_asid(asid);
    }

    /// Asserts that the hardware runs with the ASID we think it does.
    ///
    /// Only checked in debug builds.
    pub(crate) fn check_asid(&self) {
        if cfg!(debug_assertions) {
            let asid = self.arch.get_asid();
            assert_eq!(
                asid, self.asid_cur,
                "CPU {}: hardware ASID {asid} differs from expected ASID {}",
                self.id, self.asid_cur
            );
        }
    }
}
