// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::RangeInclusive;

use crate::test_utils::Machine;
use crate::{Arch, Asid, AsidBitmap, CpuId, VirtualAddress};

/// [`Arch`] implementation that drives the TLB of one CPU of an emulated [`Machine`].
///
/// For testing purposes.
pub struct EmulateArch {
    machine: Machine,
    cpu: CpuId,
}

impl fmt::Debug for EmulateArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulateArch")
            .field("cpu", &self.cpu)
            .field("machine", &self.machine)
            .finish()
    }
}

impl EmulateArch {
    pub const fn new(machine: Machine, cpu: CpuId) -> Self {
        Self { machine, cpu }
    }

    pub const fn machine(&self) -> &Machine {
        &self.machine
    }

    fn tlb(&self) -> usize {
        self.machine.tlb_of(self.cpu)
    }
}

impl Arch for EmulateArch {
    type PageTableEntry = u64;

    fn asid_max(&self) -> u16 {
        self.machine.asid_max()
    }

    fn invalidate_all(&self) {
        self.machine.invalidate_all(self.tlb());
    }

    fn invalidate_asids(&self, asids: RangeInclusive<u16>) {
        self.machine.invalidate_asids(self.tlb(), asids);
    }

    fn invalidate_globals(&self) {
        self.machine.invalidate_globals(self.tlb());
    }

    fn invalidate_addr(&self, address: VirtualAddress, asid: Asid) {
        self.machine.invalidate_addr(self.tlb(), address, asid);
    }

    fn update_addr(&self, address: VirtualAddress, asid: Asid, pte: u64, insert: bool) -> bool {
        self.machine
            .update_addr(self.tlb(), address, asid, pte, insert)
    }

    fn set_asid(&self, asid: Asid) {
        self.machine.set_current_asid(self.cpu, asid);
    }

    fn get_asid(&self) -> Asid {
        self.machine.current_asid(self.cpu)
    }

    fn record_asids(&self, bitmap: &mut AsidBitmap) -> usize {
        self.machine.record_asids(self.tlb(), bitmap)
    }

    fn walk(&self, f: &mut dyn FnMut(VirtualAddress, Asid, u64) -> bool) {
        self.machine.walk(self.tlb(), f);
    }

    fn send_shootdown_ipi(&self, target: CpuId) {
        self.machine.raise_ipi(target);
    }
}
