// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::RangeInclusive;

use crate::{Asid, AsidBitmap, CpuId, VirtualAddress};

/// Machine-dependent TLB primitives.
///
/// An `Arch` value is a handle to the TLB hardware of *one* CPU, every method acts on the TLB the
/// owning CPU executes on. The only exception is [`Arch::send_shootdown_ipi`] which reaches out to
/// another CPU.
pub trait Arch {
    type PageTableEntry: Copy + fmt::Debug;

    /// The largest ASID the hardware supports.
    fn asid_max(&self) -> u16;

    /// Invalidates every entry, global ones included.
    fn invalidate_all(&self);

    /// Invalidates all non-global entries tagged with an ASID in `asids`.
    fn invalidate_asids(&self, asids: RangeInclusive<u16>);

    /// Invalidates all global (kernel) entries.
    fn invalidate_globals(&self);

    /// Invalidates the entry translating `address` in `asid`.
    ///
    /// [`Asid::KERNEL`] addresses the global entry.
    fn invalidate_addr(&self, address: VirtualAddress, asid: Asid);

    /// Updates the entry translating `address` in `asid` if it is resident, or creates it when
    /// `insert` is set. Returns `true` if the hardware was changed.
    fn update_addr(
        &self,
        address: VirtualAddress,
        asid: Asid,
        pte: Self::PageTableEntry,
        insert: bool,
    ) -> bool;

    /// Programs the ASID used for translations on this CPU.
    fn set_asid(&self, asid: Asid);

    /// Reads the ASID used for translations on this CPU.
    fn get_asid(&self) -> Asid;

    /// Marks every user ASID that has at least one entry resident in the TLB in `bitmap`.
    ///
    /// Returns the number of ASIDs that were newly marked.
    fn record_asids(&self, bitmap: &mut AsidBitmap) -> usize;

    /// Calls `f` for every resident entry until it returns `false`.
    fn walk(&self, f: &mut dyn FnMut(VirtualAddress, Asid, Self::PageTableEntry) -> bool);

    /// Sends a TLB shootdown interprocessor interrupt to `target`.
    ///
    /// This must not wait for the target to process the interrupt.
    fn send_shootdown_ipi(&self, target: CpuId);
}
