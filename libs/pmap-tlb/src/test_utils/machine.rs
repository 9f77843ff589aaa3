// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use crate::test_utils::EmulateArch;
use crate::{Asid, AsidBitmap, Config, CpuContext, CpuId, PmapTlb, VirtualAddress};

/// A hardware operation performed on an emulated TLB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlbOp {
    InvalidateAll,
    InvalidateAsids(RangeInclusive<u16>),
    InvalidateGlobals,
    InvalidateAddr(VirtualAddress, Asid),
}

/// A "virtual machine" with a number of CPUs grouped onto a number of TLBs. It is intended to be
/// used in tests and supports modeling the following properties:
///
/// - per-TLB caches of `(asid, address) -> pte` translations, global (kernel) entries included
/// - per-CPU current ASID registers
/// - shootdown interrupts pending on each CPU
pub struct Machine(Arc<MachineInner>);

struct MachineInner {
    asid_max: u16,
    tlbs: Vec<Mutex<Tlb>>,
    cpus: Vec<Mutex<Cpu>>,
}

#[derive(Debug, Default)]
struct Tlb {
    entries: BTreeMap<(Asid, VirtualAddress), u64>,
    log: Vec<TlbOp>,
}

#[derive(Debug)]
struct Cpu {
    tlb: usize,
    asid: Asid,
    pending_ipis: usize,
}

impl Clone for Machine {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("asid_max", &self.0.asid_max)
            .field("tlbs", &self.0.tlbs)
            .field("cpus", &self.0.cpus)
            .finish()
    }
}

impl Machine {
    pub fn asid_max(&self) -> u16 {
        self.0.asid_max
    }

    pub fn num_cpus(&self) -> usize {
        self.0.cpus.len()
    }

    pub fn num_tlbs(&self) -> usize {
        self.0.tlbs.len()
    }

    /// Index of the TLB `cpu` translates through.
    pub fn tlb_of(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).tlb
    }

    pub fn current_asid(&self, cpu: CpuId) -> Asid {
        self.cpu(cpu).asid
    }

    pub fn set_current_asid(&self, cpu: CpuId, asid: Asid) {
        self.cpu(cpu).asid = asid;
    }

    /// Emulates a TLB refill on `cpu`, caching `address -> pte` under the CPU's current ASID.
    pub fn fill(&self, cpu: CpuId, address: VirtualAddress, pte: u64) {
        let (tlb, asid) = {
            let cpu = self.cpu(cpu);
            (cpu.tlb, cpu.asid)
        };
        self.insert(tlb, asid, address, pte);
    }

    /// Caches a translation under an explicit ASID, [`Asid::KERNEL`] making it a global entry.
    pub fn insert(&self, tlb: usize, asid: Asid, address: VirtualAddress, pte: u64) {
        self.tlb(tlb).entries.insert((asid, address), pte);
    }

    /// Looks `address` up the way the hardware of `cpu` would: global entries first, then entries
    /// of the CPU's current ASID.
    pub fn translate(&self, cpu: CpuId, address: VirtualAddress) -> Option<u64> {
        let (tlb, asid) = {
            let cpu = self.cpu(cpu);
            (cpu.tlb, cpu.asid)
        };
        let tlb = self.tlb(tlb);
        tlb.entries
            .get(&(Asid::KERNEL, address))
            .or_else(|| tlb.entries.get(&(asid, address)))
            .copied()
    }

    /// All entries resident in `tlb`.
    pub fn entries(&self, tlb: usize) -> Vec<(Asid, VirtualAddress, u64)> {
        self.tlb(tlb)
            .entries
            .iter()
            .map(|((asid, address), pte)| (*asid, *address, *pte))
            .collect()
    }

    /// The user ASIDs that have at least one entry resident in `tlb`.
    pub fn resident_asids(&self, tlb: usize) -> BTreeSet<u16> {
        self.tlb(tlb)
            .entries
            .keys()
            .filter(|(asid, _)| !asid.is_kernel())
            .map(|(asid, _)| asid.get())
            .collect()
    }

    /// Returns and clears the hardware operations performed on `tlb` so far.
    pub fn take_log(&self, tlb: usize) -> Vec<TlbOp> {
        std::mem::take(&mut self.tlb(tlb).log)
    }

    pub fn pending_ipis(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).pending_ipis
    }

    /// Acknowledges all shootdown IPIs pending on `cpu`, returning `true` if there were any.
    pub fn take_ipis(&self, cpu: CpuId) -> bool {
        std::mem::take(&mut self.cpu(cpu).pending_ipis) > 0
    }

    pub(super) fn invalidate_all(&self, tlb: usize) {
        let mut tlb = self.tlb(tlb);
        tlb.entries.clear();
        tlb.log.push(TlbOp::InvalidateAll);
    }

    pub(super) fn invalidate_asids(&self, tlb: usize, asids: RangeInclusive<u16>) {
        let mut tlb = self.tlb(tlb);
        tlb.entries
            .retain(|(asid, _), _| asid.is_kernel() || !asids.contains(&asid.get()));
        tlb.log.push(TlbOp::InvalidateAsids(asids));
    }

    pub(super) fn invalidate_globals(&self, tlb: usize) {
        let mut tlb = self.tlb(tlb);
        tlb.entries.retain(|(asid, _), _| !asid.is_kernel());
        tlb.log.push(TlbOp::InvalidateGlobals);
    }

    pub(super) fn invalidate_addr(&self, tlb: usize, address: VirtualAddress, asid: Asid) {
        let mut tlb = self.tlb(tlb);
        tlb.entries.remove(&(asid, address));
        tlb.log.push(TlbOp::InvalidateAddr(address, asid));
    }

    pub(super) fn update_addr(
        &self,
        tlb: usize,
        address: VirtualAddress,
        asid: Asid,
        pte: u64,
        insert: bool,
    ) -> bool {
        let mut tlb = self.tlb(tlb);
        match tlb.entries.get_mut(&(asid, address)) {
            Some(entry) => {
                *entry = pte;
                true
            }
            None if insert => {
                tlb.entries.insert((asid, address), pte);
                true
            }
            None => false,
        }
    }

    pub(super) fn record_asids(&self, tlb: usize, bitmap: &mut AsidBitmap) -> usize {
        let asid_max = bitmap.asid_max();
        self.resident_asids(tlb)
            .into_iter()
            .filter(|asid| *asid <= asid_max)
            .filter(|asid| bitmap.insert(*asid))
            .count()
    }

    pub(super) fn walk(&self, tlb: usize, f: &mut dyn FnMut(VirtualAddress, Asid, u64) -> bool) {
        // copy out so the callback may poke at the machine
        for (asid, address, pte) in self.entries(tlb) {
            if !f(address, asid, pte) {
                break;
            }
        }
    }

    pub(super) fn raise_ipi(&self, target: CpuId) {
        self.cpu(target).pending_ipis += 1;
    }

    fn tlb(&self, index: usize) -> MutexGuard<'_, Tlb> {
        self.0.tlbs[index].lock().unwrap()
    }

    fn cpu(&self, cpu: CpuId) -> MutexGuard<'_, Cpu> {
        self.0.cpus[cpu.get()].lock().unwrap()
    }
}

pub struct MachineBuilder {
    asid_max: u16,
    cpus_per_tlb: Vec<usize>,
}

pub struct BootstrapResult<R: lock_api::RawMutex> {
    pub machine: Machine,
    pub pmap_tlb: PmapTlb<R>,
    /// Execution contexts of all CPUs, indexed by CPU number
    pub cpus: Vec<CpuContext<EmulateArch>>,
}

impl MachineBuilder {
    pub fn new(asid_max: u16) -> Self {
        Self {
            asid_max,
            cpus_per_tlb: Vec::new(),
        }
    }

    /// Adds one TLB per element, shared by that many CPUs. CPUs are numbered consecutively.
    pub fn with_tlbs(mut self, cpus_per_tlb: impl IntoIterator<Item = usize>) -> Self {
        self.cpus_per_tlb.extend(cpus_per_tlb);
        self
    }

    /// # Panics
    ///
    /// Panics if no TLB was added.
    pub fn finish(self) -> Machine {
        assert!(
            !self.cpus_per_tlb.is_empty(),
            "you must specify at least one TLB"
        );

        let tlbs = self
            .cpus_per_tlb
            .iter()
            .map(|_| Mutex::new(Tlb::default()))
            .collect();

        let cpus = self
            .cpus_per_tlb
            .iter()
            .enumerate()
            .flat_map(|(tlb, count)| (0..*count).map(move |_| tlb))
            .map(|tlb| {
                Mutex::new(Cpu {
                    tlb,
                    asid: Asid::KERNEL,
                    pending_ipis: 0,
                })
            })
            .collect();

        Machine(Arc::new(MachineInner {
            asid_max: self.asid_max,
            tlbs,
            cpus,
        }))
    }

    /// Builds the machine and describes its topology to a fresh [`PmapTlb`].
    ///
    /// # Panics
    ///
    /// Panics if no TLB was added or the topology exceeds [`MAX_TLBS`](crate::MAX_TLBS) TLBs.
    pub fn finish_and_bootstrap<R: lock_api::RawMutex>(self, config: Config) -> BootstrapResult<R> {
        let machine = self.finish();
        let mut pmap_tlb = PmapTlb::new(config);

        for _ in 0..machine.num_tlbs() {
            pmap_tlb.add_tlb(machine.asid_max()).unwrap();
        }

        let cpus = (0..machine.num_cpus())
            .map(|index| {
                let cpu = CpuId::new(index);
                let arch = EmulateArch::new(machine.clone(), cpu);
                pmap_tlb
                    .attach_cpu(machine.tlb_of(cpu), cpu, arch)
                    .unwrap()
            })
            .collect();

        BootstrapResult {
            machine,
            pmap_tlb,
            cpus,
        }
    }
}
