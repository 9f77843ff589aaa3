// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use lock_api::RawMutex;

use crate::arch::Arch;
use crate::tlb_info::Reinit;
use crate::{
    Asid, Config, CpuContext, CpuId, CpuSet, Error, MAX_TLBS, Pmap, TlbInfo, VirtualAddress,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateFlags: u8 {
        /// Create the entry if it isn't resident yet.
        const INSERT = 1 << 0;
        /// Other CPUs may cache the old translation and need to be shot down.
        const NEED_IPI = 1 << 1;
    }
}

/// ASID management for all TLBs of the machine.
///
/// `R` is the raw lock protecting each TLB record.
pub struct PmapTlb<R: RawMutex> {
    pub(crate) config: Config,
    tlbs: Vec<TlbInfo<R>>,
    attached: CpuSet,
}

impl<R: RawMutex> core::fmt::Debug for PmapTlb<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PmapTlb")
            .field("config", &self.config)
            .field("tlbs", &self.tlbs)
            .field("attached", &self.attached)
            .finish()
    }
}

impl<R: RawMutex> PmapTlb<R> {
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            tlbs: Vec::new(),
            attached: CpuSet::EMPTY,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a TLB whose ASIDs range up to `asid_max` and returns its index.
    ///
    /// # Errors
    ///
    /// Returns an error if there already are [`MAX_TLBS`] TLBs or the ASID space has no room for
    /// user ASIDs.
    pub fn add_tlb(&mut self, asid_max: u16) -> Result<usize, Error> {
        if self.tlbs.len() >= MAX_TLBS {
            return Err(Error::TooManyTlbs);
        }
        if asid_max < Asid::FIRST_USER {
            return Err(Error::InvalidAsidMax(asid_max));
        }

        let index = self.tlbs.len();
        self.tlbs.push(TlbInfo::new(index, asid_max));
        log::debug!("tlb{index}: ASIDs {}..={asid_max}", Asid::FIRST_USER);

        Ok(index)
    }

    /// Attaches `cpu` to the TLB at index `tlb` and returns the CPU's execution context.
    ///
    /// The CPU starts out running with the kernel ASID.
    ///
    /// # Errors
    ///
    /// Returns an error if
    /// - no TLB with index `tlb` exists,
    /// - `cpu` was attached before,
    /// - the hardware of `cpu` supports fewer ASIDs than the TLB record hands out,
    /// - or the TLB would be shared by more CPUs than it has user ASIDs.
    pub fn attach_cpu<A: Arch>(
        &mut self,
        tlb: usize,
        cpu: CpuId,
        arch: A,
    ) -> Result<CpuContext<A>, Error> {
        let ti = self.tlbs.get(tlb).ok_or(Error::NoSuchTlb(tlb))?;
        if self.attached.contains(cpu) {
            return Err(Error::CpuAlreadyAttached(cpu));
        }

        let hw = arch.asid_max();
        if hw < ti.asid_max() {
            return Err(Error::AsidMaxMismatch { tlb, cpu, hw });
        }
        if hw > ti.asid_max() {
            log::warn!(
                "{}: CPU {cpu} supports ASIDs up to {hw}, using {}",
                ti.name(),
                ti.asid_max()
            );
        }

        // every CPU on the TLB must be able to run with a user ASID of its own
        if ti.cpus().len() >= usize::from(ti.asid_max()) {
            return Err(Error::TooManyCpus {
                tlb,
                asid_max: ti.asid_max(),
            });
        }

        ti.attach(cpu);
        self.attached.insert(cpu);
        log::debug!("{}: attached CPU {cpu}", ti.name());

        let mut ctx = CpuContext::new(cpu, tlb, arch);
        ctx.switch_asid(Asid::KERNEL);
        Ok(ctx)
    }

    pub fn tlbs(&self) -> impl ExactSizeIterator<Item = &TlbInfo<R>> {
        self.tlbs.iter()
    }

    pub fn tlb(&self, index: usize) -> Option<&TlbInfo<R>> {
        self.tlbs.get(index)
    }

    /// All CPUs attached to any TLB.
    pub const fn attached_cpus(&self) -> CpuSet {
        self.attached
    }

    pub(crate) fn local_tlb<A: Arch>(&self, ctx: &CpuContext<A>) -> &TlbInfo<R> {
        &self.tlbs[ctx.tlb()]
    }

    /// Makes `pmap` the address space the CPU of `ctx` translates with, assigning it an ASID on the
    /// CPU's TLB first if needed.
    ///
    /// Running out of ASIDs reclaims the ASID space of the TLB, this never fails.
    ///
    /// # Panics
    ///
    /// Panics if reclaiming the ASID space did not free a single ASID. This only happens if every
    /// user ASID belongs to a running pmap, i.e. the calling CPU did not deactivate its previous
    /// pmap on a TLB shared by as many CPUs as it has user ASIDs.
    pub fn acquire<A: Arch>(&self, pmap: &Arc<Pmap>, ctx: &mut CpuContext<A>) {
        // the kernel shares the reserved ASID
        if pmap.is_kernel() {
            return;
        }

        let ti = self.local_tlb(ctx);
        let mut state = ti.lock();

        let asid = if let Some(pai) = state.pais.get(&pmap.id()) {
            pai.asid
        } else {
            if state.space.is_exhausted() {
                log::debug!("{}: out of ASIDs", ti.name());
                ti.reinitialize_locked(&mut state, Reinit::Reclaim, &self.config, ctx);
                // resident and running ASIDs together may still fill the space
                if state.space.is_exhausted() {
                    ti.reinitialize_locked(&mut state, Reinit::AllUser, &self.config, ctx);
                }
                assert!(
                    !state.space.is_exhausted(),
                    "{}: reclaiming did not free any ASIDs",
                    ti.name()
                );
            }
            ti.asid_alloc(&mut state, pmap, &self.config, ctx.arch())
        };

        // only changed while holding the TLB lock
        pmap.onproc.insert(ctx.id());
        ctx.switch_asid(asid);
        ctx.check_asid();
    }

    /// Switches the CPU of `ctx` away from `pmap`, back to the kernel ASID.
    ///
    /// The pmap keeps its ASID, so switching back to it later is cheap.
    pub fn deactivate<A: Arch>(&self, pmap: &Pmap, ctx: &mut CpuContext<A>) {
        if !pmap.is_kernel() {
            pmap.onproc.remove(ctx.id());
        }
        ctx.switch_asid(Asid::KERNEL);
        ctx.check_asid();
    }

    /// Releases the ASIDs `pmap` holds on any TLB, usually because the pmap is being destroyed.
    ///
    /// If the pmap is still loaded on the calling CPU, its ASID stays assigned on that TLB but all
    /// entries tagged with it are invalidated.
    ///
    /// # Panics
    ///
    /// Panics if `pmap` is the kernel pmap or is running on a CPU other than the caller's.
    pub fn release_all<A: Arch>(&self, pmap: &Pmap, ctx: &CpuContext<A>) {
        assert!(!pmap.is_kernel(), "the kernel pmap can't be released");
        let onproc = pmap.onproc();
        assert!(
            !onproc.contains_other_than(ctx.id()),
            "pmap {:?} released while running on {onproc:?}",
            pmap.id()
        );

        for ti in &self.tlbs {
            if pmap.active().is_empty() {
                break;
            }

            let mut state = ti.lock();
            let Some(asid) = state.pais.get(&pmap.id()).map(|pai| pai.asid) else {
                continue;
            };

            if onproc.intersects(ti.cpus()) {
                debug_assert_eq!(ti.index(), ctx.tlb());
                let asid = asid.get();
                ctx.check_asid();
                ctx.arch().invalidate_asids(asid..=asid);
                ctx.check_asid();
            } else {
                if state.victim == Some(pmap.id()) {
                    state.victim = None;
                }
                ti.pai_reset(&mut state, pmap.id(), &self.config, ctx.arch());
            }
        }
    }

    /// Reclaims the ASID space of the caller's TLB.
    pub fn reinitialize<A: Arch>(&self, op: Reinit, ctx: &CpuContext<A>) {
        let ti = self.local_tlb(ctx);
        let mut state = ti.lock();
        ti.reinitialize_locked(&mut state, op, &self.config, ctx);
    }

    /// Drops the translation of `address` in `pmap` from the caller's TLB and marks the pmap as
    /// needing a shootdown of the other TLBs.
    pub fn invalidate_addr<A: Arch>(
        &self,
        pmap: &Pmap,
        address: VirtualAddress,
        ctx: &CpuContext<A>,
    ) {
        let ti = self.local_tlb(ctx);
        let state = ti.lock();

        let asid = if pmap.is_kernel() {
            Some(Asid::KERNEL)
        } else {
            state.pais.get(&pmap.id()).map(|pai| pai.asid)
        };

        if let Some(asid) = asid {
            ctx.check_asid();
            ctx.arch().invalidate_addr(address, asid);
            ctx.check_asid();
        }

        pmap.set_shootdown_pending(true);
    }

    /// Updates the translation of `address` in `pmap` in the caller's TLB.
    ///
    /// Returns `None` if the pmap holds no ASID on this TLB, in which case no entry can be
    /// resident. Otherwise returns whether the TLB was changed.
    pub fn update_addr<A: Arch>(
        &self,
        pmap: &Pmap,
        address: VirtualAddress,
        pte: A::PageTableEntry,
        flags: UpdateFlags,
        ctx: &CpuContext<A>,
    ) -> Option<bool> {
        let ti = self.local_tlb(ctx);
        let state = ti.lock();

        let asid = if pmap.is_kernel() {
            Some(Asid::KERNEL)
        } else {
            state.pais.get(&pmap.id()).map(|pai| pai.asid)
        };

        let updated = asid.map(|asid| {
            ctx.check_asid();
            let updated =
                ctx.arch()
                    .update_addr(address, asid, pte, flags.contains(UpdateFlags::INSERT));
            ctx.check_asid();
            updated
        });

        if self.config.multiprocessor && self.config.need_shootdown {
            pmap.set_shootdown_pending(flags.contains(UpdateFlags::NEED_IPI));
        }

        updated
    }

    /// Walks the entries of the caller's TLB if `pmap` may have any resident.
    pub fn check<A, F>(&self, pmap: &Pmap, ctx: &CpuContext<A>, mut f: F)
    where
        A: Arch,
        F: FnMut(VirtualAddress, Asid, A::PageTableEntry) -> bool,
    {
        let ti = self.local_tlb(ctx);
        let state = ti.lock();
        if pmap.is_kernel() || state.pais.contains_key(&pmap.id()) {
            ctx.arch().walk(&mut f);
        }
    }

    /// Asserts the hardware runs with the ASID `ctx` expects. Only checked in debug builds.
    pub fn asid_check<A: Arch>(&self, ctx: &CpuContext<A>) {
        ctx.check_asid();
    }
}
