// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Write;

use arrayvec::ArrayString;
use lock_api::{Mutex, MutexGuard, RawMutex};
use static_assertions::const_assert;

use crate::arch::Arch;
use crate::cpu_set::{AtomicCpuSet, CpuSet};
use crate::metrics::TlbCounters;
use crate::shootdown::TlbInvOp;
use crate::{Asid, AsidBitmap, Config, CpuContext, CpuId, MAX_TLBS, Pmap, PmapId};

const NAME_LEN: usize = 8;

// "tlb" plus the decimal index of the last TLB
const_assert!(MAX_TLBS <= 100_000);
const_assert!(NAME_LEN >= "tlb".len() + 5);

/// How [`PmapTlb::reinitialize`](crate::PmapTlb::reinitialize) makes room in the ASID space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reinit {
    /// Keep every ASID that still has entries resident in the TLB and only recycle the rest.
    /// Falls back to invalidating all user ASIDs when too few would be recycled.
    Reclaim,
    /// Invalidate every user ASID.
    AllUser,
    /// Invalidate the whole TLB, global entries included.
    All,
}

/// An ASID assigned to a pmap on one TLB.
pub(crate) struct Pai {
    pub(crate) asid: Asid,
    pub(crate) pmap: Arc<Pmap>,
}

/// The ASID bitmap together with its bookkeeping.
pub(crate) struct AsidSpace {
    bitmap: AsidBitmap,
    /// Number of user ASIDs not marked in `bitmap`
    free: usize,
    /// Where the next allocation starts looking. May point one past the largest ASID.
    hint: u32,
}

impl AsidSpace {
    fn new(asid_max: u16) -> Self {
        Self {
            bitmap: AsidBitmap::new(asid_max),
            free: usize::from(asid_max),
            hint: u32::from(Asid::FIRST_USER),
        }
    }

    fn max(&self) -> u16 {
        self.bitmap.asid_max()
    }

    fn reset(&mut self) {
        self.bitmap.reset();
        self.free = usize::from(self.max());
        self.hint = u32::from(Asid::FIRST_USER);
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.free == 0
    }

    pub(crate) fn is_used(&self, asid: u16) -> bool {
        self.bitmap.contains(asid)
    }

    fn mark_used(&mut self, asid: u16) {
        if self.bitmap.insert(asid) {
            self.free -= 1;
        }
    }

    fn mark_unused(&mut self, asid: u16) {
        if self.bitmap.remove(asid) {
            self.free += 1;
        }
    }

    /// Takes the next free ASID at or after the hint and advances the hint past it.
    fn take_next(&mut self) -> u16 {
        assert!(!self.is_exhausted(), "no free ASIDs left");

        if self.hint > u32::from(self.max()) {
            self.hint = u32::from(Asid::FIRST_USER);
        }

        // the hint is at most `max` now, so it fits
        let hint = u16::try_from(self.hint).unwrap_or(Asid::FIRST_USER);
        let asid = if self.bitmap.contains(hint) {
            let Some(asid) = self.bitmap.find_clear_from(hint) else {
                panic!(
                    "ASID bitmap is full but {} ASIDs are accounted as free",
                    self.free
                );
            };
            asid
        } else {
            hint
        };

        assert!(asid >= Asid::FIRST_USER);
        let fresh = self.bitmap.insert(asid);
        assert!(fresh, "ASID {asid} handed out twice");
        self.free -= 1;
        self.hint = u32::from(asid) + 1;

        asid
    }

    fn check(&self) {
        debug_assert_eq!(
            self.free,
            usize::from(self.max()) - self.bitmap.count_user(),
            "free ASID count out of sync with the bitmap"
        );
    }
}

pub(crate) struct TlbState {
    pub(crate) space: AsidSpace,
    pub(crate) pais: BTreeMap<PmapId, Pai>,
    pub(crate) invop: TlbInvOp,
    pub(crate) victim: Option<PmapId>,
}

/// The record of one TLB, shared by all CPUs that translate through it.
pub struct TlbInfo<R: RawMutex> {
    name: ArrayString<NAME_LEN>,
    index: usize,
    asid_max: u16,
    cpus: AtomicCpuSet,
    counters: TlbCounters,
    state: Mutex<R, TlbState>,
}

impl<R: RawMutex> fmt::Debug for TlbInfo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlbInfo")
            .field("name", &self.name.as_str())
            .field("index", &self.index)
            .field("asid_max", &self.asid_max)
            .field("cpus", &self.cpus)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

/// A consistent copy of a TLB's ASID bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlbSnapshot {
    pub asid_max: u16,
    pub asids_free: usize,
    /// Where the next allocation starts looking
    pub asid_hint: u32,
    /// User ASIDs marked in the bitmap, in ascending order
    pub in_use: Vec<u16>,
    /// Assigned ASIDs, ordered by pmap
    pub active: Vec<(PmapId, Asid)>,
    pub pending: TlbInvOp,
}

impl<R: RawMutex> TlbInfo<R> {
    pub(crate) fn new(index: usize, asid_max: u16) -> Self {
        let mut name = ArrayString::new();
        let res = write!(name, "tlb{index}");
        debug_assert!(res.is_ok(), "TLB name for index {index} overflows");

        Self {
            name,
            index,
            asid_max,
            cpus: AtomicCpuSet::default(),
            counters: TlbCounters::new(),
            state: Mutex::new(TlbState {
                space: AsidSpace::new(asid_max),
                pais: BTreeMap::new(),
                invop: TlbInvOp::Nobody,
                victim: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub const fn asid_max(&self) -> u16 {
        self.asid_max
    }

    /// CPUs translating through this TLB.
    pub fn cpus(&self) -> CpuSet {
        self.cpus.load()
    }

    pub const fn counters(&self) -> &TlbCounters {
        &self.counters
    }

    /// The ASID `pmap` holds on this TLB, if any.
    pub fn asid_of(&self, pmap: &Pmap) -> Option<Asid> {
        if pmap.is_kernel() {
            return Some(Asid::KERNEL);
        }
        self.lock().pais.get(&pmap.id()).map(|pai| pai.asid)
    }

    pub fn snapshot(&self) -> TlbSnapshot {
        let state = self.lock();
        TlbSnapshot {
            asid_max: self.asid_max,
            asids_free: state.space.free,
            asid_hint: state.space.hint,
            in_use: state.space.bitmap.iter_user().collect(),
            active: state
                .pais
                .iter()
                .map(|(id, pai)| (*id, pai.asid))
                .collect(),
            pending: state.invop,
        }
    }

    pub(crate) fn attach(&self, cpu: CpuId) {
        self.cpus.insert(cpu);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, R, TlbState> {
        self.state.lock()
    }

    /// Assigns a fresh ASID to `pmap`, which must not hold one on this TLB yet.
    pub(crate) fn asid_alloc<A: Arch>(
        &self,
        state: &mut TlbState,
        pmap: &Arc<Pmap>,
        config: &Config,
        arch: &A,
    ) -> Asid {
        let cpus = self.cpus();
        if config.multiprocessor {
            debug_assert!(!pmap.onproc().intersects(cpus));
            debug_assert!(!pmap.active().intersects(cpus));
        }

        let raw = state.space.take_next();
        if config.multiprocessor && config.flush_asid_on_reset {
            // the ASID may have been freed at reset time with entries still resident
            arch.invalidate_asids(raw..=raw);
        }

        let asid = Asid::from_raw(raw);
        let prev = state.pais.insert(
            pmap.id(),
            Pai {
                asid,
                pmap: Arc::clone(pmap),
            },
        );
        assert!(
            prev.is_none(),
            "{}: pmap {:?} already holds an ASID",
            self.name,
            pmap.id()
        );

        pmap.active.insert_all(cpus);
        state.space.check();

        log::trace!("{}: assigned ASID {asid} to pmap {:?}", self.name, pmap.id());
        asid
    }

    /// Unlinks the ASID association of `id`. The pmap must not be running on this TLB.
    ///
    /// Unless configured to flush on reset, the ASID stays marked in the bitmap: entries tagged
    /// with it may still be resident, they age out naturally or get dropped by the next
    /// reinitialization.
    pub(crate) fn pai_reset<A: Arch>(
        &self,
        state: &mut TlbState,
        id: PmapId,
        config: &Config,
        arch: &A,
    ) {
        let Some(pai) = state.pais.remove(&id) else {
            panic!("{}: pmap {id:?} holds no ASID", self.name);
        };
        self.forget(&mut state.space, &pai, config, arch);
    }

    fn forget<A: Arch>(&self, space: &mut AsidSpace, pai: &Pai, config: &Config, arch: &A) {
        let asid = pai.asid.get();
        assert!(
            (Asid::FIRST_USER..=space.max()).contains(&asid),
            "{}: bogus ASID {asid}",
            self.name
        );

        let cpus = self.cpus();
        if config.multiprocessor {
            debug_assert!(pai.pmap.active().intersects(cpus));
            assert!(
                !pai.pmap.onproc().intersects(cpus),
                "{}: resetting ASID {asid} of a running pmap",
                self.name
            );
        }

        if config.flush_asid_on_reset {
            if !config.multiprocessor {
                arch.invalidate_asids(asid..=asid);
            }
            space.mark_unused(asid);
        }

        pai.pmap.active.remove_all(cpus);
        log::trace!(
            "{}: reset ASID {asid} of pmap {:?}",
            self.name,
            pai.pmap.id()
        );
    }

    /// Reclaims the ASID space of this TLB. `ctx` must belong to a CPU of this TLB.
    pub(crate) fn reinitialize_locked<A: Arch>(
        &self,
        state: &mut TlbState,
        op: Reinit,
        config: &Config,
        ctx: &CpuContext<A>,
    ) {
        debug_assert_eq!(ctx.tlb(), self.index, "reinitializing a remote TLB");
        ctx.check_asid();
        self.counters.asid_reinits.increment(1);

        let arch = ctx.arch();
        let max = self.asid_max;
        let space = &mut state.space;
        space.reset();

        match op {
            Reinit::All => {
                arch.invalidate_all();
                self.counters.full_invalidations.increment(1);
            }
            Reinit::AllUser => {
                arch.invalidate_asids(Asid::FIRST_USER..=max);
                self.counters.full_invalidations.increment(1);
            }
            // We can't see what other CPUs have resident, the only safe option is starting over.
            Reinit::Reclaim if config.multiprocessor && !config.need_shootdown => {
                arch.invalidate_all();
                self.counters.full_invalidations.increment(1);
            }
            Reinit::Reclaim => {
                let found = arch.record_asids(&mut space.bitmap);
                ctx.check_asid();
                assert_eq!(
                    found,
                    space.bitmap.count_user(),
                    "{}: inconsistent count of resident ASIDs",
                    self.name
                );

                if found >= usize::from(max) / 2 {
                    // Not worth it, too few would be recycled. Drop all user ASIDs instead.
                    arch.invalidate_asids(Asid::FIRST_USER..=max);
                    space.reset();
                    self.counters.full_invalidations.increment(1);
                } else {
                    space.free -= found;
                }
            }
        }

        let cpus = self.cpus();
        let mut reset = 0_usize;
        state.pais.retain(|_, pai| {
            let asid = pai.asid.get();
            if pai.pmap.onproc().intersects(cpus) {
                // running pmaps keep their ASID no matter what
                space.mark_used(asid);
                true
            } else if space.is_used(asid) {
                assert_eq!(
                    op,
                    Reinit::Reclaim,
                    "ASID {asid} survived a full invalidation"
                );
                true
            } else {
                self.forget(space, pai, config, arch);
                reset += 1;
                false
            }
        });

        space.check();
        log::debug!(
            "{}: reinitialized ASID space ({op:?}), {} ASIDs free, {reset} associations reset",
            self.name,
            space.free,
        );
    }
}
