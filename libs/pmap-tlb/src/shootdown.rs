// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-TLB shootdown.
//!
//! A CPU that changed the mappings of a pmap invalidates its own TLB right away but can't touch the
//! TLBs of other CPUs. For every other TLB the pmap is active on there are two options:
//!
//! - if no CPU of that TLB is running the pmap we simply forget the pmap's ASID there. The next
//!   time the pmap gets activated on that TLB it is assigned a fresh ASID, which can't hit stale
//!   entries.
//! - otherwise we fold the request into the TLB's pending [`TlbInvOp`] and interrupt *one* CPU of
//!   that TLB, which then does the invalidation on behalf of all CPUs sharing it.

use lock_api::RawMutex;

use crate::arch::Arch;
use crate::tlb_info::Reinit;
use crate::{CpuContext, Pmap, PmapTlb};

/// The invalidation a TLB still owes to pending shootdown requests.
///
/// Multiple requests that arrive before the target CPU gets around to processing them are merged,
/// escalating to broader invalidations as needed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TlbInvOp {
    /// Nothing to do.
    #[default]
    Nobody,
    /// Invalidate the ASID of a single victim pmap.
    One,
    /// Invalidate all user ASIDs.
    AllUser,
    /// Invalidate all global (kernel) entries.
    AllKernel,
    /// Invalidate everything.
    All,
}

impl TlbInvOp {
    /// The pending operation after another user pmap requested a shootdown.
    #[must_use]
    pub const fn user_map(self) -> Self {
        match self {
            TlbInvOp::Nobody => TlbInvOp::One,
            TlbInvOp::One | TlbInvOp::AllUser => TlbInvOp::AllUser,
            TlbInvOp::AllKernel | TlbInvOp::All => TlbInvOp::All,
        }
    }

    /// The pending operation after the kernel pmap requested a shootdown.
    #[must_use]
    pub const fn kernel_map(self) -> Self {
        match self {
            TlbInvOp::Nobody | TlbInvOp::AllKernel => TlbInvOp::AllKernel,
            TlbInvOp::One | TlbInvOp::AllUser | TlbInvOp::All => TlbInvOp::All,
        }
    }
}

impl<R: RawMutex> PmapTlb<R> {
    /// Makes sure no TLB other than the caller's still caches stale translations of `pmap`.
    ///
    /// Returns `true` if any shootdown IPI was sent. The caller is expected to have invalidated its
    /// own TLB already.
    ///
    /// # Panics
    ///
    /// Panics if `pmap` runs on a CPU of another TLB without holding an ASID there.
    pub fn shootdown_bystanders<A: Arch>(&self, pmap: &Pmap, ctx: &CpuContext<A>) -> bool {
        let kernel = pmap.is_kernel();
        let local = self.local_tlb(ctx).cpus();

        // kernel mappings are global, they are cached on every CPU
        let mut pending = if kernel {
            self.attached_cpus()
        } else {
            pmap.active()
        }
        .difference(local);

        let mut ipi_sent = false;
        for ti in self.tlbs() {
            if pending.is_empty() {
                break;
            }

            let cpus = ti.cpus();
            if !pending.intersects(cpus) {
                continue;
            }
            pending = pending.difference(cpus);

            let mut state = ti.lock();

            let target = if kernel {
                cpus.first()
            } else {
                pmap.onproc().intersection(cpus).first()
            };

            if let Some(target) = target {
                if kernel {
                    state.invop = state.invop.kernel_map();
                    state.victim = None;
                } else {
                    assert!(
                        state.pais.contains_key(&pmap.id()),
                        "{}: pmap {:?} running on {target} without an ASID",
                        ti.name(),
                        pmap.id()
                    );

                    if state.victim == Some(pmap.id()) {
                        // the victim's ASID is already queued for invalidation
                        debug_assert_eq!(state.invop, TlbInvOp::One);
                    } else {
                        state.invop = state.invop.user_map();
                        state.victim = (state.invop == TlbInvOp::One).then_some(pmap.id());
                    }
                }
                drop(state);

                // pmap.onproc may have changed since we dropped the lock, the target tolerates
                // spurious shootdowns.
                log::trace!("{}: sending shootdown IPI to {target}", ti.name());
                ctx.arch().send_shootdown_ipi(target);
                ti.counters().shootdown_ipis.increment(1);
                ipi_sent = true;
                continue;
            }

            if !kernel && pmap.active().intersects(cpus) {
                log::trace!(
                    "{}: lazily dropping ASID of idle pmap {:?}",
                    ti.name(),
                    pmap.id()
                );
                ti.pai_reset(&mut state, pmap.id(), &self.config, ctx.arch());
                ti.counters().lazy_shots.increment(1);
            }
        }

        ipi_sent
    }

    /// Performs the invalidation queued for the caller's TLB. This is the shootdown IPI handler.
    pub fn shootdown_process<A: Arch>(&self, ctx: &CpuContext<A>) {
        let ti = self.local_tlb(ctx);
        let mut state = ti.lock();

        log::trace!("{}: processing shootdown {:?}", ti.name(), state.invop);
        match state.invop {
            TlbInvOp::One => {
                let victim = state.victim.and_then(|id| {
                    let pai = state.pais.get(&id)?;
                    Some((id, pai.asid, pai.pmap.onproc().intersects(ti.cpus())))
                });

                match victim {
                    Some((_, asid, true)) => {
                        // still running here, so only its entries can go
                        let asid = asid.get();
                        ctx.check_asid();
                        ctx.arch().invalidate_asids(asid..=asid);
                        ctx.check_asid();
                    }
                    Some((id, _, false)) => {
                        // not running on this TLB anymore, it will get a new ASID next time
                        ti.pai_reset(&mut state, id, &self.config, ctx.arch());
                    }
                    // released in the meantime
                    None => {}
                }
            }
            TlbInvOp::AllUser => {
                ti.reinitialize_locked(&mut state, Reinit::AllUser, &self.config, ctx);
            }
            TlbInvOp::AllKernel => {
                ctx.check_asid();
                ctx.arch().invalidate_globals();
                ctx.check_asid();
            }
            TlbInvOp::All => {
                ti.reinitialize_locked(&mut state, Reinit::All, &self.config, ctx);
            }
            // spurious, or another CPU sharing this TLB already did the work
            TlbInvOp::Nobody => {}
        }

        state.victim = None;
        state.invop = TlbInvOp::Nobody;
        ti.counters().shootdowns.increment(1);
    }
}
