// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeSet;
use std::sync::Arc;

use pmap_tlb::test_utils::{BootstrapResult, MachineBuilder};
use pmap_tlb::{Asid, Config, CpuId, Pmap, Reinit, VirtualAddress};
use proptest::prelude::*;
use proptest_derive::Arbitrary;

type RawMutex = parking_lot::RawMutex;

const NUM_CPUS: usize = 3;
const NUM_PMAPS: usize = 6;

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Switch {
        #[proptest(strategy = "0..NUM_CPUS")]
        cpu: usize,
        #[proptest(strategy = "0..NUM_PMAPS")]
        pmap: usize,
    },
    Idle {
        #[proptest(strategy = "0..NUM_CPUS")]
        cpu: usize,
    },
    Touch {
        #[proptest(strategy = "0..NUM_CPUS")]
        cpu: usize,
        #[proptest(strategy = "0..4usize")]
        page: usize,
    },
    Destroy {
        #[proptest(strategy = "0..NUM_PMAPS")]
        pmap: usize,
    },
    Shootdown {
        #[proptest(strategy = "0..NUM_CPUS")]
        cpu: usize,
        #[proptest(strategy = "0..NUM_PMAPS")]
        pmap: usize,
    },
    Reclaim {
        #[proptest(strategy = "0..NUM_CPUS")]
        cpu: usize,
    },
}

#[derive(Debug, Clone, Arbitrary)]
struct Policy {
    flush_asid_on_reset: bool,
    need_shootdown: bool,
}

struct World {
    boot: BootstrapResult<RawMutex>,
    pmaps: Vec<Arc<Pmap>>,
    running: [Option<usize>; NUM_CPUS],
}

impl World {
    fn new(asid_max: u16, policy: &Policy) -> Self {
        // cpu0 and cpu1 share tlb0, cpu2 has tlb1 to itself
        let boot = MachineBuilder::new(asid_max).with_tlbs([2, 1]).finish_and_bootstrap(
            Config::new()
                .with_flush_asid_on_reset(policy.flush_asid_on_reset)
                .with_shootdown(policy.need_shootdown),
        );

        Self {
            boot,
            pmaps: (0..NUM_PMAPS).map(|_| Arc::new(Pmap::new())).collect(),
            running: [None; NUM_CPUS],
        }
    }

    fn apply(&mut self, op: &Op) {
        let BootstrapResult {
            machine,
            pmap_tlb,
            cpus,
        } = &mut self.boot;

        match *op {
            Op::Switch { cpu, pmap } => {
                if let Some(prev) = self.running[cpu].take() {
                    pmap_tlb.deactivate(&self.pmaps[prev], &mut cpus[cpu]);
                }
                pmap_tlb.acquire(&self.pmaps[pmap], &mut cpus[cpu]);
                self.running[cpu] = Some(pmap);
            }
            Op::Idle { cpu } => {
                if let Some(prev) = self.running[cpu].take() {
                    pmap_tlb.deactivate(&self.pmaps[prev], &mut cpus[cpu]);
                }
            }
            Op::Touch { cpu, page } => {
                machine.fill(CpuId::new(cpu), VirtualAddress::new(page << 12), page as u64);
            }
            Op::Destroy { pmap } => {
                if self.running.contains(&Some(pmap)) {
                    return;
                }
                pmap_tlb.release_all(&self.pmaps[pmap], &cpus[0]);
                for tlb in pmap_tlb.tlbs() {
                    assert_eq!(tlb.asid_of(&self.pmaps[pmap]), None);
                }
                self.pmaps[pmap] = Arc::new(Pmap::new());
            }
            Op::Shootdown { cpu, pmap } => {
                pmap_tlb.shootdown_bystanders(&self.pmaps[pmap], &cpus[cpu]);
                for ctx in cpus.iter() {
                    if machine.take_ipis(ctx.id()) {
                        pmap_tlb.shootdown_process(ctx);
                    }
                }
            }
            Op::Reclaim { cpu } => {
                pmap_tlb.reinitialize(Reinit::Reclaim, &cpus[cpu]);
            }
        }
    }

    fn check(&self) {
        let BootstrapResult {
            machine,
            pmap_tlb,
            cpus,
        } = &self.boot;

        for tlb in pmap_tlb.tlbs() {
            let snapshot = tlb.snapshot();

            let assigned: BTreeSet<_> = snapshot.active.iter().map(|(_, asid)| *asid).collect();
            assert_eq!(
                assigned.len(),
                snapshot.active.len(),
                "{}: ASID assigned twice",
                tlb.name()
            );
            assert!(!assigned.contains(&Asid::KERNEL));

            for asid in &assigned {
                assert!(asid.get() <= snapshot.asid_max);
                assert!(snapshot.in_use.contains(&asid.get()));
            }
            assert_eq!(
                snapshot.asids_free,
                usize::from(snapshot.asid_max) - snapshot.in_use.len()
            );

            for pmap in &self.pmaps {
                assert_eq!(
                    tlb.asid_of(pmap).is_some(),
                    pmap.active().intersects(tlb.cpus()),
                    "{}: active set of {:?} out of sync",
                    tlb.name(),
                    pmap.id()
                );
            }
        }

        for (ctx, running) in cpus.iter().zip(self.running) {
            let hw = machine.current_asid(ctx.id());
            assert_eq!(hw, ctx.asid_cur());

            let expected = match running {
                Some(pmap) => pmap_tlb
                    .tlb(ctx.tlb())
                    .unwrap()
                    .asid_of(&self.pmaps[pmap])
                    .expect("running pmap without an ASID"),
                None => Asid::KERNEL,
            };
            assert_eq!(hw, expected);
        }
    }
}

proptest! {
    #[test]
    fn random_workload(
        asid_max in 2..8u16,
        policy in any::<Policy>(),
        ops in proptest::collection::vec(any::<Op>(), 1..200),
    ) {
        let mut world = World::new(asid_max, &policy);

        for op in &ops {
            world.apply(op);
            world.check();
        }
    }
}
