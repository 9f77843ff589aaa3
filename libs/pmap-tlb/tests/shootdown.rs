// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeSet;
use std::sync::Arc;

use pmap_tlb::test_utils::{BootstrapResult, MachineBuilder, TlbOp};
use pmap_tlb::{Asid, Config, CpuId, CpuSet, Pmap, TlbInvOp, VirtualAddress};

type RawMutex = parking_lot::RawMutex;

const PAGE: VirtualAddress = VirtualAddress::new(0x7000);

/// cpu0 on tlb0, cpu1 and cpu2 share tlb1, cpu3 on tlb2
fn bootstrap() -> BootstrapResult<RawMutex> {
    MachineBuilder::new(255)
        .with_tlbs([1, 2, 1])
        .finish_and_bootstrap(Config::new())
}

fn cpu_set(cpus: &[usize]) -> CpuSet {
    cpus.iter().map(|cpu| CpuId::new(*cpu)).collect()
}

#[test_log::test]
fn idle_bystanders_are_dropped_lazily() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        mut cpus,
    } = bootstrap();
    let pmap = Arc::new(Pmap::new());

    for cpu in [0, 1, 3] {
        pmap_tlb.acquire(&pmap, &mut cpus[cpu]);
    }
    pmap_tlb.deactivate(&pmap, &mut cpus[1]);
    pmap_tlb.deactivate(&pmap, &mut cpus[3]);
    assert_eq!(pmap.active(), cpu_set(&[0, 1, 2, 3]));

    assert!(!pmap_tlb.shootdown_bystanders(&pmap, &cpus[0]));

    assert!(pmap_tlb.tlb(0).unwrap().asid_of(&pmap).is_some());
    for tlb in [1, 2] {
        let tlb = pmap_tlb.tlb(tlb).unwrap();
        assert_eq!(tlb.asid_of(&pmap), None);
        assert_eq!(tlb.counters().lazy_shots.get(), 1);
        assert_eq!(tlb.counters().shootdown_ipis.get(), 0);
    }
    assert_eq!(pmap.active(), cpu_set(&[0]));
    for cpu in 0..4 {
        assert_eq!(machine.pending_ipis(CpuId::new(cpu)), 0);
    }
}

#[test_log::test]
fn local_only_pmap_needs_no_shootdown() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        mut cpus,
    } = bootstrap();
    let pmap = Arc::new(Pmap::new());

    pmap_tlb.acquire(&pmap, &mut cpus[1]);
    pmap_tlb.acquire(&pmap, &mut cpus[2]);

    assert!(!pmap_tlb.shootdown_bystanders(&pmap, &cpus[1]));
    assert_eq!(machine.pending_ipis(CpuId::new(2)), 0);
    assert!(pmap_tlb.tlb(1).unwrap().asid_of(&pmap).is_some());
}

#[test_log::test]
fn running_bystander_is_interrupted() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        mut cpus,
    } = bootstrap();
    let pmap = Arc::new(Pmap::new());
    let other = Arc::new(Pmap::new());

    pmap_tlb.acquire(&pmap, &mut cpus[0]);
    pmap_tlb.acquire(&pmap, &mut cpus[2]);
    pmap_tlb.acquire(&other, &mut cpus[1]);
    machine.fill(CpuId::new(2), PAGE, 0x1);
    machine.fill(CpuId::new(1), PAGE, 0x2);

    let tlb1 = pmap_tlb.tlb(1).unwrap();
    let asid = tlb1.asid_of(&pmap).unwrap().get();
    let other_asid = tlb1.asid_of(&other).unwrap().get();

    assert!(pmap_tlb.shootdown_bystanders(&pmap, &cpus[0]));

    // only the CPU actually running the pmap gets interrupted
    assert_eq!(machine.pending_ipis(CpuId::new(1)), 0);
    assert_eq!(machine.pending_ipis(CpuId::new(2)), 1);
    assert_eq!(tlb1.snapshot().pending, TlbInvOp::One);
    assert_eq!(tlb1.counters().shootdown_ipis.get(), 1);

    assert!(machine.take_ipis(CpuId::new(2)));
    pmap_tlb.shootdown_process(&cpus[2]);

    assert_eq!(machine.take_log(1), [TlbOp::InvalidateAsids(asid..=asid)]);
    assert_eq!(machine.resident_asids(1), BTreeSet::from([other_asid]));
    assert_eq!(tlb1.asid_of(&pmap), Some(Asid::from_raw(asid)));
    assert_eq!(tlb1.snapshot().pending, TlbInvOp::Nobody);
    assert_eq!(tlb1.counters().shootdowns.get(), 1);
}

#[test_log::test]
fn repeated_requests_for_the_victim_do_not_escalate() {
    let BootstrapResult {
        pmap_tlb, mut cpus, ..
    } = bootstrap();
    let pmap = Arc::new(Pmap::new());

    pmap_tlb.acquire(&pmap, &mut cpus[2]);

    assert!(pmap_tlb.shootdown_bystanders(&pmap, &cpus[0]));
    assert!(pmap_tlb.shootdown_bystanders(&pmap, &cpus[0]));
    assert_eq!(pmap_tlb.tlb(1).unwrap().snapshot().pending, TlbInvOp::One);
}

#[test_log::test]
fn second_victim_escalates_to_all_user() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        mut cpus,
    } = bootstrap();
    let first = Arc::new(Pmap::new());
    let second = Arc::new(Pmap::new());

    pmap_tlb.acquire(&first, &mut cpus[2]);
    pmap_tlb.acquire(&second, &mut cpus[1]);
    machine.fill(CpuId::new(2), PAGE, 0x1);
    machine.fill(CpuId::new(1), PAGE, 0x2);

    assert!(pmap_tlb.shootdown_bystanders(&first, &cpus[0]));
    assert!(pmap_tlb.shootdown_bystanders(&second, &cpus[0]));

    let tlb1 = pmap_tlb.tlb(1).unwrap();
    assert_eq!(tlb1.snapshot().pending, TlbInvOp::AllUser);
    assert_eq!(machine.pending_ipis(CpuId::new(1)), 1);
    assert_eq!(machine.pending_ipis(CpuId::new(2)), 1);

    let first_asid = tlb1.asid_of(&first);
    let second_asid = tlb1.asid_of(&second);

    assert!(machine.take_ipis(CpuId::new(1)));
    pmap_tlb.shootdown_process(&cpus[1]);

    assert_eq!(machine.take_log(1), [TlbOp::InvalidateAsids(1..=255)]);
    assert!(machine.resident_asids(1).is_empty());
    assert_eq!(tlb1.counters().asid_reinits.get(), 1);
    // both are still running, so both keep their ASIDs
    assert_eq!(tlb1.asid_of(&first), first_asid);
    assert_eq!(tlb1.asid_of(&second), second_asid);

    // the sibling finds nothing left to do
    assert!(machine.take_ipis(CpuId::new(2)));
    pmap_tlb.shootdown_process(&cpus[2]);
    assert!(machine.take_log(1).is_empty());
    assert_eq!(tlb1.counters().shootdowns.get(), 2);
}

#[test_log::test]
fn kernel_shootdown_hits_every_other_tlb() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        cpus,
    } = bootstrap();
    let kernel = Pmap::kernel();

    for tlb in 0..3 {
        machine.insert(tlb, Asid::KERNEL, PAGE, 0x1);
    }
    machine.insert(1, Asid::from_raw(5), PAGE, 0x2);

    assert!(pmap_tlb.shootdown_bystanders(&kernel, &cpus[0]));

    assert_eq!(machine.pending_ipis(CpuId::new(0)), 0);
    assert_eq!(machine.pending_ipis(CpuId::new(1)), 1);
    assert_eq!(machine.pending_ipis(CpuId::new(2)), 0);
    assert_eq!(machine.pending_ipis(CpuId::new(3)), 1);
    assert_eq!(
        pmap_tlb.tlb(1).unwrap().snapshot().pending,
        TlbInvOp::AllKernel
    );

    for cpu in [1, 3] {
        assert!(machine.take_ipis(CpuId::new(cpu)));
        pmap_tlb.shootdown_process(&cpus[cpu]);
    }

    assert_eq!(machine.take_log(1), [TlbOp::InvalidateGlobals]);
    assert_eq!(machine.take_log(2), [TlbOp::InvalidateGlobals]);
    assert_eq!(machine.entries(0), [(Asid::KERNEL, PAGE, 0x1)]);
    assert_eq!(machine.entries(1), [(Asid::from_raw(5), PAGE, 0x2)]);
    assert!(machine.entries(2).is_empty());
}

#[test_log::test]
fn kernel_after_user_invalidates_everything() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        mut cpus,
    } = bootstrap();
    let pmap = Arc::new(Pmap::new());

    pmap_tlb.acquire(&pmap, &mut cpus[2]);
    assert!(pmap_tlb.shootdown_bystanders(&pmap, &cpus[0]));
    assert!(pmap_tlb.shootdown_bystanders(&Pmap::kernel(), &cpus[0]));

    let tlb1 = pmap_tlb.tlb(1).unwrap();
    assert_eq!(tlb1.snapshot().pending, TlbInvOp::All);

    pmap_tlb.shootdown_process(&cpus[1]);
    assert_eq!(machine.take_log(1), [TlbOp::InvalidateAll]);
    assert!(tlb1.asid_of(&pmap).is_some());
}

#[test_log::test]
fn victim_that_stopped_running_is_reset() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        mut cpus,
    } = bootstrap();
    let pmap = Arc::new(Pmap::new());

    pmap_tlb.acquire(&pmap, &mut cpus[0]);
    pmap_tlb.acquire(&pmap, &mut cpus[2]);
    assert!(pmap_tlb.shootdown_bystanders(&pmap, &cpus[0]));
    pmap_tlb.deactivate(&pmap, &mut cpus[2]);

    // a sibling may pick up the work
    pmap_tlb.shootdown_process(&cpus[1]);

    let tlb1 = pmap_tlb.tlb(1).unwrap();
    assert_eq!(tlb1.asid_of(&pmap), None);
    assert_eq!(pmap.active(), cpu_set(&[0]));
    assert!(machine.take_log(1).is_empty());

    pmap_tlb.shootdown_process(&cpus[2]);
    assert!(machine.take_log(1).is_empty());
}

#[test_log::test]
fn victim_released_before_processing() {
    let BootstrapResult {
        machine,
        pmap_tlb,
        mut cpus,
    } = bootstrap();
    let pmap = Arc::new(Pmap::new());

    pmap_tlb.acquire(&pmap, &mut cpus[2]);
    assert!(pmap_tlb.shootdown_bystanders(&pmap, &cpus[0]));
    pmap_tlb.deactivate(&pmap, &mut cpus[2]);
    pmap_tlb.release_all(&pmap, &cpus[0]);

    assert!(machine.take_ipis(CpuId::new(2)));
    pmap_tlb.shootdown_process(&cpus[2]);

    let tlb1 = pmap_tlb.tlb(1).unwrap();
    assert_eq!(tlb1.asid_of(&pmap), None);
    assert_eq!(tlb1.snapshot().pending, TlbInvOp::Nobody);
    assert!(machine.take_log(1).is_empty());
    assert!(pmap.active().is_empty());
}
