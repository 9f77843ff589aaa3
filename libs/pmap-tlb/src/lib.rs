// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(any(test, feature = "test_utils")), no_std)]

//! Address space identifier (ASID) management for multiprocessor TLBs.
//!
//! Every TLB entry is tagged with the ASID of the address space it belongs to, so switching between
//! address spaces doesn't require flushing the TLB. ASIDs are a scarce resource though (often just
//! 8 to 16 bits), so they are handed out lazily: a [`Pmap`] gets an ASID on a TLB the first time it
//! is activated on a CPU using that TLB, and when a TLB runs out of ASIDs its ASID space is
//! reclaimed wholesale.
//!
//! ## TLB topology
//!
//! Each physical TLB is described by a [`TlbInfo`]. CPUs can share a TLB (e.g. SMT siblings), in
//! which case they also share its ASIDs. All state of a TLB is protected by its own lock.
//!
//! ## Per-CPU state
//!
//! There is no implicit "current CPU". Every operation takes the [`CpuContext`] of the CPU it
//! executes on, which carries the ASID that CPU is running with and the [`Arch`] handle to its TLB.

extern crate alloc;

mod address;
mod arch;
mod asid;
mod bitmap;
mod config;
mod cpu;
mod cpu_set;
mod error;
pub mod metrics;
mod pmap;
mod pmap_tlb;
mod shootdown;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod tlb_info;

pub use address::VirtualAddress;
pub use arch::Arch;
pub use asid::Asid;
pub use bitmap::AsidBitmap;
pub use config::{Config, MAX_CPUS, MAX_TLBS};
pub use cpu::CpuContext;
pub use cpu_set::{AtomicCpuSet, CpuId, CpuSet};
pub use error::Error;
pub use pmap::{Pmap, PmapId};
pub use pmap_tlb::{PmapTlb, UpdateFlags};
pub use shootdown::TlbInvOp;
pub use tlb_info::{Reinit, TlbInfo, TlbSnapshot};
