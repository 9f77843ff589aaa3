// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

use crate::{CpuId, MAX_TLBS};

/// Errors reported while describing the TLB topology at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// All [`MAX_TLBS`] TLB records are in use.
    TooManyTlbs,
    /// The hardware reported an ASID space without any user ASIDs.
    InvalidAsidMax(u16),
    /// No TLB with the given index was registered.
    NoSuchTlb(usize),
    /// The CPU is already attached to a TLB.
    CpuAlreadyAttached(CpuId),
    /// The CPU's hardware can't hold all the ASIDs the TLB record hands out.
    AsidMaxMismatch { tlb: usize, cpu: CpuId, hw: u16 },
    /// Attaching another CPU would leave the TLB with fewer user ASIDs than CPUs.
    TooManyCpus { tlb: usize, asid_max: u16 },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooManyTlbs => write!(f, "cannot manage more than {MAX_TLBS} TLBs"),
            Error::InvalidAsidMax(max) => {
                write!(f, "ASID space 0..={max} leaves no ASIDs for user pmaps")
            }
            Error::NoSuchTlb(index) => write!(f, "no TLB with index {index}"),
            Error::CpuAlreadyAttached(cpu) => {
                write!(f, "CPU {cpu} is already attached to a TLB")
            }
            Error::AsidMaxMismatch { tlb, cpu, hw } => {
                write!(f, "CPU {cpu} supports ASIDs up to {hw} only, less than tlb{tlb} uses")
            }
            Error::TooManyCpus { tlb, asid_max } => {
                write!(f, "tlb{tlb} can't serve more than {asid_max} CPUs")
            }
        }
    }
}

impl core::error::Error for Error {}
