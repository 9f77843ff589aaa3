// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::num::NonZeroU16;

/// The tag the hardware uses to tell apart TLB entries of different address spaces.
///
/// # Notes
///
/// - ASID `0` is reserved for the kernel. Kernel mappings are global and the kernel ASID is never
///   handed out to a user address space nor reclaimed.
/// - ASIDs are only unique *per TLB*. The same address space will usually hold different ASIDs
///   on different TLBs and the same numeric ASID may belong to unrelated address spaces on two
///   TLBs.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Asid(Option<NonZeroU16>);

impl Asid {
    /// The ASID shared by the kernel and everything running on the kernel pmap.
    pub const KERNEL: Self = Self(None);

    /// The smallest ASID that may be assigned to a user address space.
    pub const FIRST_USER: u16 = 1;

    pub const fn new(id: NonZeroU16) -> Self {
        Self(Some(id))
    }

    /// Constructs an ASID from the raw hardware value, `0` being the kernel ASID.
    pub const fn from_raw(raw: u16) -> Self {
        Self(NonZeroU16::new(raw))
    }

    /// Returns the raw hardware value of this ASID.
    pub const fn get(self) -> u16 {
        match self.0 {
            Some(id) => id.get(),
            None => 0,
        }
    }

    pub const fn is_kernel(self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("<kernel>"),
            Some(asid) => write!(f, "<{asid}>"),
        }
    }
}
