//! Addresses and flags for symbols served by the JIT.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// An address in the executor's address space.
///
/// Stored and served opaquely; nothing in the engine dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ExecutorAddr(u64);

impl ExecutorAddr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for ExecutorAddr {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<usize> for ExecutorAddr {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl From<ExecutorAddr> for u64 {
    fn from(addr: ExecutorAddr) -> u64 {
        addr.0
    }
}

impl fmt::Display for ExecutorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for ExecutorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Generic symbol flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct JitSymbolFlags(u8);

impl JitSymbolFlags {
    pub const NONE: Self = Self(0);
    /// Visible to lookups that only match exported symbols.
    pub const EXPORTED: Self = Self(1 << 0);
    pub const WEAK: Self = Self(1 << 1);
    pub const CALLABLE: Self = Self(1 << 2);
    /// The address does not move with any allocation.
    pub const ABSOLUTE: Self = Self(1 << 3);

    const NAMES: [(JitSymbolFlags, &'static str); 4] = [
        (Self::EXPORTED, "Exported"),
        (Self::WEAK, "Weak"),
        (Self::CALLABLE, "Callable"),
        (Self::ABSOLUTE, "Absolute"),
    ];

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_exported(self) -> bool {
        self.contains(Self::EXPORTED)
    }

    pub const fn is_weak(self) -> bool {
        self.contains(Self::WEAK)
    }

    pub const fn is_callable(self) -> bool {
        self.contains(Self::CALLABLE)
    }

    pub const fn is_absolute(self) -> bool {
        self.contains(Self::ABSOLUTE)
    }
}

impl BitOr for JitSymbolFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for JitSymbolFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Display for JitSymbolFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("None")?;
        }
        Ok(())
    }
}

impl fmt::Debug for JitSymbolFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JitSymbolFlags({self})")
    }
}

/// A symbol that has been evaluated to an address already.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvaluatedSymbol {
    address: ExecutorAddr,
    flags: JitSymbolFlags,
}

impl EvaluatedSymbol {
    pub const fn new(address: ExecutorAddr, flags: JitSymbolFlags) -> Self {
        Self { address, flags }
    }

    #[inline]
    pub const fn address(&self) -> ExecutorAddr {
        self.address
    }

    #[inline]
    pub const fn flags(&self) -> JitSymbolFlags {
        self.flags
    }
}
