use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Per-fetch option bits.
///
/// Two fetches for the same (name, type) coalesce onto one fetch context
/// only when their option bits are identical, so the set is part of the
/// coalescing key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FetchOptions(u32);

impl FetchOptions {
    /// Set RD on outbound queries.
    pub const RECURSIVE: FetchOptions = FetchOptions(0x0001);
    /// Force TCP for the first query.
    pub const TCP: FetchOptions = FetchOptions(0x0002);
    /// Never advertise EDNS0.
    pub const NOEDNS0: FetchOptions = FetchOptions(0x0004);
    /// Do not join an existing fetch context.
    pub const UNSHARED: FetchOptions = FetchOptions(0x0008);
    /// Bypass the validator hook.
    pub const NOVALIDATE: FetchOptions = FetchOptions(0x0010);

    pub const fn empty() -> Self {
        FetchOptions(0)
    }

    pub fn contains(self, other: FetchOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FetchOptions) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FetchOptions) {
        self.0 &= !other.0;
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for FetchOptions {
    type Output = FetchOptions;

    fn bitor(self, rhs: FetchOptions) -> FetchOptions {
        FetchOptions(self.0 | rhs.0)
    }
}

impl BitOrAssign for FetchOptions {
    fn bitor_assign(&mut self, rhs: FetchOptions) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::RECURSIVE) {
            names.push("RECURSIVE");
        }
        if self.contains(Self::TCP) {
            names.push("TCP");
        }
        if self.contains(Self::NOEDNS0) {
            names.push("NOEDNS0");
        }
        if self.contains(Self::UNSHARED) {
            names.push("UNSHARED");
        }
        if self.contains(Self::NOVALIDATE) {
            names.push("NOVALIDATE");
        }
        write!(f, "FetchOptions({})", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_insert() {
        let mut opts = FetchOptions::empty();
        assert!(!opts.contains(FetchOptions::TCP));

        opts.insert(FetchOptions::TCP);
        opts |= FetchOptions::NOEDNS0;
        assert!(opts.contains(FetchOptions::TCP));
        assert!(opts.contains(FetchOptions::TCP | FetchOptions::NOEDNS0));
        assert!(!opts.contains(FetchOptions::UNSHARED));
    }

    #[test]
    fn test_options_are_part_of_identity() {
        let a = FetchOptions::RECURSIVE;
        let b = FetchOptions::RECURSIVE | FetchOptions::TCP;
        assert_ne!(a, b);

        let mut b2 = b;
        b2.remove(FetchOptions::TCP);
        assert_eq!(a, b2);
    }
}
