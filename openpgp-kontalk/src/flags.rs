//! Message security flags.
//!
//! The low bits record which protection a message declares, the bits
//! starting at 16 record which validation failed.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A security flags bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SecurityFlags(i32);

impl SecurityFlags {
    /// Neither encrypted nor signed.
    pub const CLEARTEXT: SecurityFlags = SecurityFlags(0);
    /// Legacy encryption method, for compatibility with old messages.
    pub const LEGACY_ENCRYPTED: SecurityFlags = SecurityFlags(1);
    /// Basic (OpenPGP) encryption.
    pub const BASIC_ENCRYPTED: SecurityFlags = SecurityFlags(1 << 1);
    /// Basic (OpenPGP) signature.
    pub const BASIC_SIGNED: SecurityFlags = SecurityFlags(1 << 2);
    /// Advanced encryption.
    pub const ADVANCED_ENCRYPTED: SecurityFlags = SecurityFlags(1 << 3);
    /// Advanced signature.
    pub const ADVANCED_SIGNED: SecurityFlags = SecurityFlags(1 << 4);

    /// Digital signature verification failed.
    pub const INVALID_SIGNATURE: SecurityFlags = SecurityFlags(1 << 16);
    /// Invalid sender.
    pub const INVALID_SENDER: SecurityFlags = SecurityFlags(1 << 17);
    /// Invalid recipient.
    pub const INVALID_RECIPIENT: SecurityFlags = SecurityFlags(1 << 18);
    /// Invalid timestamp.
    pub const INVALID_TIMESTAMP: SecurityFlags = SecurityFlags(1 << 19);
    /// Invalid packet data or message parsing failed.
    pub const INVALID_DATA: SecurityFlags = SecurityFlags(1 << 20);
    /// Decryption failed.
    pub const DECRYPT_FAILED: SecurityFlags = SecurityFlags(1 << 21);
    /// Data integrity check failed.
    pub const INTEGRITY_CHECK: SecurityFlags = SecurityFlags(1 << 22);
    /// The peer's public key is not available.
    pub const PUBLIC_KEY_UNAVAILABLE: SecurityFlags = SecurityFlags(1 << 23);

    /// Basic encryption and signature.
    pub const BASIC: SecurityFlags =
        SecurityFlags(Self::BASIC_ENCRYPTED.0 | Self::BASIC_SIGNED.0);
    /// Advanced encryption and signature.
    pub const ADVANCED: SecurityFlags =
        SecurityFlags(Self::ADVANCED_ENCRYPTED.0 | Self::ADVANCED_SIGNED.0);

    const ERROR_MASK: i32 = 0xff << 16;

    /// Wraps a raw bitmask.
    pub const fn from_bits(bits: i32) -> Self {
        SecurityFlags(bits)
    }

    /// Returns the raw bitmask.
    pub const fn bits(self) -> i32 {
        self.0
    }

    /// Returns whether all bits of `other` are set.
    pub fn contains(self, other: SecurityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether any error bit is set.
    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    /// Returns the flags without the error bits.
    pub fn features(self) -> SecurityFlags {
        SecurityFlags(self.0 & !Self::ERROR_MASK)
    }

    /// Returns the security level both sides can handle.
    ///
    /// This is the minimum of `requested` and every non-negative
    /// entry of `supported`.  Negative entries mean "unknown" and are
    /// skipped.  If there is no usable entry, `requested` is returned.
    pub fn compatible(requested: i32, supported: &[i32]) -> i32 {
        supported.iter()
            .filter(|s| **s >= 0)
            .fold(requested, |acc, s| acc.min(*s))
    }
}

impl BitOr for SecurityFlags {
    type Output = SecurityFlags;

    fn bitor(self, rhs: SecurityFlags) -> SecurityFlags {
        SecurityFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SecurityFlags {
    fn bitor_assign(&mut self, rhs: SecurityFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SecurityFlags {
    type Output = SecurityFlags;

    fn bitand(self, rhs: SecurityFlags) -> SecurityFlags {
        SecurityFlags(self.0 & rhs.0)
    }
}

impl From<SecurityFlags> for i32 {
    fn from(f: SecurityFlags) -> i32 {
        f.0
    }
}

impl fmt::Debug for SecurityFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SecurityFlags({:#x})", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn basic() {
        assert_eq!(SecurityFlags::BASIC.bits(), 6);
        assert!(! SecurityFlags::BASIC.is_error());
        assert!((SecurityFlags::BASIC | SecurityFlags::INVALID_SENDER)
                .is_error());
        assert!(SecurityFlags::PUBLIC_KEY_UNAVAILABLE.is_error());
        assert_eq!((SecurityFlags::BASIC | SecurityFlags::INTEGRITY_CHECK)
                   .features(), SecurityFlags::BASIC);
    }

    #[test]
    fn compatible() {
        let basic = SecurityFlags::BASIC.bits();
        let advanced = SecurityFlags::ADVANCED.bits();

        assert_eq!(SecurityFlags::compatible(basic, &[basic, advanced]),
                   basic);
        assert_eq!(SecurityFlags::compatible(advanced, &[advanced, basic]),
                   basic);
        assert_eq!(SecurityFlags::compatible(basic, &[-1, -1]), basic);
        assert_eq!(SecurityFlags::compatible(basic, &[]), basic);
        assert_eq!(SecurityFlags::compatible(advanced, &[-1, 0]), 0);
    }

    #[quickcheck]
    fn compatible_never_exceeds_requested(requested: i32, supported: Vec<i32>)
        -> bool
    {
        SecurityFlags::compatible(requested, &supported) <= requested
    }

    #[quickcheck]
    fn error_bits_disjoint(bits: i32) -> bool {
        let f = SecurityFlags::from_bits(bits);
        ! f.features().is_error()
    }
}
