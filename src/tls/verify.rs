//! Decoding of the engine's certificate verification bitmask.
//!
//! Bit values follow the X.509 verification flags of mbedTLS
//! (`MBEDTLS_X509_BADCERT_*` / `MBEDTLS_X509_BADCRL_*`).

use core::fmt;

const FLAG_NAMES: &[(u32, &str)] = &[
    (0x0000_0001, "certificate expired"),
    (0x0000_0002, "certificate revoked"),
    (0x0000_0004, "CN mismatch"),
    (0x0000_0008, "not trusted by any root CA"),
    (0x0000_0010, "CRL not trusted"),
    (0x0000_0020, "CRL expired"),
    (0x0000_0040, "certificate missing"),
    (0x0000_0080, "verification skipped"),
    (0x0000_0100, "other reason"),
    (0x0000_0200, "certificate not yet valid"),
    (0x0000_0400, "CRL not yet valid"),
    (0x0000_0800, "key usage mismatch"),
    (0x0000_1000, "extended key usage mismatch"),
    (0x0000_2000, "NS cert type mismatch"),
    (0x0000_4000, "unacceptable hash"),
    (0x0000_8000, "unacceptable PK algorithm"),
    (0x0001_0000, "unacceptable key"),
    (0x0002_0000, "CRL unacceptable hash"),
    (0x0004_0000, "CRL unacceptable PK algorithm"),
    (0x0008_0000, "CRL unacceptable key"),
];

/// Verification result bitmask.  Zero means the chain verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyFlags(pub u32);

impl VerifyFlags {
    pub const NOT_TRUSTED: u32 = 0x0000_0008;
    pub const EXPIRED: u32 = 0x0000_0001;
    pub const CN_MISMATCH: u32 = 0x0000_0004;

    pub fn is_clean(self) -> bool {
        self.0 == 0
    }

    /// Names of every set bit, in bit order.  Unknown bits are skipped.
    pub fn reasons(self) -> impl Iterator<Item = &'static str> {
        FLAG_NAMES
            .iter()
            .filter(move |(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
    }

    fn unknown_bits(self) -> u32 {
        let known = FLAG_NAMES.iter().fold(0u32, |acc, (bit, _)| acc | bit);
        self.0 & !known
    }
}

impl fmt::Display for VerifyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "ok");
        }
        let mut first = true;
        for reason in self.reasons() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{reason}")?;
            first = false;
        }
        let unknown = self.unknown_bits();
        if unknown != 0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "unknown flags 0x{unknown:x}")?;
        }
        Ok(())
    }
}
