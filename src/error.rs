//! The DTU error taxonomy.
//!
//! These codes travel in the error field of the COMMAND register and in the
//! `result` slot of NoC packets. Everything that is not representable here
//! (unknown opcodes, out-of-range endpoint or slot indices, a missing
//! header) indicates a bug in privileged software or in the model and halts
//! the simulation with a panic instead.

use thiserror::Error as ThisError;

/// Completion code of a command or an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ThisError)]
#[repr(u8)]
pub enum Error {
    /// Success.
    #[default]
    #[error("no error")]
    None = 0,
    /// Send refused, the endpoint has too few credits.
    #[error("not enough credits")]
    MissCredits = 1,
    /// The receive endpoint's ring buffer is full.
    #[error("no space in receive ring")]
    NoRingSpace = 2,
    /// The target PE runs a different VPE than the packet was meant for.
    #[error("target VPE gone")]
    VpeGone = 3,
    /// The page-fault handler reported the address as permanently unmapped.
    #[error("no mapping")]
    NoMapping = 4,
    /// A MEMORY endpoint was used without the required access right.
    #[error("missing access rights")]
    NoPerm = 5,
}

impl Error {
    pub fn from_u64(val: u64) -> Self {
        match val {
            0 => Error::None,
            1 => Error::MissCredits,
            2 => Error::NoRingSpace,
            3 => Error::VpeGone,
            4 => Error::NoMapping,
            5 => Error::NoPerm,
            _ => panic!("invalid error code {}", val),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Error::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in 0..=5u64 {
            assert_eq!(Error::from_u64(code) as u64, code);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::MissCredits.to_string(), "not enough credits");
        assert!(Error::None.is_ok());
        assert!(!Error::VpeGone.is_ok());
    }

    #[test]
    #[should_panic]
    fn test_error_code_invalid() {
        let _ = Error::from_u64(6);
    }
}
