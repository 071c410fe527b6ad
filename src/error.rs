use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `elf_relax` library.
/// These errors represent the failure conditions that can occur while
/// selecting stub variants, growing stub tables and patching erratum sites.
#[derive(Debug)]
pub enum Error {
    /// An immediate does not fit its instruction field.
    ///
    /// This is raised when a relocation or stub-internal value overflows the
    /// most permissive encoding available, e.g.:
    /// * A branch offset outside the 26-bit immediate even through a stub
    /// * An ADR/ADRP immediate outside its signed range
    ///
    /// Overflow always aborts the link; it is never downgraded to a warning.
    Overflow {
        /// A descriptive message naming the offending site.
        msg: Cow<'static, str>,
    },

    /// An internal consistency failure between scanner and patcher.
    ///
    /// Raised when an instruction found at patch time does not have the shape
    /// the scanner recorded, e.g. an erratum site whose captured trigger is
    /// not a load/store of the expected class.
    Malformed {
        /// A descriptive message about the inconsistency.
        msg: Cow<'static, str>,
    },

    /// An invalid configuration, reported at setup before any scanning.
    ///
    /// This covers erratum fixing requested for a non-AArch64 machine and
    /// stub-group budgets that cannot hold a single stub.
    Config {
        /// A descriptive message about the configuration error.
        msg: Cow<'static, str>,
    },

    /// A misuse of the relaxation driver's state machine.
    ///
    /// This typically indicates operations issued out of order such as:
    /// * Writing stub tables before relaxation has converged
    /// * Mutating inputs after relaxation has started
    /// * Exceeding the defensive relaxation pass cap
    Relaxation {
        /// A descriptive message about the driver error.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Overflow { msg } => write!(f, "Immediate overflow: {msg}"),
            Error::Malformed { msg } => write!(f, "Malformed instruction: {msg}"),
            Error::Config { msg } => write!(f, "Configuration error: {msg}"),
            Error::Relaxation { msg } => write!(f, "Relaxation error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

/// Creates an overflow error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn overflow_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Overflow { msg: msg.into() }
}

/// Creates a malformed-instruction error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn malformed_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Malformed { msg: msg.into() }
}

/// Creates a configuration error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn config_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Config { msg: msg.into() }
}

/// Creates a relaxation driver error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn relax_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Relaxation { msg: msg.into() }
}
