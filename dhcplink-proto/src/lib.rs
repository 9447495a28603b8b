#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::uninlined_format_args)]

//! The transport-agnostic half of a DHCPv4 client: the BOOTP/DHCP wire codec
//! and the probe state machine, both operating purely on Rust slices and on
//! caller-provided instants. Socket handling, timers and event delivery live
//! in the `dhcplink` crate.

#[cfg(test)]
extern crate std;

pub mod bytes;
pub mod ident;
pub mod options;
pub mod packet;
pub mod probe;

/// UDP port DHCP servers listen on.
pub const SERVER_PORT: u16 = 67;
/// UDP port DHCP clients listen on.
pub const CLIENT_PORT: u16 = 68;

/// An error type for decoding and encoding DHCP messages
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    DataUnderflow,
    BufferOverflow,
    MissingCookie,
    MissingEnd,
    OptionOverrun,
    InvalidHlen,
    InvalidOverload,
}

impl From<bytes::Error> for Error {
    fn from(value: bytes::Error) -> Self {
        match value {
            bytes::Error::BufferOverflow => Self::BufferOverflow,
            bytes::Error::DataUnderflow => Self::DataUnderflow,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let str = match self {
            Self::DataUnderflow => "Data underflow",
            Self::BufferOverflow => "Buffer overflow",
            Self::MissingCookie => "Missing or invalid magic cookie",
            Self::MissingEnd => "Option stream not terminated",
            Self::OptionOverrun => "Option length overruns the buffer",
            Self::InvalidHlen => "Invalid hardware address length",
            Self::InvalidOverload => "Invalid overload option value",
        };

        write!(f, "{}", str)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
