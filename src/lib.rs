//! An event-loop-agnostic DHCPv4 client library for Linux hosts.
//!
//! The client acquires, renews and releases IPv4 configuration on one
//! network interface, on behalf of a host that owns the event loop and the
//! interface itself. It exposes a single readable descriptor plus a
//! non-blocking [`Client::dispatch`] entry point, spawns no threads, and
//! emits [`Event`]s instead of touching kernel routes or addresses; the
//! host applies them.
//!
//! Before the interface has an address, frames travel over a `PF_PACKET`
//! socket with a kernel filter admitting only replies to the active
//! probe's transaction; once bound, an ordinary connected UDP socket takes
//! over. The wire format and the probe state machine live in
//! [`dhcplink_proto`], the raw IP/UDP framing in [`dhcplink_raw`]; both
//! are re-exported for hosts that need the lower layers.
//!
//! ```no_run
//! use dhcplink::{Client, ClientConfig, Event, ProbeConfig};
//!
//! # fn main() -> Result<(), dhcplink::Error> {
//! let config = ClientConfig::new(2).with_ethernet([0x02, 0, 0, 0, 0, 0x01]);
//! let mut client = Client::new(config)?;
//!
//! let _probe = client.probe(ProbeConfig::new())?;
//!
//! // Add client.fd() to the host poll set; on readiness:
//! client.dispatch()?;
//!
//! while let Some(event) = client.pop_event() {
//!     match event {
//!         Event::Offer(lease) => client.select(&lease)?,
//!         Event::Granted(lease) => {
//!             // install lease.address() / lease.routers() / lease.dns(),
//!             // then confirm:
//!             client.accept(&lease);
//!         }
//!         _ => (),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub use dhcplink_proto as proto;
pub use dhcplink_raw as raw;

pub mod bpf;

mod client;
mod clock;
mod config;
mod lease;
mod poll;
mod queue;
mod socket;
mod sys;
mod timer;

pub use client::{Client, Probe};
pub use clock::{Clock, MonotonicClock};
pub use config::{ClientConfig, ProbeConfig};
pub use lease::{Lease, Lifetimes};
pub use queue::Event;

pub use dhcplink_proto::ident::TransportKind;

/// Errors surfaced to the host; everything protocol-level (malformed
/// packets, NAKs, transient socket conditions) is absorbed into state
/// machine transitions and events instead
#[derive(Debug)]
pub enum Error {
    /// Rejected client or probe configuration
    InvalidConfig(&'static str),
    /// A probe is already active on this client
    Preempted,
    /// The client hit a fatal I/O error earlier and must be recreated
    Disabled,
    /// Fatal I/O error; accompanied by an [`Event::Down`]
    Io(std::io::Error),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),
            Self::Preempted => write!(f, "A probe is already active"),
            Self::Disabled => write!(f, "The client is disabled after a fatal error"),
            Self::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
