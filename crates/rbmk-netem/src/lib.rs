//! In-process network emulation: a virtual internet of simulated hosts, a router with pluggable
//! packet filters, and the DNS, TLS and HTTP servers that populate it.
//!
//! Frames travel from a [`Stack`] into the [`Internet`] in-flight queue; a [`Route`]
//! implementation drains that queue, runs every frame through its [`PacketFilter`] and hands the
//! survivors to the destination stack.

#![forbid(unsafe_code)]

pub mod ca;
pub mod censor;
pub mod dns;
mod error;
mod filter;
mod frame;
mod internet;
mod router;
pub mod server;
mod stack;
mod stats;

pub use ca::{CaError, CertificateAuthority, IssuedCert};
pub use censor::{DnsPoisoner, PoisonMode};
pub use dns::{DatabaseHandler, DnsDatabase, DnsHandler};
pub use error::NetemError;
pub use filter::{FilterFn, PacketFilter, PassThrough};
pub use frame::{Frame, Payload, Segment};
pub use internet::Internet;
pub use router::{Route, Router};
pub use server::ServerHandle;
pub use stack::{Stack, TcpListener, TcpStream, UdpSocket, MAX_SEGMENT_SIZE};
pub use stats::{RouterStats, RouterStatsSnapshot};
