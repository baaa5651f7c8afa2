use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Errors produced by the virtual network substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetemError {
    #[error("a stack needs at least one address")]
    EmptyAddressSet,

    #[error("address {0} is already claimed by another stack")]
    AddressInUse(IpAddr),

    #[error("address {0} is not bound to this stack")]
    AddressNotBound(IpAddr),

    #[error("no address of the same family as {0} is bound to this stack")]
    NoRouteToHost(IpAddr),

    #[error("{0} is already in use")]
    PortInUse(SocketAddr),

    #[error("ephemeral ports exhausted")]
    PortsExhausted,

    #[error("connection to {0} refused")]
    ConnectionRefused(SocketAddr),

    #[error("stack is closed")]
    StackClosed,
}

impl From<NetemError> for io::Error {
    fn from(err: NetemError) -> Self {
        let kind = match err {
            NetemError::EmptyAddressSet => io::ErrorKind::InvalidInput,
            NetemError::AddressInUse(_) | NetemError::PortInUse(_) => io::ErrorKind::AddrInUse,
            NetemError::AddressNotBound(_) => io::ErrorKind::AddrNotAvailable,
            NetemError::NoRouteToHost(_) => io::ErrorKind::AddrNotAvailable,
            NetemError::PortsExhausted => io::ErrorKind::AddrNotAvailable,
            NetemError::ConnectionRefused(_) => io::ErrorKind::ConnectionRefused,
            NetemError::StackClosed => io::ErrorKind::NotConnected,
        };
        io::Error::new(kind, err)
    }
}
