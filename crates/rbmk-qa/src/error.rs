use std::io;

use rbmk_netem::dns::WireError;
use rbmk_netem::{CaError, NetemError};
use thiserror::Error;

/// Which kind of server a scenario entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Dns,
    Http,
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServerRole::Dns => "DNS",
            ServerRole::Http => "HTTP",
        })
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("client stack has no addresses")]
    EmptyClientAddrs,
    #[error("client resolver address {0} is unspecified")]
    UnspecifiedResolver(std::net::IpAddr),
    #[error("{role} server #{index} has no addresses")]
    EmptyServerAddrs { role: ServerRole, index: usize },
    #[error("{role} server #{index} has aliases but no domain to point them at")]
    AliasWithoutDomain { role: ServerRole, index: usize },
    #[error("network setup failed: {0}")]
    Netem(#[from] NetemError),
    #[error("certificate setup failed: {0}")]
    Certificate(#[from] CaError),
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup of {0} timed out")]
    Timeout(String),
    #[error("no such host: {0}")]
    NoSuchHost(String),
    #[error("{domain} has no addresses")]
    NoAddresses { domain: String },
    #[error("resolver answered {domain} with rcode {rcode}")]
    ServerFailure { domain: String, rcode: u8 },
    #[error("CNAME chain for {0} is too long")]
    TooManyAliases(String),
    #[error("malformed DNS message: {0}")]
    Wire(#[from] WireError),
    #[error(transparent)]
    Netem(#[from] NetemError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
