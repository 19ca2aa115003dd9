use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no serial line towards next hop {0}")]
    UnknownNextHop(Ipv4Addr),

    #[error("no route towards {0}")]
    NoRoute(Ipv4Addr),

    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("invalid IPv4 address: {0}")]
    InvalidAddr(#[from] std::net::AddrParseError),

    #[error("serial device error: {0}")]
    Sys(#[from] nix::Error),
}
