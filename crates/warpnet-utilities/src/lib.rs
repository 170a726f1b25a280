#![warn(missing_docs)]

//! Utility functions for warpnet sessions.
//!
//! ## Packet Building
//! [`PacketBuilder`] writes integers, floats, text and raw bytes into a
//! reusable fixed-capacity buffer.
//!
//! ## Address Utilities
//! - Host resolution (hostname or IP string to socket address)
//! - IP string parsing and formatting

use std::{
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};

/// Fixed-capacity binary writer.
pub mod packet_builder;

pub use packet_builder::{Endianness, PacketBuilder};

/// Resolves a hostname or IP string to the first matching socket address.
///
/// # Examples
/// ```no_run
/// use warpnet_utilities::resolve_host;
///
/// let addr = resolve_host("localhost", 8080).unwrap();
/// assert_eq!(addr.port(), 8080);
/// ```
pub fn resolve_host(hostname: &str, port: u16) -> io::Result<SocketAddr> {
    (hostname, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Could not resolve hostname"))
}

/// Parses an IP address string (without DNS resolution) to a socket address.
///
/// # Examples
/// ```
/// use warpnet_utilities::parse_ip;
///
/// let addr = parse_ip("127.0.0.1", 8080).unwrap();
/// assert_eq!(addr.port(), 8080);
/// assert_eq!(addr.ip().to_string(), "127.0.0.1");
/// ```
pub fn parse_ip(ip_str: &str, port: u16) -> io::Result<SocketAddr> {
    let ip: IpAddr = ip_str.parse().map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("Invalid IP address: {}", e))
    })?;
    Ok(SocketAddr::new(ip, port))
}

/// Formats the IP part of a socket address (without reverse DNS lookup).
pub fn format_ip(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}
