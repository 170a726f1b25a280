//! Pre-bind availability check for server ports.

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;
use warpnet_utilities::resolve_host;

/// Checks whether a UDP address can be bound before the engine tries.
pub trait PortProbe: Send + Sync {
    /// Returns true if `address:port` is free.
    fn is_available(&self, address: &str, port: u16) -> bool;
}

impl<F> PortProbe for F
where
    F: Fn(&str, u16) -> bool + Send + Sync,
{
    fn is_available(&self, address: &str, port: u16) -> bool {
        self(address, port)
    }
}

/// Probes by binding a throwaway UDP socket.
///
/// Any failure, including an unresolvable address, counts as unavailable.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpPortProbe;

impl PortProbe for UdpPortProbe {
    fn is_available(&self, address: &str, port: u16) -> bool {
        let addr = match resolve_host(address, port) {
            Ok(addr) => addr,
            Err(err) => {
                debug!("Probe could not resolve {}:{}: {}", address, port, err);
                return false;
            }
        };
        let bound = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .and_then(|socket| socket.bind(&addr.into()));
        if let Err(err) = &bound {
            debug!("Probe bind of {} failed: {}", addr, err);
        }
        bound.is_ok()
    }
}
