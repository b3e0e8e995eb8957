//! Connection Marker
//!
//! Derives a 32-bit fwmark from the client address so that egress traffic can
//! be steered by policy routing.

use std::net::IpAddr;

use tracing::warn;

use crate::error::MarkingError;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Routing tag derived from a client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Marker(u32);

impl Marker {
    pub fn for_client(client_ip: IpAddr) -> Self {
        Self(compute_mark(client_ip))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Tag `socket` with this mark.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn apply<S: std::os::fd::AsFd>(self, socket: &S) -> Result<(), MarkingError> {
        socket2::SockRef::from(socket)
            .set_mark(self.0)
            .map_err(|source| MarkingError::SetMark { mark: self.0, source })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn apply<S>(self, _socket: &S) -> Result<(), MarkingError> {
        Err(MarkingError::Unsupported)
    }

    /// Tag `socket`, logging instead of failing. Marking never blocks a connection.
    #[cfg(unix)]
    pub fn apply_or_log<S: std::os::fd::AsFd>(self, socket: &S) {
        if let Err(e) = self.apply(socket) {
            warn!(mark = self.0, error = %e, "Failed to mark outbound socket");
        }
    }

    #[cfg(not(unix))]
    pub fn apply_or_log<S>(self, socket: &S) {
        if let Err(e) = self.apply(socket) {
            warn!(mark = self.0, error = %e, "Failed to mark outbound socket");
        }
    }
}

/// IPv4 addresses map one-to-one onto the mark. IPv6 addresses are reduced to
/// their /48 prefix and hashed, so every address of one customer allocation
/// shares a mark; distinct prefixes may collide.
pub fn compute_mark(client_ip: IpAddr) -> u32 {
    match client_ip {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => u32::from_be_bytes(v4.octets()),
            None => fnv1a_32(&v6.octets()[..6]),
        },
    }
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}
