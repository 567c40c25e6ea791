//! Address resolution
//!
//! An [`Address`] is an ordered list of resolved endpoints for one host name,
//! kept in resolver order. Resolution failures produce an empty address rather
//! than an error; connecting to an empty address reports
//! [`NetworkError::Unresolved`](crate::error::NetworkError::Unresolved).

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use tracing::{debug, warn};

/// IP protocol family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Get a human-readable name for the family
    pub fn name(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "IPv4",
            AddressFamily::Ipv6 => "IPv6",
        }
    }
}

/// One resolved network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrInfo {
    family: AddressFamily,
    text: String,
    ip: IpAddr,
}

impl AddrInfo {
    /// Wrap an IP address
    pub fn new(ip: IpAddr) -> Self {
        let family = match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        };
        Self {
            family,
            text: ip.to_string(),
            ip,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Numeric textual rendering (`127.0.0.1`, `::1`)
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Raw address bytes in network order (4 or 16 bytes)
    pub fn raw(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    /// Socket address for this endpoint on `port`
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip, port)
    }
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.family.name(), self.text)
    }
}

impl From<IpAddr> for AddrInfo {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip)
    }
}

/// Resolved endpoints for one host
#[derive(Debug, Clone, Default)]
pub struct Address {
    entries: Vec<AddrInfo>,
}

impl Address {
    /// Resolve a host name (or numeric literal) to its endpoints
    ///
    /// Returns an empty address when resolution fails.
    pub fn resolve(hostname: &str) -> Self {
        let host = hostname.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Self::from_ips([ip]);
        }

        match (host, 0u16).to_socket_addrs() {
            Ok(addrs) => {
                let address = Self::from_ips(addrs.map(|addr| addr.ip()));
                debug!(host = %hostname, endpoints = address.len(), "Resolved host");
                address
            }
            Err(e) => {
                debug!(host = %hostname, error = %e, "Host resolution failed");
                Self::default()
            }
        }
    }

    /// Build an address from explicit IPs, dropping duplicates but keeping order
    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut entries: Vec<AddrInfo> = Vec::new();
        for ip in ips {
            if !entries.iter().any(|entry| entry.ip == ip) {
                entries.push(AddrInfo::new(ip));
            }
        }
        Self { entries }
    }

    /// Addresses of all active, non-loopback local interfaces
    ///
    /// Sorted by family, then by raw address bytes.
    pub fn local_addresses() -> Self {
        let mut ips = interface_ips();
        ips.sort_by(|a, b| {
            let a = AddrInfo::new(*a);
            let b = AddrInfo::new(*b);
            (a.family, a.raw()).cmp(&(b.family, b.raw()))
        });
        Self::from_ips(ips)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AddrInfo> {
        self.entries.iter()
    }

    /// One `"<family>: <address>"` line per endpoint
    pub fn human_readable(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }

    /// Socket addresses for every endpoint on `port`, in resolver order
    pub fn socket_addrs(&self, port: u16) -> Vec<SocketAddr> {
        self.entries.iter().map(|entry| entry.socket_addr(port)).collect()
    }
}

/// Two addresses are equal when they share at least one endpoint
impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.entries
            .iter()
            .any(|a| other.entries.iter().any(|b| a.family == b.family && a.ip == b.ip))
    }
}

impl<'a> IntoIterator for &'a Address {
    type Item = &'a AddrInfo;
    type IntoIter = std::slice::Iter<'a, AddrInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(unix)]
fn interface_ips() -> Vec<IpAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr};

    let mut ips = Vec::new();
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs fills `ifaddrs` with a list we release below.
    if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
        warn!(error = %std::io::Error::last_os_error(), "Failed to enumerate interfaces");
        return ips;
    }

    let mut cursor = ifaddrs;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        let flags = entry.ifa_flags as libc::c_int;
        if entry.ifa_addr.is_null()
            || flags & libc::IFF_LOOPBACK != 0
            || flags & libc::IFF_UP == 0
        {
            continue;
        }

        // SAFETY: sa_family tells us which sockaddr variant ifa_addr points to.
        unsafe {
            match (*entry.ifa_addr).sa_family as libc::c_int {
                libc::AF_INET => {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    ips.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))));
                }
                libc::AF_INET6 => {
                    let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);
                    ips.push(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)));
                }
                _ => {}
            }
        }
    }

    // SAFETY: `ifaddrs` came from a successful getifaddrs call.
    unsafe { libc::freeifaddrs(ifaddrs) };
    ips
}

#[cfg(not(unix))]
fn interface_ips() -> Vec<IpAddr> {
    warn!("Local interface enumeration is not supported on this platform");
    Vec::new()
}
