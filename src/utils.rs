use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const DEFAULT_SERVER_PORT: u16 = 5075;
pub const DEFAULT_BROADCAST_PORT: u16 = 5076;
pub const DEFAULT_BUFFER_SIZE: u32 = 16384;
pub const DEFAULT_INTERFACE_LIST: &str = "0.0.0.0 [::] 224.0.0.128,1@127.0.0.1 [ff02::42:1],1@::1";
pub const DEFAULT_LOCAL_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 128);

/// Create a UDP socket that other servers on this host can bind too
pub fn new_reusable_udp_socket(address: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if address.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if address.is_ipv6() {
        socket.set_only_v6(true)?;
    } else {
        socket.set_broadcast(true)?;
    }
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// A multicast group to join on a local interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastGroup {
    pub group: IpAddr,
    pub ttl: u32,
    pub interface: IpAddr,
}

/// One entry of the UDP interface list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAddress {
    /// Address to listen on
    Bind(IpAddr),
    Multicast(MulticastGroup),
}

impl InterfaceAddress {
    pub fn is_ipv4(&self) -> bool {
        match self {
            InterfaceAddress::Bind(ip) => ip.is_ipv4(),
            InterfaceAddress::Multicast(m) => m.group.is_ipv4(),
        }
    }
}

fn parse_ip(text: &str) -> Option<IpAddr> {
    text.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

/// Parse an interface list, e.g. `0.0.0.0 [::] 224.0.0.128,1@127.0.0.1`
///
/// Entries are addresses to listen on, or `group,ttl@interface` for multicast.
/// Invalid entries are skipped with a warning.
pub fn parse_interface_list(list: &str) -> Vec<InterfaceAddress> {
    let mut addresses = Vec::new();
    for entry in list.split_ascii_whitespace() {
        let (address, interface) = match entry.split_once('@') {
            Some((address, interface)) => (address, Some(interface)),
            None => (entry, None),
        };
        let (address, ttl) = match address.split_once(',') {
            Some((address, ttl)) => (address, ttl.parse().ok()),
            None => (address, None),
        };
        let Some(ip) = parse_ip(address) else {
            warn!("Ignoring invalid interface address '{entry}'");
            continue;
        };
        if ip.is_multicast() {
            let interface = interface.and_then(parse_ip).unwrap_or(match ip {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            });
            addresses.push(InterfaceAddress::Multicast(MulticastGroup {
                group: ip,
                ttl: ttl.unwrap_or(1),
                interface,
            }));
        } else {
            addresses.push(InterfaceAddress::Bind(ip));
        }
    }
    addresses
}

/// Index of the network interface that carries `address`, as needed to join
/// IPv6 multicast groups. Unspecified addresses map to index 0, "any".
pub(crate) fn interface_index(address: IpAddr) -> Option<u32> {
    if address.is_unspecified() {
        return Some(0);
    }
    datalink::interfaces()
        .into_iter()
        .find(|i| i.ips.iter().any(|net| net.ip() == address))
        .map(|i| i.index)
}

/// Addresses of the local interfaces, for logging where we can be reached
pub fn local_addresses() -> Vec<IpAddr> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| i.is_up())
        .flat_map(|i| i.ips.into_iter().map(|net| net.ip()))
        .collect()
}

fn get_env_port(names: &[&str], default: u16) -> u16 {
    names
        .iter()
        .find_map(|name| env::var(name).ok())
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
        .max(1024u16)
}

/// Get the server listen port, either from environment or default 5075
pub fn get_default_server_port() -> u16 {
    get_env_port(
        &["EPICS_PVAS_SERVER_PORT", "EPICS_PVA_SERVER_PORT"],
        DEFAULT_SERVER_PORT,
    )
}

/// Get the UDP search port, either from environment or default 5076
pub fn get_default_broadcast_port() -> u16 {
    get_env_port(
        &["EPICS_PVAS_BROADCAST_PORT", "EPICS_PVA_BROADCAST_PORT"],
        DEFAULT_BROADCAST_PORT,
    )
}

/// Get the TLS listen port, either from environment or default 5076
pub fn get_default_tls_port() -> u16 {
    get_env_port(&["EPICS_PVAS_TLS_PORT", "EPICS_PVA_TLS_PORT"], 5076)
}

fn get_env_path(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// PEM file with the server certificate and key. TLS is disabled without one.
pub fn get_default_tls_keychain() -> Option<PathBuf> {
    get_env_path("EPICS_PVAS_TLS_KEYCHAIN")
}

/// PEM file with the CAs that client certificates are checked against
pub fn get_default_tls_client_ca() -> Option<PathBuf> {
    get_env_path("EPICS_PVAS_TLS_CLIENT_CA")
}

pub fn get_default_interface_list() -> Vec<InterfaceAddress> {
    let list = env::var("EPICS_PVAS_INTF_ADDR_LIST")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_INTERFACE_LIST.to_string());
    let addresses = parse_interface_list(&list);
    debug!("UDP interface list: {addresses:?}");
    addresses
}

/// Multicast group that unanswered unicast searches are forwarded to
pub fn get_default_local_multicast() -> Option<Ipv4Addr> {
    match env::var("EPICS_PVA_LOCAL_MULTICAST") {
        Ok(v) if v.trim().is_empty() => None,
        Ok(v) => match v.trim().parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("Invalid EPICS_PVA_LOCAL_MULTICAST '{v}'");
                Some(DEFAULT_LOCAL_MULTICAST)
            }
        },
        Err(_) => Some(DEFAULT_LOCAL_MULTICAST),
    }
}

fn get_default_buffer_size(name: &str) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_BUFFER_SIZE)
        .max(1024)
}

pub fn get_default_pvlist() -> Option<PathBuf> {
    get_env_path("EPICS_PVAS_PVLIST")
}

pub fn get_default_acf() -> Option<PathBuf> {
    get_env_path("EPICS_PVAS_ACF")
}

/// Server configuration, as read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct PvaSettings {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub tls_port: u16,
    pub tls_keychain: Option<PathBuf>,
    pub tls_client_ca: Option<PathBuf>,
    pub interfaces: Vec<InterfaceAddress>,
    pub local_multicast: Option<Ipv4Addr>,
    pub send_buffer_size: u32,
    pub receive_buffer_size: u32,
    pub pvlist: Option<PathBuf>,
    pub acf: Option<PathBuf>,
}

impl PvaSettings {
    pub fn from_env() -> Self {
        PvaSettings {
            tcp_port: get_default_server_port(),
            udp_port: get_default_broadcast_port(),
            tls_port: get_default_tls_port(),
            tls_keychain: get_default_tls_keychain(),
            tls_client_ca: get_default_tls_client_ca(),
            interfaces: get_default_interface_list(),
            local_multicast: get_default_local_multicast(),
            send_buffer_size: get_default_buffer_size("EPICS_PVA_SEND_BUFFER_SIZE"),
            receive_buffer_size: get_default_buffer_size("EPICS_PVA_RECEIVE_BUFFER_SIZE"),
            pvlist: get_default_pvlist(),
            acf: get_default_acf(),
        }
    }
}

impl Default for PvaSettings {
    fn default() -> Self {
        PvaSettings {
            tcp_port: DEFAULT_SERVER_PORT,
            udp_port: DEFAULT_BROADCAST_PORT,
            tls_port: DEFAULT_BROADCAST_PORT,
            tls_keychain: None,
            tls_client_ca: None,
            interfaces: parse_interface_list(DEFAULT_INTERFACE_LIST),
            local_multicast: Some(DEFAULT_LOCAL_MULTICAST),
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            pvlist: None,
            acf: None,
        }
    }
}
