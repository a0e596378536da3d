//! Discovery: answering UDP searches
//!
//! One socket per address family listens on the search port, joined to the
//! configured multicast groups. Several servers on one host share the port, and
//! a unicast search only reaches the socket bound last. Searches we cannot
//! answer that arrived unicast are therefore forwarded to a local multicast
//! group, tagged with where they came from, for the other servers to see.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, atomic::Ordering},
};

use tokio::{net::UdpSocket, select, task::JoinHandle};
use tracing::{Instrument, debug, debug_span, trace, warn};

use super::{ServerContext, ServerError};
use crate::{
    messages::{
        ByteOrder, Command, MessageError, OriginTag, SearchChannel, SearchRequest, WireBuffer,
        canonical_address, parse_udp_messages,
    },
    utils::{InterfaceAddress, PvaSettings, interface_index, new_reusable_udp_socket},
};

/// The search sockets, also used to send replies
pub(crate) struct UdpReplier {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
    port: u16,
}

impl UdpReplier {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn send_to(&self, data: &[u8], target: SocketAddr) {
        let socket = if target.is_ipv4() { &self.v4 } else { &self.v6 };
        let Some(socket) = socket else {
            warn!("No search socket can reach {target}");
            return;
        };
        if let Err(e) = socket.try_send_to(data, target) {
            warn!("Could not send {} bytes to {target}: {e}", data.len());
        }
    }

    fn sockets(&self) -> impl Iterator<Item = &Arc<UdpSocket>> {
        self.v4.iter().chain(self.v6.iter())
    }
}

fn join_groups(socket: &UdpSocket, settings: &PvaSettings, ipv4: bool) {
    for entry in &settings.interfaces {
        let InterfaceAddress::Multicast(multicast) = entry else {
            continue;
        };
        if entry.is_ipv4() != ipv4 {
            continue;
        }
        let joined = match (multicast.group, multicast.interface) {
            (IpAddr::V4(group), IpAddr::V4(interface)) => {
                let joined = socket.join_multicast_v4(group, interface);
                if joined.is_ok() && Some(group) == settings.local_multicast {
                    // Forwarded searches leave through the group's interface
                    let _ = socket
                        .set_multicast_ttl_v4(multicast.ttl)
                        .and_then(|_| socket.set_multicast_loop_v4(true))
                        .and_then(|_| socket2::SockRef::from(socket).set_multicast_if_v4(&interface));
                }
                joined
            }
            (IpAddr::V6(group), interface) => match interface_index(interface) {
                Some(index) => socket.join_multicast_v6(&group, index),
                None => {
                    warn!("No interface with address {interface} to join {group}");
                    continue;
                }
            },
            (group, interface) => {
                warn!("Cannot join {group} on {interface}");
                continue;
            }
        };
        match joined {
            Ok(()) => debug!(
                "Joined multicast group {} on {}",
                multicast.group, multicast.interface
            ),
            Err(e) => warn!("Could not join multicast group {}: {e}", multicast.group),
        }
    }
}

/// Bind the search sockets for the configured interfaces
///
/// A missing IPv6 stack only disables IPv6 discovery.
pub(crate) fn bind(settings: &PvaSettings) -> Result<UdpReplier, ServerError> {
    let mut port = settings.udp_port;
    let mut replier = UdpReplier {
        v4: None,
        v6: None,
        port,
    };
    for ipv4 in [true, false] {
        let address = settings.interfaces.iter().find_map(|entry| match entry {
            InterfaceAddress::Bind(ip) if ip.is_ipv4() == ipv4 => Some(*ip),
            _ => None,
        });
        let Some(address) = address else {
            continue;
        };
        let address = SocketAddr::new(address, port);
        let socket = match new_reusable_udp_socket(address) {
            Ok(socket) => socket,
            Err(e) if !ipv4 => {
                warn!("IPv6 search is not available on {address}: {e}");
                continue;
            }
            Err(e) => return Err(ServerError::Bind(address, e)),
        };
        if port == 0 {
            // Both families share the port picked for the first
            port = socket.local_addr()?.port();
        }
        join_groups(&socket, settings, ipv4);
        let socket = Some(Arc::new(socket));
        if ipv4 {
            replier.v4 = socket;
        } else {
            replier.v6 = socket;
        }
    }
    if replier.v4.is_none() && replier.v6.is_none() {
        warn!("No search sockets bound, the server can only be reached directly");
    }
    replier.port = port;
    Ok(replier)
}

/// Listen for searches on every search socket
pub(crate) fn start(context: &Arc<ServerContext>) -> Vec<JoinHandle<()>> {
    context
        .udp
        .sockets()
        .map(|socket| {
            let local = socket.local_addr().ok();
            tokio::spawn(
                listen(context.clone(), socket.clone())
                    .instrument(debug_span!("udp", local = ?local)),
            )
        })
        .collect()
}

async fn listen(context: Arc<ServerContext>, socket: Arc<UdpSocket>) {
    let local = socket
        .local_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        select! {
            _ = context.cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok((size, sender)) => {
                    let sender = canonical_address(sender);
                    if let Err(e) = handle_datagram(&context, local, &buffer[..size], sender) {
                        debug!("Ignoring bad datagram from {sender}: {e}");
                    }
                }
                Err(e) => warn!("Error receiving search: {e}"),
            },
        }
    }
    debug!("Stopped listening for searches");
}

fn handle_datagram(
    context: &ServerContext,
    local: IpAddr,
    datagram: &[u8],
    sender: SocketAddr,
) -> Result<(), MessageError> {
    let mut origin = None;
    for (header, payload) in parse_udp_messages(datagram)? {
        match Command::try_from(header.command) {
            Ok(Command::OriginTag) => origin = Some(OriginTag::parse(payload)?.1),
            Ok(Command::Search) => {
                handle_search(context, local, header.byte_order(), payload, sender, origin)?
            }
            Ok(other) => trace!("Ignoring {other:?} from {sender}"),
            Err(_) => trace!("Ignoring command {:#04x} from {sender}", header.command),
        }
    }
    Ok(())
}

fn handle_search(
    context: &ServerContext,
    local: IpAddr,
    order: ByteOrder,
    payload: &[u8],
    sender: SocketAddr,
    origin: Option<OriginTag>,
) -> Result<(), MessageError> {
    let (_, search) = SearchRequest::parse(order, payload)?;
    let client = search.reply_address(sender);
    let tls = search.tls_requested();
    trace!(
        "Search {} from {sender} for {} channels",
        search.sequence,
        search.channels.len()
    );
    if search.is_list_servers() {
        context.handle_search_request(search.sequence, None, "", client, tls, None);
        return Ok(());
    }

    let unanswered: Vec<SearchChannel> = search
        .channels
        .iter()
        .filter(|channel| {
            !context.handle_search_request(
                search.sequence,
                Some(channel.cid),
                &channel.name,
                client,
                tls,
                None,
            )
        })
        .cloned()
        .collect();
    // Unknown names are never answered, only passed on to other local servers
    if !unanswered.is_empty()
        && search.unicast
        && origin.is_none()
        && sender.is_ipv4()
        && let Some(group) = context.settings().local_multicast
    {
        forward(context, local, &search, &unanswered, client, group);
    }
    Ok(())
}

/// Pass unanswered channels of a unicast search on to the other local servers
fn forward(
    context: &ServerContext,
    local: IpAddr,
    search: &SearchRequest,
    channels: &[SearchChannel],
    client: SocketAddr,
    group: Ipv4Addr,
) {
    let mut buffer = WireBuffer::new(context.byte_order());
    OriginTag { address: local }.write(&mut buffer);
    SearchRequest {
        sequence: search.sequence,
        reply_required: false,
        unicast: false,
        response_address: client,
        protocols: search.protocols.clone(),
        channels: channels.to_vec(),
    }
    .write(&mut buffer);
    let target = SocketAddr::new(IpAddr::V4(group), context.udp_port.load(Ordering::Relaxed));
    debug!(
        "Forwarding search {} for {} channels to {target}",
        search.sequence,
        channels.len()
    );
    context.udp.send_to(buffer.as_slice(), target);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_both_families_to_one_port() {
        let settings = PvaSettings {
            udp_port: 0,
            interfaces: crate::utils::parse_interface_list("127.0.0.1 ::1"),
            local_multicast: None,
            ..Default::default()
        };
        let replier = bind(&settings).unwrap();
        assert_ne!(replier.port(), 0);
        let v4 = replier.v4.as_ref().unwrap();
        assert_eq!(v4.local_addr().unwrap().port(), replier.port());
        if let Some(v6) = &replier.v6 {
            assert_eq!(v6.local_addr().unwrap().port(), replier.port());
        }
    }
}
