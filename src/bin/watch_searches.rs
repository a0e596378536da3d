//! Print the PVA searches and search replies seen on the search port

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use pvars::{
    messages::{
        Command, OriginTag, SearchRequest, SearchResponse, canonical_address, parse_udp_messages,
    },
    utils::{get_default_broadcast_port, new_reusable_udp_socket},
};
use tokio::net::UdpSocket;
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Options {
    /// UDP port to listen on. Defaults to EPICS_PVA_BROADCAST_PORT, or 5076.
    #[clap(long)]
    port: Option<u16>,
    /// Multicast groups to join, e.g. 224.0.0.128
    #[clap(long)]
    group: Vec<Ipv4Addr>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = Options::parse();
    let filter = EnvFilter::default().add_directive(
        match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        }
        .into(),
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let port = opts.port.unwrap_or_else(get_default_broadcast_port);
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = match new_reusable_udp_socket(address) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("Error: Could not listen on {address}: {e}");
            std::process::exit(1);
        }
    };
    for group in &opts.group {
        if let Err(e) = socket.join_multicast_v4(*group, Ipv4Addr::UNSPECIFIED) {
            warn!("Could not join {group}: {e}");
        }
    }
    info!("Waiting for packets on {address}");
    read_socket(&socket).await;
}

async fn read_socket(socket: &UdpSocket) {
    let mut buf: Vec<u8> = vec![0; 0xFFFF];

    while let Ok((size, sender)) = socket.recv_from(&mut buf).await {
        let sender = canonical_address(sender);
        let messages = match parse_udp_messages(&buf[..size]) {
            Ok(messages) => messages,
            Err(e) => {
                println!("Received {size} byte packet from {sender} that is not PVA: {e}");
                continue;
            }
        };
        for (header, payload) in messages {
            match Command::try_from(header.command) {
                Ok(Command::Search) => match SearchRequest::parse(header.byte_order(), payload) {
                    Ok((_, search)) if search.is_list_servers() => {
                        println!("Received SEARCH {} for servers from {sender}", search.sequence)
                    }
                    Ok((_, search)) => println!(
                        "Received SEARCH {} for {} names from {sender} (reply to {}, {}): {}",
                        search.sequence,
                        search.channels.len(),
                        search.reply_address(sender),
                        search.protocols.join("/"),
                        search
                            .channels
                            .iter()
                            .map(|x| x.name.clone())
                            .collect::<Vec<String>>()
                            .join(" ")
                    ),
                    Err(_) => println!("Received INVALID search from {sender}"),
                },
                Ok(Command::SearchResponse) => {
                    match SearchResponse::parse(header.byte_order(), payload) {
                        Ok((_, response)) => println!(
                            "Received SEARCH_RESPONSE {} from server {} at {} ({}): found={} {:?}",
                            response.sequence,
                            response.guid,
                            response.server_address,
                            response.protocol,
                            response.found,
                            response.cids
                        ),
                        Err(_) => println!("Received INVALID search response from {sender}"),
                    }
                }
                Ok(Command::OriginTag) => {
                    if let Ok((_, tag)) = OriginTag::parse(payload) {
                        println!("Forwarded by {sender}, originally received on {}", tag.address);
                    }
                }
                Ok(Command::Beacon) => println!("Received BEACON from {sender}"),
                Ok(other) => debug!("Ignoring {other:?} from {sender}"),
                Err(_) => debug!("Unknown command {:#04x} from {sender}", header.command),
            }
        }
    }
}
