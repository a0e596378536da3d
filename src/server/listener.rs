use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use super::{ServerContext, ServerError, ServerTcpHandler};
use crate::{tls::TlsHandshakeInfo, utils::PvaSettings};

/// Bind a listener, falling back to any free port if the requested one is taken
async fn bind_with_fallback(address: SocketAddr) -> Result<TcpListener, ServerError> {
    match TcpListener::bind(address).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == ErrorKind::AddrInUse && address.port() != 0 => {
            warn!("Port {} is in use, using a free port instead", address.port());
            let fallback = SocketAddr::new(address.ip(), 0);
            TcpListener::bind(fallback)
                .await
                .map_err(|e| ServerError::Bind(fallback, e))
        }
        Err(e) => Err(ServerError::Bind(address, e)),
    }
}

/// The bound TCP listeners: always plain, and TLS when configured
pub(crate) struct Listeners {
    plain: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
}

pub(crate) async fn bind(
    settings: &PvaSettings,
    acceptor: Option<TlsAcceptor>,
) -> Result<Listeners, ServerError> {
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let plain = bind_with_fallback(SocketAddr::new(any, settings.tcp_port)).await?;
    let tls = match acceptor {
        Some(acceptor) => Some((
            bind_with_fallback(SocketAddr::new(any, settings.tls_port)).await?,
            acceptor,
        )),
        None => None,
    };
    Ok(Listeners { plain, tls })
}

fn local_port(listener: &TcpListener) -> u16 {
    listener.local_addr().map(|a| a.port()).unwrap_or(0)
}

impl Listeners {
    pub fn tcp_port(&self) -> u16 {
        local_port(&self.plain)
    }

    pub fn tls_port(&self) -> Option<u16> {
        self.tls.as_ref().map(|(listener, _)| local_port(listener))
    }

    /// Accept connections until the server is cancelled
    pub fn start(self, context: Arc<ServerContext>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let tls_listener = self.tls.as_ref().map(|(listener, _)| listener);
            loop {
                select! {
                    _ = context.cancel.cancelled() => break,
                    accepted = self.plain.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            ServerTcpHandler::start(context.clone(), stream, peer, None);
                        }
                        Err(e) => error!("Error accepting connection: {e}"),
                    },
                    accepted = accept_optional(tls_listener) => match accepted {
                        Ok((stream, peer)) => {
                            if let Some((_, acceptor)) = &self.tls {
                                tokio::spawn(handshake(context.clone(), acceptor.clone(), stream, peer));
                            }
                        }
                        Err(e) => error!("Error accepting TLS connection: {e}"),
                    },
                }
            }
            debug!("Stopped accepting connections");
        })
    }
}

async fn accept_optional(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn handshake(
    context: Arc<ServerContext>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let _ = stream.set_nodelay(true);
    let stream = select! {
        _ = context.cancel.cancelled() => return,
        accepted = acceptor.accept(stream) => match accepted {
            Ok(stream) => stream,
            Err(e) => {
                warn!("TLS handshake with {peer} failed: {e}");
                return;
            }
        },
    };
    let info = TlsHandshakeInfo::from_session(stream.get_ref().1);
    debug!("TLS connection from {peer}: {info:?}");
    ServerTcpHandler::start(context, stream, peer, Some(info));
}
