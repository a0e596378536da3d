//! The PVA server: PV registry, discovery, and connection handling
//!
//! A [`PvaServer`] is started through a [`ServerBuilder`]. It owns a
//! [`ServerContext`] shared by all of its tasks:
//!
//! - one UDP task per address family answers searches ([`udp`]),
//! - one accept task takes plain and TLS connections ([`listener`]),
//! - every connection gets a receive and a send task ([`tcp`]).
//!
//! PVs are created with [`PvaServer::create_pv`] and friends, and updated through
//! the returned [`ServerPv`].

mod handlers;
mod listener;
mod pv;
mod replies;
mod subscription;
mod tcp;
mod udp;

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use pv::{HandlerResult, RpcService, ServerPv, WriteHandler};
pub use tcp::ServerTcpHandler;

use crate::{
    access::{AccessFileError, FileBasedServerAuthorization},
    auth::{DefaultAuthorization, ServerAuthorization},
    cert_status::CertificateStatusMonitor,
    data::{DataError, PvStructure},
    guid::Guid,
    messages::{ByteOrder, SearchResponse, UNSPECIFIED_V4, WireBuffer},
    tls::{TlsError, load_acceptor},
    utils::{InterfaceAddress, PvaSettings},
};
use pv::PvHandler;
use replies::ServerMessage;
use udp::UdpReplier;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("A PV named '{0}' already exists")]
    DuplicatePv(String),
    #[error("PV '{0}' has been closed")]
    Closed(String),
    #[error("Could not bind {0}: {1}")]
    Bind(SocketAddr, io::Error),
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Access(#[from] AccessFileError),
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Hook that sees every search before the server's own lookup
///
/// Gateways and name servers use this to create PVs on demand. Return `true` if the
/// search was fully handled, `false` to continue with the default handling, which
/// replies if a PV of that name exists.
pub trait SearchHandler: Send + Sync {
    /// `cid` is `None` for "list servers" requests, which carry no name
    fn handle_search(&self, sequence: u32, cid: Option<u32>, name: &str, client: SocketAddr)
    -> bool;
}

impl<F> SearchHandler for F
where
    F: Fn(u32, Option<u32>, &str, SocketAddr) -> bool + Send + Sync,
{
    fn handle_search(
        &self,
        sequence: u32,
        cid: Option<u32>,
        name: &str,
        client: SocketAddr,
    ) -> bool {
        self(sequence, cid, name, client)
    }
}

/// State shared by every part of one server
pub struct ServerContext {
    guid: Guid,
    settings: PvaSettings,
    byte_order: ByteOrder,
    pvs_by_name: RwLock<HashMap<String, Arc<ServerPv>>>,
    pvs_by_sid: RwLock<HashMap<u32, Arc<ServerPv>>>,
    next_sid: AtomicU32,
    search_handler: Option<Arc<dyn SearchHandler>>,
    authorization: Arc<dyn ServerAuthorization>,
    certificate_status: Arc<CertificateStatusMonitor>,
    connections: Mutex<HashMap<u64, Arc<ServerTcpHandler>>>,
    next_connection_id: AtomicU64,
    tcp_port: AtomicU16,
    /// Zero when TLS is not available
    tls_port: AtomicU16,
    udp_port: AtomicU16,
    udp: UdpReplier,
    cancel: CancellationToken,
}

impl ServerContext {
    pub fn guid(&self) -> Guid {
        self.guid
    }
    pub fn settings(&self) -> &PvaSettings {
        &self.settings
    }
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }
    pub fn authorization(&self) -> &dyn ServerAuthorization {
        self.authorization.as_ref()
    }
    pub fn certificate_status(&self) -> &Arc<CertificateStatusMonitor> {
        &self.certificate_status
    }
    pub fn tls_available(&self) -> bool {
        self.tls_port.load(Ordering::Relaxed) != 0
    }

    pub fn get_pv(&self, name: &str) -> Option<Arc<ServerPv>> {
        self.pvs_by_name.read().unwrap().get(name).cloned()
    }

    pub fn get_pv_by_sid(&self, sid: u32) -> Option<Arc<ServerPv>> {
        self.pvs_by_sid.read().unwrap().get(&sid).cloned()
    }

    fn all_pvs(&self) -> Vec<Arc<ServerPv>> {
        self.pvs_by_sid.read().unwrap().values().cloned().collect()
    }

    fn create_pv(
        self: &Arc<Self>,
        name: &str,
        data: PvStructure,
        handler: PvHandler,
    ) -> Result<Arc<ServerPv>, ServerError> {
        let mut by_name = self.pvs_by_name.write().unwrap();
        if by_name.contains_key(name) {
            return Err(ServerError::DuplicatePv(name.to_string()));
        }
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let pv = Arc::new(ServerPv::new(name, sid, data, handler, Arc::downgrade(self)));
        by_name.insert(name.to_string(), pv.clone());
        self.pvs_by_sid.write().unwrap().insert(sid, pv.clone());
        debug!("Created PV {name} with SID {sid}");
        Ok(pv)
    }

    pub(crate) fn remove_pv(&self, name: &str, sid: u32) {
        self.pvs_by_name.write().unwrap().remove(name);
        self.pvs_by_sid.write().unwrap().remove(&sid);
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_connection(&self, connection: Arc<ServerTcpHandler>) {
        self.connections
            .lock()
            .unwrap()
            .insert(connection.id(), connection);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Forget everything a closed connection had: channels and subscriptions
    pub(crate) fn shutdown_connection(&self, connection: &ServerTcpHandler) {
        for pv in self.all_pvs() {
            pv.remove_connection(connection.id());
        }
        self.connections.lock().unwrap().remove(&connection.id());
        debug!(
            "Connection {} from {} shut down",
            connection.id(),
            connection.peer()
        );
    }

    /// Answer a search for one channel, or a "list servers" request when `cid` is `None`
    ///
    /// Replies go back over `tcp` when the search arrived on a connection, otherwise
    /// by UDP to `client`. Returns whether a reply was sent (or the search handler
    /// took care of it).
    pub(crate) fn handle_search_request(
        &self,
        sequence: u32,
        cid: Option<u32>,
        name: &str,
        client: SocketAddr,
        tls_requested: bool,
        tcp: Option<&ServerTcpHandler>,
    ) -> bool {
        let use_tls = tls_requested && self.tls_available();
        if tls_requested && !use_tls {
            debug!("{client} asked for TLS but it is not configured, offering plain TCP");
        }

        if let Some(handler) = &self.search_handler
            && handler.handle_search(sequence, cid, name, client)
        {
            return true;
        }

        match cid {
            None => {
                self.send_search_reply(sequence, Vec::new(), client, use_tls, tcp);
                true
            }
            Some(cid) => {
                if self.get_pv(name).is_none() {
                    return false;
                }
                if !self.authorization.has_read_access(name, client.ip()) {
                    debug!("Not revealing {name} to {client}");
                    return false;
                }
                debug!("Replying to search for {name} (cid {cid}) from {client}");
                self.send_search_reply(sequence, vec![cid], client, use_tls, tcp);
                true
            }
        }
    }

    fn send_search_reply(
        &self,
        sequence: u32,
        cids: Vec<u32>,
        client: SocketAddr,
        use_tls: bool,
        tcp: Option<&ServerTcpHandler>,
    ) {
        let port = if use_tls {
            self.tls_port.load(Ordering::Relaxed)
        } else {
            self.tcp_port.load(Ordering::Relaxed)
        };
        let response = SearchResponse {
            guid: self.guid,
            sequence,
            // Unspecified tells the client to use the address the reply came from
            server_address: SocketAddr::new(UNSPECIFIED_V4, port),
            protocol: if use_tls { "tls" } else { "tcp" }.to_string(),
            found: true,
            cids,
        };
        match tcp {
            Some(connection) => connection.send(ServerMessage::SearchResponse(response)),
            None => {
                let mut buffer = WireBuffer::new(self.byte_order);
                response.write(&mut buffer);
                self.udp.send_to(buffer.as_slice(), client);
            }
        }
    }
}

/// Configures and starts a [`PvaServer`]
pub struct ServerBuilder {
    settings: PvaSettings,
    search_handler: Option<Arc<dyn SearchHandler>>,
    authorization: Option<Arc<dyn ServerAuthorization>>,
    certificate_status: Option<Arc<CertificateStatusMonitor>>,
    byte_order: ByteOrder,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder::new()
    }
}

impl ServerBuilder {
    /// Start from the settings in the environment
    pub fn new() -> Self {
        ServerBuilder::with_settings(PvaSettings::from_env())
    }
    pub fn with_settings(settings: PvaSettings) -> Self {
        ServerBuilder {
            settings,
            search_handler: None,
            authorization: None,
            certificate_status: None,
            byte_order: ByteOrder::Big,
        }
    }
    /// TCP port for connections. Zero picks a free port.
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.settings.tcp_port = port;
        self
    }
    /// UDP port for searches. Zero picks a free port.
    pub fn udp_port(mut self, port: u16) -> Self {
        self.settings.udp_port = port;
        self
    }
    pub fn tls_port(mut self, port: u16) -> Self {
        self.settings.tls_port = port;
        self
    }
    /// Enable TLS with the certificate and key in a PEM file
    pub fn tls(mut self, keychain: impl Into<PathBuf>, client_ca: Option<PathBuf>) -> Self {
        self.settings.tls_keychain = Some(keychain.into());
        self.settings.tls_client_ca = client_ca;
        self
    }
    pub fn interfaces(mut self, interfaces: Vec<InterfaceAddress>) -> Self {
        self.settings.interfaces = interfaces;
        self
    }
    pub fn local_multicast(mut self, group: Option<Ipv4Addr>) -> Self {
        self.settings.local_multicast = group;
        self
    }
    pub fn search_handler(mut self, handler: impl SearchHandler + 'static) -> Self {
        self.search_handler = Some(Arc::new(handler));
        self
    }
    pub fn authorization(mut self, authorization: impl ServerAuthorization + 'static) -> Self {
        self.authorization = Some(Arc::new(authorization));
        self
    }
    pub fn certificate_status(mut self, monitor: Arc<CertificateStatusMonitor>) -> Self {
        self.certificate_status = Some(monitor);
        self
    }
    /// Byte order of everything the server sends
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub async fn start(self) -> Result<PvaServer, ServerError> {
        let settings = self.settings;
        let authorization: Arc<dyn ServerAuthorization> = match (
            self.authorization,
            &settings.pvlist,
            &settings.acf,
        ) {
            (Some(authorization), _, _) => authorization,
            (None, Some(pvlist), Some(acf)) => {
                info!("Using access rules from {} and {}", pvlist.display(), acf.display());
                Arc::new(FileBasedServerAuthorization::from_files(pvlist, acf)?)
            }
            _ => Arc::new(DefaultAuthorization),
        };
        let tls = match &settings.tls_keychain {
            Some(keychain) => Some(load_acceptor(
                keychain,
                settings.tls_client_ca.as_deref(),
            )?),
            None => None,
        };

        let listeners = listener::bind(&settings, tls).await?;
        let udp = udp::bind(&settings)?;
        let context = Arc::new(ServerContext {
            guid: Guid::random(),
            byte_order: self.byte_order,
            pvs_by_name: Default::default(),
            pvs_by_sid: Default::default(),
            next_sid: AtomicU32::new(1),
            search_handler: self.search_handler,
            authorization,
            certificate_status: self.certificate_status.unwrap_or_default(),
            connections: Default::default(),
            next_connection_id: AtomicU64::new(1),
            tcp_port: AtomicU16::new(listeners.tcp_port()),
            tls_port: AtomicU16::new(listeners.tls_port().unwrap_or(0)),
            udp_port: AtomicU16::new(udp.port()),
            udp,
            cancel: CancellationToken::new(),
            settings,
        });

        let mut tasks = udp::start(&context);
        tasks.push(listeners.start(context.clone()));

        info!(
            "PVA server {} listening on TCP {}, UDP {}{}",
            context.guid,
            context.tcp_port.load(Ordering::Relaxed),
            context.udp_port.load(Ordering::Relaxed),
            match context.tls_port.load(Ordering::Relaxed) {
                0 => String::new(),
                port => format!(", TLS {port}"),
            }
        );
        Ok(PvaServer { context, tasks })
    }
}

/// A running PVA server
pub struct PvaServer {
    context: Arc<ServerContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl PvaServer {
    /// Start a server configured from the environment
    pub async fn start() -> Result<PvaServer, ServerError> {
        ServerBuilder::new().start().await
    }

    /// Create a read-only PV
    pub fn create_pv(&self, name: &str, data: PvStructure) -> Result<Arc<ServerPv>, ServerError> {
        self.context.create_pv(name, data, PvHandler::ReadOnly)
    }

    /// Create a PV that clients may write, given permission
    pub fn create_writable_pv(
        &self,
        name: &str,
        data: PvStructure,
        handler: impl WriteHandler + 'static,
    ) -> Result<Arc<ServerPv>, ServerError> {
        self.context
            .create_pv(name, data, PvHandler::Write(Arc::new(handler)))
    }

    /// Create a PV that serves remote procedure calls
    pub fn create_rpc_pv(
        &self,
        name: &str,
        data: PvStructure,
        service: impl RpcService + 'static,
    ) -> Result<Arc<ServerPv>, ServerError> {
        self.context
            .create_pv(name, data, PvHandler::Rpc(Arc::new(service)))
    }

    pub fn get_pv(&self, name: &str) -> Option<Arc<ServerPv>> {
        self.context.get_pv(name)
    }

    pub fn get_pv_by_sid(&self, sid: u32) -> Option<Arc<ServerPv>> {
        self.context.get_pv_by_sid(sid)
    }

    pub fn pv_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .context
            .pvs_by_name
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn guid(&self) -> Guid {
        self.context.guid
    }
    pub fn tcp_port(&self) -> u16 {
        self.context.tcp_port.load(Ordering::Relaxed)
    }
    pub fn tls_port(&self) -> Option<u16> {
        match self.context.tls_port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }
    pub fn udp_port(&self) -> u16 {
        self.context.udp_port.load(Ordering::Relaxed)
    }
    pub fn connection_count(&self) -> usize {
        self.context.connection_count()
    }
    pub fn certificate_status(&self) -> &Arc<CertificateStatusMonitor> {
        self.context.certificate_status()
    }

    /// Stop listening, and close every open connection
    pub async fn close(mut self) {
        self.context.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        let connections: Vec<_> = self
            .context
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.shutdown();
        }
        info!("PVA server {} closed", self.context.guid);
    }
}

impl Drop for PvaServer {
    fn drop(&mut self) {
        self.context.cancel.cancel();
    }
}
