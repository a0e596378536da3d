use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{Instrument, debug, debug_span, info, trace, warn};

use super::{ServerContext, handlers::COMMAND_HANDLERS, replies::ServerMessage};
use crate::{
    auth::{AUTH_ANONYMOUS, AUTH_CA, AUTH_X509, ClientAuthentication},
    data::TypeRegistry,
    messages::{
        ByteOrder, Command, FrameCodec, MessageError, PvaHeader, RawFrame, Status,
        ValidationReply, ValidationRequest, WireBuffer, canonical_address, control,
    },
    tls::TlsHandshakeInfo,
};

/// Largest number of type IDs a client may cache with us
const REGISTRY_SIZE: u16 = 0x7FFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the client to answer the validation request
    ValidationPending,
    Active,
    Closed,
}

/// An outstanding get, put, monitor or RPC request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Request {
    pub sid: u32,
    pub command: Command,
}

/// One client connection, plain or TLS
///
/// Received messages are dispatched through the command handler table. Replies
/// are queued, and written by a separate send task in the order they were queued.
pub struct ServerTcpHandler {
    id: u64,
    peer: SocketAddr,
    context: Arc<ServerContext>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    state: Mutex<ConnectionState>,
    authentication: RwLock<ClientAuthentication>,
    tls: Option<TlsHandshakeInfo>,
    /// The client validated with its certificate, whether or not that is in use
    x509_requested: AtomicBool,
    /// Types the client defined on this connection
    types: Mutex<TypeRegistry>,
    requests: Mutex<HashMap<u32, Request>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ServerTcpHandler {
    /// Take over an accepted connection
    ///
    /// `tls` is the handshake information when the connection came in on the TLS
    /// port.
    pub(crate) fn start<S>(
        context: Arc<ServerContext>,
        stream: S,
        peer: SocketAddr,
        tls: Option<TlsHandshakeInfo>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = canonical_address(peer);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ServerTcpHandler {
            id: context.next_connection_id(),
            peer,
            outbound,
            state: Mutex::new(ConnectionState::ValidationPending),
            authentication: RwLock::new(ClientAuthentication::anonymous(peer.ip())),
            tls,
            x509_requested: AtomicBool::new(false),
            types: Mutex::new(TypeRegistry::default()),
            requests: Default::default(),
            cancel: context.cancel.child_token(),
            closed: AtomicBool::new(false),
            context,
        });
        let span = debug_span!("connection", id = handler.id, peer = %peer);
        debug!(parent: &span, "Accepted {} connection", if handler.is_tls() { "TLS" } else { "TCP" });
        handler.context.register_connection(handler.clone());

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(
            send_loop(
                writer,
                outbound_rx,
                handler.context.byte_order(),
                handler.context.settings().send_buffer_size as usize,
                handler.cancel.clone(),
            )
            .instrument(span.clone()),
        );

        let mut auth_methods = vec![AUTH_ANONYMOUS.to_string(), AUTH_CA.to_string()];
        if handler.is_tls() {
            auth_methods.push(AUTH_X509.to_string());
        }
        handler.send(ServerMessage::Control {
            command: control::SET_BYTE_ORDER,
            data: 0,
        });
        handler.send(ServerMessage::ValidationRequest(ValidationRequest {
            buffer_size: handler.context.settings().receive_buffer_size,
            registry_size: REGISTRY_SIZE,
            auth_methods,
        }));

        tokio::spawn(handler.clone().receive_loop(reader).instrument(span.clone()));
        if let Some(status_pv) = handler.status_pv().map(str::to_string) {
            tokio::spawn(
                handler
                    .clone()
                    .watch_certificate(status_pv)
                    .instrument(span),
            );
        }
        handler
    }

    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }
    pub fn authentication(&self) -> ClientAuthentication {
        self.authentication.read().unwrap().clone()
    }
    pub(crate) fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }
    pub(crate) fn types(&self) -> MutexGuard<'_, TypeRegistry> {
        self.types.lock().unwrap()
    }

    /// Queue a message. Messages queued after the connection closed are dropped.
    pub(crate) fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            trace!("Connection {} closed, dropping message", self.id);
        }
    }

    pub(crate) fn add_request(&self, request_id: u32, request: Request) {
        self.requests.lock().unwrap().insert(request_id, request);
    }

    pub(crate) fn remove_request(&self, request_id: u32) -> Option<Request> {
        self.requests.lock().unwrap().remove(&request_id)
    }

    /// Drop the requests made on a channel that is being destroyed
    pub(crate) fn remove_requests_for(&self, sid: u32) -> Vec<(u32, Request)> {
        let mut requests = self.requests.lock().unwrap();
        let ids: Vec<u32> = requests
            .iter()
            .filter(|(_, r)| r.sid == sid)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| requests.remove(&id).map(|r| (id, r)))
            .collect()
    }

    /// Handle the client's answer to our validation request
    pub(crate) fn validated(&self, reply: ValidationReply) {
        // Held throughout, so a concurrent certificate status change is not lost
        let mut current = self.authentication.write().unwrap();
        let mut authentication = ClientAuthentication::decode(
            &reply.auth_method,
            reply.auth_data.as_ref(),
            self.tls.as_ref(),
            self.peer.ip(),
        );
        if let ClientAuthentication::X509 { .. } = authentication
            && let Some(status_pv) = self.status_pv()
        {
            self.x509_requested.store(true, Ordering::Release);
            let status = self.context.certificate_status().status(status_pv);
            if !status.is_valid() {
                info!("Certificate of {} is {status}, using anonymous", self.peer);
                authentication = ClientAuthentication::anonymous(self.peer.ip());
            }
        }
        debug!(
            "Validated {}, client buffer size {}, authenticated as {authentication}",
            self.peer, reply.buffer_size
        );
        *current = authentication;
        drop(current);
        *self.state.lock().unwrap() = ConnectionState::Active;
        self.send(ServerMessage::Validated(Status::ok()));
    }

    fn status_pv(&self) -> Option<&str> {
        self.tls.as_ref().and_then(|t| t.status_pv.as_deref())
    }

    async fn receive_loop<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut framed = FramedRead::with_capacity(
            reader,
            FrameCodec::default(),
            self.context.settings().receive_buffer_size as usize,
        );
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.handle_frame(&frame) {
                            warn!("Closing connection from {}: {e}", self.peer);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Closing connection from {}: {e}", self.peer);
                        break;
                    }
                    None => {
                        debug!("{} closed the connection", self.peer);
                        break;
                    }
                },
            }
        }
        self.shutdown();
    }

    fn handle_frame(self: &Arc<Self>, frame: &RawFrame) -> Result<(), MessageError> {
        if frame.header.is_control() {
            self.handle_control(&frame.header);
            return Ok(());
        }
        let command = frame.header.command;
        if self.state() != ConnectionState::Active
            && !matches!(
                Command::try_from(command),
                Ok(Command::ConnectionValidation | Command::Echo | Command::Search)
            )
        {
            return Err(MessageError::UnexpectedMessage(format!(
                "Command {command:#04x} before connection validation"
            )));
        }
        match COMMAND_HANDLERS.get(command as usize).copied().flatten() {
            Some(handler) => handler(self, frame.byte_order(), &frame.payload),
            None => {
                debug!("Ignoring unsupported command {command:#04x}");
                Ok(())
            }
        }
    }

    fn handle_control(&self, header: &PvaHeader) {
        match header.command {
            control::ECHO_REQUEST => self.send(ServerMessage::Control {
                command: control::ECHO_RESPONSE,
                data: header.payload_size,
            }),
            control::SET_BYTE_ORDER => {
                trace!("Client byte order is {:?}", header.byte_order())
            }
            other => trace!("Ignoring control message {other}"),
        }
    }

    /// Follow the validity of the client certificate, dropping to anonymous
    /// access while it is not valid
    async fn watch_certificate(self: Arc<Self>, status_pv: String) {
        let mut status = self.context.certificate_status().subscribe(&status_pv);
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                changed = status.changed() => if changed.is_err() {
                    break;
                },
            }
            let current = *status.borrow_and_update();
            if current.is_valid() {
                self.revalidate();
            } else {
                self.downgrade(&format!("certificate status {status_pv} is {current}"));
            }
        }
    }

    fn downgrade(&self, reason: &str) {
        {
            let mut authentication = self.authentication.write().unwrap();
            if !self.x509_requested.load(Ordering::Acquire) || authentication.is_anonymous() {
                return;
            }
            info!("{authentication} is now anonymous: {reason}");
            *authentication = ClientAuthentication::anonymous(self.peer.ip());
        }
        self.notify_access_rights();
    }

    /// Use the certificate identity again, if the client asked for it
    fn revalidate(&self) {
        {
            let mut authentication = self.authentication.write().unwrap();
            if !self.x509_requested.load(Ordering::Acquire) || !authentication.is_anonymous() {
                return;
            }
            let restored =
                ClientAuthentication::decode(AUTH_X509, None, self.tls.as_ref(), self.peer.ip());
            info!("Certificate of {} is valid again, now {restored}", self.peer);
            *authentication = restored;
        }
        self.notify_access_rights();
    }

    fn notify_access_rights(&self) {
        for pv in self.context.all_pvs() {
            pv.notify_connection_access_rights(self);
        }
    }

    /// Close the connection and forget its channels and subscriptions
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock().unwrap() = ConnectionState::Closed;
        self.cancel.cancel();
        self.requests.lock().unwrap().clear();
        self.context.shutdown_connection(self);
    }
}

#[cfg(test)]
impl ServerTcpHandler {
    /// A validated connection without a socket. Whatever it sends stays in the
    /// returned queue.
    pub(crate) fn detached(
        context: Arc<ServerContext>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let peer = SocketAddr::from(([127, 0, 0, 1], 5075));
        let handler = Arc::new(ServerTcpHandler {
            id: context.next_connection_id(),
            peer,
            outbound,
            state: Mutex::new(ConnectionState::Active),
            authentication: RwLock::new(ClientAuthentication::anonymous(peer.ip())),
            tls: None,
            x509_requested: AtomicBool::new(false),
            types: Mutex::new(TypeRegistry::default()),
            requests: Default::default(),
            cancel: context.cancel.child_token(),
            closed: AtomicBool::new(false),
            context,
        });
        (handler, queue)
    }
}

/// Write queued messages, batching whatever is queued up to `batch_size`
async fn send_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    order: ByteOrder,
    batch_size: usize,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut buffer = WireBuffer::new(order);
    loop {
        let message = select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        message.encode(&mut buffer);
        while buffer.len() < batch_size {
            match outbound.try_recv() {
                Ok(message) => message.encode(&mut buffer),
                Err(_) => break,
            }
        }
        // A monitor with nothing pending writes nothing
        if buffer.is_empty() {
            continue;
        }
        let sent = async {
            writer.write_all(buffer.as_slice()).await?;
            writer.flush().await
        };
        if let Err(e) = sent.await {
            debug!("Send failed: {e}");
            cancel.cancel();
            break;
        }
        buffer.clear();
    }
    let _ = writer.shutdown().await;
}
