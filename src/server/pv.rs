use std::{
    collections::HashMap,
    error::Error,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, warn};

use super::{
    ServerContext, ServerError, ServerTcpHandler, replies::ServerMessage,
    subscription::MonitorSubscription,
};
use crate::{
    auth::ClientAuthentication,
    data::{BitSet, PvStructure},
};

/// Result of user-supplied PV handlers. The error text is reported to the client.
pub type HandlerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Handles writes from clients to a PV
///
/// `written` is the PV's current value with the client's changes applied, and
/// `changes` holds the element indices the client wrote. To accept a write,
/// typically call [`ServerPv::update`] with the written value.
pub trait WriteHandler: Send + Sync {
    fn handle_write(
        &self,
        pv: &ServerPv,
        changes: &BitSet,
        written: PvStructure,
    ) -> HandlerResult<()>;
}

impl<F> WriteHandler for F
where
    F: Fn(&ServerPv, &BitSet, PvStructure) -> HandlerResult<()> + Send + Sync,
{
    fn handle_write(
        &self,
        pv: &ServerPv,
        changes: &BitSet,
        written: PvStructure,
    ) -> HandlerResult<()> {
        self(pv, changes, written)
    }
}

/// Remote procedure call served by a PV
pub trait RpcService: Send + Sync {
    fn call(&self, parameters: &PvStructure) -> HandlerResult<PvStructure>;
}

impl<F> RpcService for F
where
    F: Fn(&PvStructure) -> HandlerResult<PvStructure> + Send + Sync,
{
    fn call(&self, parameters: &PvStructure) -> HandlerResult<PvStructure> {
        self(parameters)
    }
}

pub(crate) enum PvHandler {
    ReadOnly,
    Write(Arc<dyn WriteHandler>),
    Rpc(Arc<dyn RpcService>),
}

/// A client channel on one connection
struct ClientChannel {
    cid: u32,
    connection: Weak<ServerTcpHandler>,
}

/// A PV served by this server
///
/// Holds the current value, the client channels connected to it, and their
/// monitor subscriptions.
pub struct ServerPv {
    name: String,
    sid: u32,
    context: Weak<ServerContext>,
    data: Mutex<PvStructure>,
    handler: PvHandler,
    writable: AtomicBool,
    /// Channels by connection id
    clients: Mutex<HashMap<u64, ClientChannel>>,
    subscriptions: Mutex<Vec<Arc<MonitorSubscription>>>,
    closed: AtomicBool,
}

impl fmt::Debug for ServerPv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPv")
            .field("name", &self.name)
            .field("sid", &self.sid)
            .finish_non_exhaustive()
    }
}

impl ServerPv {
    pub(crate) fn new(
        name: &str,
        sid: u32,
        data: PvStructure,
        handler: PvHandler,
        context: Weak<ServerContext>,
    ) -> Self {
        ServerPv {
            name: name.to_string(),
            sid,
            context,
            data: Mutex::new(data),
            writable: AtomicBool::new(matches!(handler, PvHandler::Write(_))),
            handler,
            clients: Default::default(),
            subscriptions: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server-side ID of this PV, unique within the server
    pub fn sid(&self) -> u32 {
        self.sid
    }

    /// A copy of the current value
    pub fn get_data(&self) -> PvStructure {
        self.data.lock().unwrap().clone()
    }

    /// Change the value, and send the changes to every subscribed client
    ///
    /// `new` must have the same structure as the PV's value.
    pub fn update(&self, new: &PvStructure) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::Closed(self.name.clone()));
        }
        let mut data = self.data.lock().unwrap();
        let changes = data.update(new)?;
        if changes.is_empty() {
            return Ok(());
        }
        // Under the data lock, so all subscriptions see updates in the same order
        for subscription in self.subscriptions.lock().unwrap().iter() {
            subscription.update(new);
        }
        Ok(())
    }

    /// May this client write to the PV?
    ///
    /// Needs a write handler, the PV not made read-only, and permission from the
    /// server's authorization policy.
    pub fn is_writable(&self, client: &ClientAuthentication) -> bool {
        if !matches!(self.handler, PvHandler::Write(_)) || !self.writable.load(Ordering::Acquire)
        {
            return false;
        }
        match self.context.upgrade() {
            Some(context) => context.authorization().has_write_access(&self.name, client),
            None => false,
        }
    }

    /// Allow or forbid writes, telling every connected client
    pub fn set_writable(&self, writable: bool) {
        if self.writable.swap(writable, Ordering::AcqRel) == writable {
            return;
        }
        debug!("PV {} is now {}", self.name, if writable { "writable" } else { "read-only" });
        self.notify_access_rights();
    }

    /// Send every client its current access rights
    pub(crate) fn notify_access_rights(&self) {
        for channel in self.clients.lock().unwrap().values() {
            if let Some(connection) = channel.connection.upgrade() {
                self.notify_access_rights_to(&connection, channel.cid);
            }
        }
    }

    pub(crate) fn notify_connection_access_rights(&self, connection: &ServerTcpHandler) {
        let cid = self
            .clients
            .lock()
            .unwrap()
            .get(&connection.id())
            .map(|c| c.cid);
        if let Some(cid) = cid {
            self.notify_access_rights_to(connection, cid);
        }
    }

    fn notify_access_rights_to(&self, connection: &ServerTcpHandler, cid: u32) {
        let writable = self.is_writable(&connection.authentication());
        connection.send(ServerMessage::AclChange { cid, writable });
    }

    /// A client wrote to the PV
    pub(crate) fn wrote(
        &self,
        client: &ClientAuthentication,
        changes: &BitSet,
        written: PvStructure,
    ) -> HandlerResult<()> {
        let PvHandler::Write(handler) = &self.handler else {
            return Err(format!("{} is read-only", self.name).into());
        };
        debug!("{client} wrote {:?} to {}", changes, self.name);
        handler.handle_write(self, changes, written)
    }

    pub(crate) fn rpc(&self, parameters: &PvStructure) -> HandlerResult<PvStructure> {
        match &self.handler {
            PvHandler::Rpc(service) => service.call(parameters),
            _ => Err(format!("{} does not support RPC", self.name).into()),
        }
    }

    pub(crate) fn add_client(&self, connection: &Arc<ServerTcpHandler>, cid: u32) {
        let previous = self.clients.lock().unwrap().insert(
            connection.id(),
            ClientChannel {
                cid,
                connection: Arc::downgrade(connection),
            },
        );
        if let Some(previous) = previous {
            warn!(
                "{} created channel {} to {} again, previously as cid {}",
                connection.peer(),
                cid,
                self.name,
                previous.cid
            );
        }
    }

    pub(crate) fn remove_client(&self, connection: &ServerTcpHandler, cid: u32) {
        let mut clients = self.clients.lock().unwrap();
        match clients.get(&connection.id()) {
            Some(channel) if channel.cid != cid => {
                warn!(
                    "{} closed channel {} to {}, but it was created as cid {}",
                    connection.peer(),
                    cid,
                    self.name,
                    channel.cid
                );
            }
            Some(_) => (),
            None => return,
        }
        clients.remove(&connection.id());
        drop(clients);
        self.stop_subscriptions(|s| s.connection_id() == connection.id());
    }

    /// Forget a connection that is going away
    pub(crate) fn remove_connection(&self, connection_id: u64) {
        self.clients.lock().unwrap().remove(&connection_id);
        self.stop_subscriptions(|s| s.connection_id() == connection_id);
    }

    /// Start a subscription, sending the current value as its first update
    pub(crate) fn subscribe(&self, connection: &Arc<ServerTcpHandler>, request_id: u32) {
        let data = self.data.lock().unwrap();
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if subscriptions
            .iter()
            .any(|s| s.connection_id() == connection.id() && s.request_id() == request_id)
        {
            debug!("Monitor {request_id} on {} is already running", self.name);
            return;
        }
        subscriptions.push(MonitorSubscription::new(request_id, connection, data.clone()));
    }

    pub(crate) fn unsubscribe(&self, connection_id: u64, request_id: u32) {
        self.stop_subscriptions(|s| {
            s.connection_id() == connection_id && s.request_id() == request_id
        });
    }

    /// Remove the matching subscriptions, dropping anything they still had queued
    fn stop_subscriptions(&self, matches: impl Fn(&MonitorSubscription) -> bool) {
        self.subscriptions.lock().unwrap().retain(|s| {
            if matches(s) {
                s.cancel();
                return false;
            }
            true
        });
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscriptions.lock().unwrap().is_empty()
    }

    /// Number of client channels connected to the PV
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Disconnect every client and remove the PV from the server
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, channel) in self.clients.lock().unwrap().drain() {
            if let Some(connection) = channel.connection.upgrade() {
                connection.send(ServerMessage::DestroyChannel {
                    sid: self.sid,
                    cid: channel.cid,
                });
            }
        }
        self.stop_subscriptions(|_| true);
        if let Some(context) = self.context.upgrade() {
            context.remove_pv(&self.name, self.sid);
        }
        debug!("Closed PV {}", self.name);
    }
}
