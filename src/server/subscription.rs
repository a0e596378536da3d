use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

use tracing::trace;

use super::{ServerTcpHandler, replies::ServerMessage};
use crate::{
    data::{BitSet, PvStructure},
    messages::{Command, WireBuffer, flags, subcommand},
};

struct MonitorState {
    /// Latest value, as last sent plus any pending changes
    value: PvStructure,
    changes: BitSet,
    /// Elements that changed again before their previous change was sent
    overrun: BitSet,
}

/// A client's monitor of one PV
///
/// Updates are merged into the pending state, and at most one send is queued on
/// the connection at a time. Whatever accumulated until the send goes out is
/// transmitted in one message.
pub(crate) struct MonitorSubscription {
    request_id: u32,
    connection_id: u64,
    connection: Weak<ServerTcpHandler>,
    state: Mutex<MonitorState>,
    queued: AtomicBool,
    /// Cleared when the client stops the monitor
    active: AtomicBool,
}

impl MonitorSubscription {
    /// Subscribe, queueing the complete current value as the first update
    pub fn new(
        request_id: u32,
        connection: &Arc<ServerTcpHandler>,
        value: PvStructure,
    ) -> Arc<Self> {
        let subscription = Arc::new(MonitorSubscription {
            request_id,
            connection_id: connection.id(),
            connection: Arc::downgrade(connection),
            state: Mutex::new(MonitorState {
                changes: BitSet::all(value.element_count()),
                overrun: BitSet::new(),
                value,
            }),
            queued: AtomicBool::new(false),
            active: AtomicBool::new(true),
        });
        subscription.schedule();
        subscription
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Stop sending, including an update that is already queued
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Merge a new value of the PV into the pending update
    pub fn update(self: &Arc<Self>, new: &PvStructure) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let Ok(changes) = state.value.update(new) else {
            return;
        };
        if changes.is_empty() {
            return;
        }
        let overrun = state.changes.intersection(&changes);
        state.overrun.union_with(&overrun);
        state.changes.union_with(&changes);
        drop(state);
        self.schedule();
    }

    fn schedule(self: &Arc<Self>) {
        if self
            .queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match self.connection.upgrade() {
            Some(connection) => connection.send(ServerMessage::Monitor(self.clone())),
            None => self.queued.store(false, Ordering::Release),
        }
    }

    /// Write the pending update, if there is one, and start collecting the next
    pub fn encode(&self, buffer: &mut WireBuffer) {
        // Cleared first: a concurrent update either lands in this message, or
        // queues the next one
        self.queued.store(false, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        if state.changes.is_empty() || !self.active.load(Ordering::Acquire) {
            return;
        }
        trace!(
            "Monitor {} sending {:?}, overrun {:?}",
            self.request_id, state.changes, state.overrun
        );
        let start = buffer.begin_message(flags::FROM_SERVER, Command::Monitor);
        buffer.put_u32(self.request_id);
        buffer.put_u8(subcommand::EXEC);
        state.changes.write(buffer);
        state.value.write_changed(&state.changes, buffer);
        state.overrun.write(buffer);
        buffer.end_message(start);
        state.changes.clear_all();
        state.overrun.clear_all();
    }
}
