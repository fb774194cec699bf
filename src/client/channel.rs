//! Channel lifecycle: search, circuit acquisition, server-side creation,
//! disconnect/reconnect with transparent resubscription, destruction.
//!
//! A channel is itself a [`TransportSender`]: the one frame it ever sends is
//! either `CREATE_CHANNEL` or `DESTROY_CHANNEL`, selected by a flag, exactly
//! mirroring its two lifecycle transitions that talk to the server.

use std::{
    cmp::min,
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use bytes::BufMut;
use tracing::{debug, warn};

use crate::{
    client::{
        context::ClientContext,
        operations::{
            self, ChannelArray, ChannelGet, ChannelProcess, ChannelPut, ChannelPutGet, ChannelRpc,
            Monitor, Operation,
        },
        requesters::{
            ChannelArrayRequester, ChannelGetRequester, ChannelProcessRequester,
            ChannelPutGetRequester, ChannelPutRequester, ChannelRequester, ChannelRpcRequester,
            ConnectionState, GetFieldRequester, MonitorRequester, guard_callback, statuses,
        },
        transport::{Circuit, SendControl, TransportSender},
    },
    data::PvRequest,
    messages::{MessageKind, serialize_create_channel},
    wire::{Status, commands},
};

/// Server channel id before the server has assigned one.
pub(crate) const NO_SID: u32 = 0xFFFF_FFFF;

struct ChannelShared {
    connection: ConnectionState,
    circuit: Option<Arc<Circuit>>,
    sid: u32,
    /// Send `CREATE_CHANNEL` next, as opposed to `DESTROY_CHANNEL`.
    issue_create_message: bool,
    /// Guards against duplicate creation on the same transport.
    allow_creation: bool,
    need_subscription_update: bool,
    /// A fixed-address reconnect loop is already running.
    reconnect_task: bool,
}

/// A named process variable on some server, found by search or fixed
/// address, holding at most one circuit at a time.
pub struct Channel {
    context: Weak<ClientContext>,
    cid: u32,
    name: String,
    priority: u16,
    requester: Arc<dyn ChannelRequester>,
    fixed_address: Option<SocketAddr>,
    state: Mutex<ChannelShared>,
    requests: Mutex<HashMap<u32, Arc<Operation>>>,
}

impl Channel {
    pub(crate) fn new(
        context: &Arc<ClientContext>,
        cid: u32,
        name: String,
        requester: Arc<dyn ChannelRequester>,
        priority: u16,
        fixed_address: Option<SocketAddr>,
    ) -> Arc<Channel> {
        Arc::new(Channel {
            context: Arc::downgrade(context),
            cid,
            name,
            priority,
            requester,
            fixed_address,
            state: Mutex::new(ChannelShared {
                connection: ConnectionState::NeverConnected,
                circuit: None,
                sid: NO_SID,
                issue_create_message: true,
                allow_creation: true,
                need_subscription_update: false,
                reconnect_task: false,
            }),
            requests: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// The server's address while connected.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        match state.connection {
            ConnectionState::Connected => state.circuit.as_ref().map(|c| c.remote()),
            _ => None,
        }
    }

    pub(crate) fn context(&self) -> Option<Arc<ClientContext>> {
        self.context.upgrade()
    }

    pub(crate) fn server_channel_id(&self) -> u32 {
        self.state.lock().unwrap().sid
    }

    /// The circuit, provided the channel is connected.
    pub(crate) fn checked_transport(&self) -> Result<Arc<Circuit>, Status> {
        let state = self.state.lock().unwrap();
        match state.connection {
            ConnectionState::Destroyed => Err(statuses::channel_destroyed()),
            ConnectionState::Connected => state
                .circuit
                .clone()
                .ok_or_else(statuses::channel_not_connected),
            _ => Err(statuses::channel_not_connected()),
        }
    }

    /// Begin connecting if not already connected.
    pub fn connect(self: &Arc<Self>) {
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::Destroyed => {}
            _ => self.initiate_search(),
        }
    }

    /// Drop the server-side channel but keep this object usable; `connect`
    /// starts over.
    pub fn disconnect(self: &Arc<Self>) {
        let circuit = {
            let mut state = self.state.lock().unwrap();
            if state.connection != ConnectionState::Connected {
                return;
            }
            state.issue_create_message = false;
            state.circuit.clone()
        };
        if let Some(context) = self.context() {
            context.search().unregister(self.cid);
        }
        self.disconnect_pending_io(false);
        if let Some(circuit) = circuit {
            let _ = circuit.enqueue(self.clone());
        }
        self.set_connection_state(ConnectionState::Disconnected);
    }

    /// Destroy the channel: terminal. Every outstanding operation receives
    /// `channel destroyed` exactly once.
    pub fn destroy(self: &Arc<Self>) {
        {
            let state = self.state.lock().unwrap();
            if state.connection == ConnectionState::Destroyed {
                return;
            }
        }
        let context = self.context();
        if let Some(context) = &context {
            context.search().unregister(self.cid);
        }
        self.disconnect_pending_io(true);
        let circuit = {
            let mut state = self.state.lock().unwrap();
            state.issue_create_message = false;
            state.circuit.take()
        };
        if let Some(circuit) = circuit {
            // best-effort server-side teardown
            let _ = circuit.enqueue(self.clone());
            circuit.detach(self.cid);
        }
        self.set_connection_state(ConnectionState::Destroyed);
        if let Some(context) = context {
            context.unregister_channel(self.cid);
        }
    }

    /// Enter the search phase, or dial a fixed address directly.
    pub(crate) fn initiate_search(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.connection == ConnectionState::Destroyed {
                return;
            }
            state.allow_creation = true;
        }
        match self.fixed_address {
            Some(address) => self.spawn_fixed_reconnect(address),
            None => {
                if let Some(context) = self.context() {
                    context.search().register(self.clone());
                }
            }
        }
    }

    /// A fixed-address channel bypasses search and re-dials the server
    /// itself, backing off until connected or destroyed.
    fn spawn_fixed_reconnect(self: &Arc<Self>, address: SocketAddr) {
        {
            let mut state = self.state.lock().unwrap();
            if state.reconnect_task {
                return;
            }
            state.reconnect_task = true;
        }
        let Some(context) = self.context() else { return };
        let cancel = context.cancel_token().child_token();
        let channel = self.clone();
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(250);
            loop {
                match channel.connection_state() {
                    ConnectionState::Connected | ConnectionState::Destroyed => break,
                    _ => {}
                }
                channel.acquire_transport(address).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = min(delay * 2, Duration::from_secs(30));
            }
            channel.state.lock().unwrap().reconnect_task = false;
        });
    }

    /// A server answered our search.
    pub(crate) fn search_response(self: &Arc<Self>, _minor_revision: u8, server: SocketAddr) {
        {
            let state = self.state.lock().unwrap();
            if let Some(circuit) = &state.circuit
                && circuit.remote() != server
            {
                let requester = self.requester.clone();
                let text = format!(
                    "More than one channel with name '{}' detected, additional response from: {server}",
                    self.name
                );
                guard_callback("message", move || {
                    requester.message(&text, MessageKind::Warning)
                });
                return;
            }
        }
        let channel = self.clone();
        tokio::spawn(async move {
            channel.acquire_transport(server).await;
        });
    }

    async fn acquire_transport(self: &Arc<Self>, server: SocketAddr) {
        let Some(context) = self.context() else { return };
        match context
            .transports()
            .get_or_connect(&context, server, self.priority)
            .await
        {
            Ok(circuit) => {
                circuit.attach(self);
                self.create_channel_on(&circuit);
            }
            Err(e) => {
                debug!("Could not reach {server} for channel '{}': {e}", self.name);
                self.create_channel_failed();
            }
        }
    }

    /// Submit the create-channel request over a verified circuit.
    fn create_channel_on(self: &Arc<Self>, circuit: &Arc<Circuit>) {
        let old = {
            let mut state = self.state.lock().unwrap();
            if !state.allow_creation {
                return;
            }
            state.allow_creation = false;
            let old = match &state.circuit {
                Some(existing) if !Arc::ptr_eq(existing, circuit) => Some(existing.clone()),
                _ => None,
            };
            state.circuit = Some(circuit.clone());
            state.issue_create_message = true;
            old
        };
        if let Some(old) = old {
            // server-side state on the previous circuit is gone
            self.disconnect_pending_io(false);
            old.detach(self.cid);
        }
        if circuit.enqueue(self.clone()).is_err() {
            self.create_channel_failed();
        }
    }

    /// Creation did not complete; go search again.
    pub(crate) fn create_channel_failed(self: &Arc<Self>) {
        self.initiate_search();
    }

    /// The server acknowledged channel creation (or we are re-validating an
    /// existing SID after the transport came back).
    pub(crate) fn connection_completed(self: &Arc<Self>, sid: u32) {
        let circuit = {
            let mut state = self.state.lock().unwrap();
            if state.connection == ConnectionState::Destroyed {
                return;
            }
            state.sid = sid;
            state.circuit.clone()
        };
        let Some(circuit) = circuit else {
            // circuit vanished while the response was in flight
            self.create_channel_failed();
            return;
        };
        // operations re-init before the connected callback runs, so user
        // callbacks observe a channel whose subscriptions are already queued
        for operation in self.snapshot_requests() {
            operation.resubscribe(&circuit);
        }
        self.set_connection_state(ConnectionState::Connected);
    }

    /// The circuit died.
    pub(crate) fn transport_closed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.circuit = None;
            if state.connection == ConnectionState::Destroyed {
                return;
            }
        }
        self.disconnect_pending_io(false);
        self.set_connection_state(ConnectionState::Disconnected);
        self.initiate_search();
    }

    /// The circuit stopped answering but is being kept for reconnection.
    pub(crate) fn transport_unresponsive(self: &Arc<Self>) {
        if self.connection_state() == ConnectionState::Connected {
            self.disconnect_pending_io(false);
            self.set_connection_state(ConnectionState::Disconnected);
        }
    }

    /// The held circuit came back to life without reconnecting.
    pub(crate) fn transport_responsive(self: &Arc<Self>) {
        let sid = {
            let state = self.state.lock().unwrap();
            if state.connection != ConnectionState::Disconnected || state.circuit.is_none() {
                return;
            }
            state.sid
        };
        self.update_subscriptions();
        self.connection_completed(sid);
    }

    fn set_connection_state(self: &Arc<Self>, new_state: ConnectionState) {
        {
            let mut state = self.state.lock().unwrap();
            if state.connection == new_state {
                return;
            }
            state.connection = new_state;
        }
        let requester = self.requester.clone();
        guard_callback("channel_state_change", move || {
            requester.channel_state_change(new_state)
        });
    }

    /// Report a disconnect (or destruction) to every outstanding operation.
    ///
    /// The operations are snapshotted under the map lock and notified
    /// outside it.
    fn disconnect_pending_io(self: &Arc<Self>, destroyed: bool) {
        self.state.lock().unwrap().need_subscription_update = true;
        for operation in self.snapshot_requests() {
            if destroyed {
                operation.channel_destroyed_notify();
            } else {
                operation.channel_disconnected_notify();
            }
        }
    }

    fn update_subscriptions(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.need_subscription_update {
                return;
            }
            state.need_subscription_update = false;
        }
        for operation in self.snapshot_requests() {
            operation.update_subscription();
        }
    }

    fn snapshot_requests(&self) -> Vec<Arc<Operation>> {
        self.requests.lock().unwrap().values().cloned().collect()
    }

    /// Add an operation to this channel's IOID map. Fails once destroyed.
    pub(crate) fn register_request(&self, ioid: u32, operation: Arc<Operation>) -> bool {
        if self.connection_state() == ConnectionState::Destroyed {
            return false;
        }
        self.requests.lock().unwrap().insert(ioid, operation);
        true
    }

    pub(crate) fn unregister_request(&self, ioid: u32) {
        self.requests.lock().unwrap().remove(&ioid);
    }

    #[cfg(test)]
    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    // Operation factories. Each returns an uninitialized operation that
    // drives its own INIT exchange asynchronously.

    pub fn create_channel_process(
        self: &Arc<Self>,
        requester: Arc<dyn ChannelProcessRequester>,
        pv_request: Option<PvRequest>,
    ) -> ChannelProcess {
        operations::create_process(self, requester, pv_request)
    }

    pub fn create_channel_get(
        self: &Arc<Self>,
        requester: Arc<dyn ChannelGetRequester>,
        pv_request: Option<PvRequest>,
    ) -> ChannelGet {
        operations::create_get(self, requester, pv_request)
    }

    pub fn create_channel_put(
        self: &Arc<Self>,
        requester: Arc<dyn ChannelPutRequester>,
        pv_request: Option<PvRequest>,
    ) -> ChannelPut {
        operations::create_put(self, requester, pv_request)
    }

    pub fn create_channel_put_get(
        self: &Arc<Self>,
        requester: Arc<dyn ChannelPutGetRequester>,
        pv_request: Option<PvRequest>,
    ) -> ChannelPutGet {
        operations::create_put_get(self, requester, pv_request)
    }

    pub fn create_channel_rpc(
        self: &Arc<Self>,
        requester: Arc<dyn ChannelRpcRequester>,
        pv_request: Option<PvRequest>,
    ) -> ChannelRpc {
        operations::create_rpc(self, requester, pv_request)
    }

    pub fn create_channel_array(
        self: &Arc<Self>,
        requester: Arc<dyn ChannelArrayRequester>,
        pv_request: Option<PvRequest>,
    ) -> ChannelArray {
        operations::create_array(self, requester, pv_request)
    }

    pub fn create_monitor(
        self: &Arc<Self>,
        requester: Arc<dyn MonitorRequester>,
        pv_request: Option<PvRequest>,
    ) -> Monitor {
        operations::create_monitor(self, requester, pv_request)
    }

    /// One-shot introspection of a subfield (empty name for the whole
    /// structure).
    pub fn get_field(self: &Arc<Self>, requester: Arc<dyn GetFieldRequester>, sub_field: &str) {
        operations::create_get_field(self, requester, sub_field);
    }
}

impl TransportSender for Channel {
    fn send(&self, control: &mut SendControl<'_>) {
        let (issue_create, sid) = {
            let state = self.state.lock().unwrap();
            (state.issue_create_message, state.sid)
        };
        if issue_create {
            control.start_message(commands::CREATE_CHANNEL, 2 + 4);
            let (buf, _) = control.parts();
            serialize_create_channel(buf, self.cid, &self.name);
        } else {
            control.start_message(commands::DESTROY_CHANNEL, 4 + 4);
            let (buf, _) = control.parts();
            buf.put_u32(sid);
            buf.put_u32(self.cid);
        }
        control.flush(true);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.state.lock().unwrap().connection != ConnectionState::Destroyed {
            warn!("Channel '{}' dropped without destroy", self.name);
        }
    }
}
