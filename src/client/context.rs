//! The client context: top-level owner of the UDP endpoints, the circuit
//! registry, the channel and IOID maps, and the search manager. The
//! [`ChannelProvider`] facade is the application's entry point.

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{
        beacon::BeaconHandler,
        channel::Channel,
        dispatch,
        operations::Operation,
        requesters::{ChannelRequester, guard_callback},
        search::SearchManager,
        transport::TransportRegistry,
    },
    messages::Beacon,
    utils::{
        get_default_beacon_period, get_default_broadcast_port, get_default_connection_timeout,
        get_default_max_search_interval, get_default_receive_buffer_size,
        get_target_broadcast_ips, new_reusable_udp_socket,
    },
    wire::Status,
};

/// Priorities run 0..=99.
pub const PRIORITY_MIN: u16 = 0;
pub const PRIORITY_MAX: u16 = 99;
pub const PRIORITY_DEFAULT: u16 = 0;

const MAX_CHANNEL_NAME_LENGTH: usize = 500;

/// Client configuration, environment-sourced by default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seconds without a beacon before a connected circuit is probed; also
    /// bounds connection and validation handshakes.
    pub connection_timeout: Duration,
    /// Expected period between two beacons from a healthy server.
    pub beacon_period: Duration,
    /// Port beacons and searches are broadcast on.
    pub broadcast_port: u16,
    /// Receive buffer size advertised during connection validation.
    pub receive_buffer_size: usize,
    /// Ceiling for the search retry back-off.
    pub max_search_interval: Duration,
    /// Explicit broadcast address list; `None` discovers interface
    /// broadcasts and honors `EPICS4_CA_ADDR_LIST`.
    pub broadcast_addresses: Option<Vec<SocketAddr>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connection_timeout: Duration::from_secs_f32(get_default_connection_timeout()),
            beacon_period: Duration::from_secs_f32(get_default_beacon_period()),
            broadcast_port: get_default_broadcast_port(),
            receive_buffer_size: get_default_receive_buffer_size(),
            max_search_interval: Duration::from_secs_f32(get_default_max_search_interval()),
            broadcast_addresses: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> ClientConfig {
        ClientConfig::default()
    }

    fn resolve_broadcast_addresses(&self) -> Vec<SocketAddr> {
        match &self.broadcast_addresses {
            Some(list) => list.clone(),
            None => get_target_broadcast_ips(self.broadcast_port),
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("empty channel name")]
    EmptyChannelName,
    #[error("channel name longer than {MAX_CHANNEL_NAME_LENGTH} bytes")]
    ChannelNameTooLong,
    #[error("priority {0} out of bounds (0..=99)")]
    PriorityOutOfRange(u16),
    #[error("context destroyed")]
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    NotInitialized,
    Initialized,
    Destroyed,
}

struct ChannelRegistry {
    by_cid: HashMap<u32, Arc<Channel>>,
    last_cid: u32,
}

struct PendingRegistry {
    by_ioid: HashMap<u32, Arc<Operation>>,
    last_ioid: u32,
}

/// Wrapping id allocation that skips live entries (and the 0 sentinel).
fn allocate_id<V>(last: &mut u32, occupied: &HashMap<u32, V>) -> u32 {
    loop {
        *last = last.wrapping_add(1);
        if *last != 0 && !occupied.contains_key(last) {
            return *last;
        }
    }
}

/// Top-level client state. One per process is typical, more are fine.
pub struct ClientContext {
    config: ClientConfig,
    channels: Mutex<ChannelRegistry>,
    pending: Mutex<PendingRegistry>,
    beacons: Mutex<HashMap<SocketAddr, BeaconHandler>>,
    transports: TransportRegistry,
    search: SearchManager,
    state: Mutex<ContextState>,
    cancel: CancellationToken,
}

impl ClientContext {
    /// Create a context from the environment configuration.
    pub async fn new() -> Result<Arc<ClientContext>, ContextError> {
        ClientContext::with_config(ClientConfig::from_env()).await
    }

    /// Create a context. Socket creation or bind failures surface here and
    /// leave nothing running.
    pub async fn with_config(config: ClientConfig) -> Result<Arc<ClientContext>, ContextError> {
        let cancel = CancellationToken::new();
        // broadcast endpoint: beacons (and searches from other clients)
        let broadcast_socket =
            new_reusable_udp_socket(("0.0.0.0", config.broadcast_port))?;
        let search = SearchManager::start(
            config.resolve_broadcast_addresses(),
            config.max_search_interval,
            cancel.child_token(),
        )
        .await?;

        let context = Arc::new(ClientContext {
            config,
            channels: Mutex::new(ChannelRegistry {
                by_cid: HashMap::new(),
                last_cid: 0,
            }),
            pending: Mutex::new(PendingRegistry {
                by_ioid: HashMap::new(),
                last_ioid: 0,
            }),
            beacons: Mutex::new(HashMap::new()),
            transports: TransportRegistry::new(),
            search,
            state: Mutex::new(ContextState::Initialized),
            cancel,
        });

        // beacon watcher on the broadcast endpoint
        let weak = Arc::downgrade(&context);
        let watch_cancel = context.cancel.child_token();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 0xFFFF];
            loop {
                select! {
                    _ = watch_cancel.cancelled() => break,
                    result = broadcast_socket.recv_from(&mut buf) => match result {
                        Ok((size, origin)) => {
                            let Some(context) = weak.upgrade() else { break };
                            dispatch::dispatch_datagram(&context, &buf[..size], origin);
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("Got unresumable error watching broadcasts: {e:?}");
                            break;
                        }
                    }
                }
            }
        });

        Ok(context)
    }

    pub fn provider(self: &Arc<Self>) -> ChannelProvider {
        ChannelProvider {
            context: self.clone(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub(crate) fn search(&self) -> &SearchManager {
        &self.search
    }

    pub(crate) fn get_channel(&self, cid: u32) -> Option<Arc<Channel>> {
        self.channels.lock().unwrap().by_cid.get(&cid).cloned()
    }

    pub(crate) fn unregister_channel(&self, cid: u32) {
        self.channels.lock().unwrap().by_cid.remove(&cid);
    }

    /// Allocate an IOID and register the operation built for it, atomically
    /// with respect to other allocations.
    pub(crate) fn register_response_request(
        &self,
        build: impl FnOnce(u32) -> Arc<Operation>,
    ) -> Arc<Operation> {
        let mut pending = self.pending.lock().unwrap();
        let PendingRegistry { last_ioid, by_ioid } = &mut *pending;
        let ioid = allocate_id(last_ioid, by_ioid);
        let operation = build(ioid);
        pending.by_ioid.insert(ioid, operation.clone());
        operation
    }

    pub(crate) fn unregister_response_request(&self, ioid: u32) {
        self.pending.lock().unwrap().by_ioid.remove(&ioid);
    }

    /// Look up an operation by IOID. The returned clone keeps the operation
    /// alive through response delivery.
    pub(crate) fn get_response_request(&self, ioid: u32) -> Option<Arc<Operation>> {
        self.pending.lock().unwrap().by_ioid.get(&ioid).cloned()
    }

    /// Record a beacon: update the per-server handler, count it as liveness
    /// for that server's circuits, and boost searches on anomaly.
    pub(crate) fn beacon_notify(&self, origin: SocketAddr, beacon: &Beacon) {
        let server = beacon.server_endpoint(origin);
        let anomaly = {
            let mut handlers = self.beacons.lock().unwrap();
            handlers
                .entry(server)
                .or_insert_with(|| BeaconHandler::new(server))
                .beacon_notify(beacon)
        };
        self.transports.alive_notify(server);
        if anomaly {
            self.search.beacon_anomaly();
        }
    }

    /// Destroy the context: every channel is destroyed (terminating its
    /// operations with `channel destroyed`), circuits closed, tasks stopped.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ContextState::Destroyed {
                return;
            }
            *state = ContextState::Destroyed;
        }
        debug!("Destroying client context");
        let channels: Vec<Arc<Channel>> = self
            .channels
            .lock()
            .unwrap()
            .by_cid
            .values()
            .cloned()
            .collect();
        for channel in channels {
            channel.destroy();
        }
        self.transports.close_all();
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().by_ioid.len()
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Provider facade: how applications create channels.
#[derive(Clone)]
pub struct ChannelProvider {
    context: Arc<ClientContext>,
}

impl ChannelProvider {
    pub fn provider_name(&self) -> &'static str {
        "pva"
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    /// Create a channel and start connecting it. A fixed `address` bypasses
    /// the UDP search entirely.
    pub fn create_channel(
        &self,
        name: &str,
        requester: Arc<dyn ChannelRequester>,
        priority: u16,
        address: Option<SocketAddr>,
    ) -> Result<Arc<Channel>, ContextError> {
        if self.context.state() != ContextState::Initialized {
            return Err(ContextError::Destroyed);
        }
        if name.is_empty() {
            return Err(ContextError::EmptyChannelName);
        }
        if name.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(ContextError::ChannelNameTooLong);
        }
        if priority > PRIORITY_MAX {
            return Err(ContextError::PriorityOutOfRange(priority));
        }

        let channel = {
            let mut channels = self.context.channels.lock().unwrap();
            let ChannelRegistry { last_cid, by_cid } = &mut *channels;
            let cid = allocate_id(last_cid, by_cid);
            let channel = Channel::new(
                &self.context,
                cid,
                name.to_string(),
                requester.clone(),
                priority,
                address,
            );
            channels.by_cid.insert(cid, channel.clone());
            channel
        };
        channel.initiate_search();
        guard_callback("channel_created", move || {
            requester.channel_created(Status::ok())
        });
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_wraps_and_skips_live_entries() {
        let mut occupied: HashMap<u32, ()> = HashMap::new();
        let mut last = 0;
        assert_eq!(allocate_id(&mut last, &occupied), 1);
        occupied.insert(2, ());
        assert_eq!(allocate_id(&mut last, &occupied), 3);

        // wraps past the 0 sentinel
        let mut last = u32::MAX - 1;
        assert_eq!(allocate_id(&mut last, &occupied), u32::MAX);
        assert_eq!(allocate_id(&mut last, &occupied), 1);

        // skips a run of live entries near full wrap
        let mut occupied: HashMap<u32, ()> = HashMap::new();
        for id in [u32::MAX, 1, 2, 3] {
            occupied.insert(id, ());
        }
        let mut last = u32::MAX - 1;
        assert_eq!(allocate_id(&mut last, &occupied), 4);
    }

    #[tokio::test]
    async fn context_initializes_and_destroys() {
        let config = ClientConfig {
            broadcast_port: 0,
            broadcast_addresses: Some(Vec::new()),
            ..ClientConfig::default()
        };
        let context = ClientContext::with_config(config).await.unwrap();
        assert_eq!(context.state(), ContextState::Initialized);
        context.destroy();
        assert_eq!(context.state(), ContextState::Destroyed);
        // idempotent
        context.destroy();
    }

    #[tokio::test]
    async fn create_channel_validates_arguments() {
        use crate::client::requesters::{ConnectionState, Requester};

        struct Quiet;
        impl Requester for Quiet {}
        impl ChannelRequester for Quiet {
            fn channel_created(&self, _status: Status) {}
            fn channel_state_change(&self, _state: ConnectionState) {}
        }

        let config = ClientConfig {
            broadcast_port: 0,
            broadcast_addresses: Some(Vec::new()),
            ..ClientConfig::default()
        };
        let context = ClientContext::with_config(config).await.unwrap();
        let provider = context.provider();

        assert!(matches!(
            provider.create_channel("", Arc::new(Quiet), 0, None),
            Err(ContextError::EmptyChannelName)
        ));
        assert!(matches!(
            provider.create_channel("ok", Arc::new(Quiet), 100, None),
            Err(ContextError::PriorityOutOfRange(100))
        ));
        let long = "x".repeat(501);
        assert!(matches!(
            provider.create_channel(&long, Arc::new(Quiet), 0, None),
            Err(ContextError::ChannelNameTooLong)
        ));

        let channel = provider
            .create_channel("x:counter", Arc::new(Quiet), 0, None)
            .unwrap();
        assert_eq!(channel.name(), "x:counter");
        assert_eq!(channel.connection_state(), ConnectionState::NeverConnected);

        context.destroy();
        assert!(matches!(
            provider.create_channel("late", Arc::new(Quiet), 0, None),
            Err(ContextError::Destroyed)
        ));
    }
}
