//! The TCP virtual circuit: one connection per `(server, priority)` shared
//! by every channel talking to that server.
//!
//! Each circuit runs three tasks: a receive loop that reassembles segmented
//! frames and hands them to the dispatch table, a send pump that drains an
//! ordered queue of [`TransportSender`] items into framed writes, and a
//! watchdog that probes with an echo frame when neither beacons nor traffic
//! have been seen for the connection timeout.
//!
//! No data may be sent before the connection-validation handshake completes;
//! [`Circuit::connect`] only returns a verified circuit.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::{
        channel::Channel,
        context::ClientContext,
        dispatch,
        requesters::statuses,
    },
    data::IntrospectionRegistry,
    messages::Validation,
    wire::{self, FrameHeader, Segment, Status, commands, split_into_frames},
};

/// An item on a circuit's send queue. When the pump drains the item it is
/// handed a [`SendControl`] to frame whatever it has to say.
pub(crate) trait TransportSender: Send + Sync {
    fn send(&self, control: &mut SendControl<'_>);
}

/// Framing control handed to a [`TransportSender`].
///
/// A sender starts a message with [`SendControl::start_message`], writes the
/// body through [`SendControl::parts`], and may request an immediate flush.
/// Bodies larger than the peer's receive buffer are segmented transparently
/// when the message is finalized.
pub(crate) struct SendControl<'a> {
    out: &'a mut BytesMut,
    registry: &'a mut IntrospectionRegistry,
    body: BytesMut,
    command: Option<u8>,
    segment_limit: usize,
}

impl<'a> SendControl<'a> {
    pub fn new(
        out: &'a mut BytesMut,
        registry: &'a mut IntrospectionRegistry,
        segment_limit: usize,
    ) -> SendControl<'a> {
        SendControl {
            out,
            registry,
            body: BytesMut::new(),
            command: None,
            segment_limit,
        }
    }

    pub fn start_message(&mut self, command: u8, _min_body_bytes: usize) {
        self.finalize_message();
        self.command = Some(command);
    }

    /// The body buffer and the circuit's introspection registry.
    pub fn parts(&mut self) -> (&mut BytesMut, &mut IntrospectionRegistry) {
        (&mut self.body, self.registry)
    }

    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// The pump writes the whole batch after draining it, so this only has
    /// to close out the current message.
    pub fn flush(&mut self, _immediate: bool) {
        self.finalize_message();
    }

    fn finalize_message(&mut self) {
        if let Some(command) = self.command.take() {
            split_into_frames(self.out, command, &self.body, self.segment_limit);
            self.body.clear();
        }
    }

    pub fn finish(mut self) {
        self.finalize_message();
    }
}

struct CircuitState {
    closed: bool,
    remote_buffer_size: usize,
    remote_socket_buffer_size: usize,
    remote_minor_revision: u8,
}

/// A TCP virtual circuit to one server at one priority.
pub(crate) struct Circuit {
    remote: SocketAddr,
    priority: u16,
    context: Weak<ClientContext>,
    send_tx: mpsc::UnboundedSender<Arc<dyn TransportSender>>,
    registry: Mutex<IntrospectionRegistry>,
    clients: Mutex<HashMap<u32, Weak<Channel>>>,
    state: Mutex<CircuitState>,
    last_alive: Mutex<Instant>,
    verified_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    connection_timeout: Duration,
    receive_buffer_size: usize,
}

impl Circuit {
    /// Open, validate and start a circuit. Returns only once the
    /// connection-validation handshake has completed; a handshake that does
    /// not complete within the connection timeout closes the socket.
    pub(crate) async fn connect(
        context: &Arc<ClientContext>,
        remote: SocketAddr,
        priority: u16,
    ) -> io::Result<Arc<Circuit>> {
        let connection_timeout = context.config().connection_timeout;
        let receive_buffer_size = context.config().receive_buffer_size;
        let stream = tokio::time::timeout(connection_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| io::Error::other("connect timed out"))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        let circuit = Arc::new(Circuit {
            remote,
            priority,
            context: Arc::downgrade(context),
            send_tx,
            registry: Mutex::new(IntrospectionRegistry::new()),
            clients: Mutex::new(HashMap::new()),
            state: Mutex::new(CircuitState {
                closed: false,
                remote_buffer_size: wire::MAX_TCP_RECV,
                remote_socket_buffer_size: wire::MAX_TCP_RECV,
                remote_minor_revision: 0,
            }),
            last_alive: Mutex::new(Instant::now()),
            verified_tx: watch::Sender::new(false),
            cancel: context.cancel_token().child_token(),
            connection_timeout,
            receive_buffer_size,
        });

        tokio::spawn(receive_loop(circuit.clone(), read_half));
        tokio::spawn(send_pump(circuit.clone(), write_half, send_rx));
        tokio::spawn(watchdog(circuit.clone()));

        let mut verified = circuit.verified_tx.subscribe();
        let cancel = circuit.cancel.clone();
        let wait = async {
            loop {
                if *verified.borrow_and_update() {
                    return true;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    changed = verified.changed() => {
                        if changed.is_err() {
                            return false;
                        }
                    }
                }
            }
        };
        match tokio::time::timeout(connection_timeout, wait).await {
            Ok(true) => Ok(circuit),
            _ => {
                debug!("Connection validation with {remote} did not complete");
                circuit.close();
                Err(io::Error::other("connection validation timed out"))
            }
        }
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn registry(&self) -> &Mutex<IntrospectionRegistry> {
        &self.registry
    }

    fn segment_limit(&self) -> usize {
        self.state.lock().unwrap().remote_buffer_size.max(1024)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Append a sender to the ordered send queue.
    pub(crate) fn enqueue(&self, item: Arc<dyn TransportSender>) -> Result<(), Status> {
        if self.is_closed() {
            return Err(statuses::channel_not_connected());
        }
        self.send_tx
            .send(item)
            .map_err(|_| statuses::channel_not_connected())
    }

    /// Record that the server showed signs of life (TCP traffic or beacon).
    pub(crate) fn alive_notify(&self) {
        *self.last_alive.lock().unwrap() = Instant::now();
    }

    pub(crate) fn attach(&self, channel: &Arc<Channel>) {
        self.clients
            .lock()
            .unwrap()
            .insert(channel.cid(), Arc::downgrade(channel));
    }

    /// Detach a channel; the last detach closes the circuit.
    pub(crate) fn detach(self: &Arc<Self>, cid: u32) {
        let empty = {
            let mut clients = self.clients.lock().unwrap();
            clients.remove(&cid);
            clients.is_empty()
        };
        if empty {
            debug!("Last client detached from {}, closing circuit", self.remote);
            self.close();
        }
    }

    fn snapshot_clients(&self) -> Vec<Arc<Channel>> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Server-side validation frame arrived: adopt the advertised buffer
    /// sizes, answer with ours, and mark the circuit verified.
    pub(crate) fn handle_validation(self: &Arc<Self>, header: &FrameHeader, validation: Validation) {
        {
            let mut state = self.state.lock().unwrap();
            if validation.receive_buffer_size > 0 {
                state.remote_buffer_size = validation.receive_buffer_size as usize;
            }
            if validation.socket_buffer_size > 0 {
                state.remote_socket_buffer_size = validation.socket_buffer_size as usize;
            }
            state.remote_minor_revision = header.minor_revision();
        }
        let reply = Arc::new(ValidationReply {
            receive_buffer_size: self.receive_buffer_size as i32,
        });
        if self.enqueue(reply).is_err() {
            return;
        }
        self.verified_tx.send_replace(true);
        let state = self.state.lock().unwrap();
        debug!(
            "Circuit to {} verified: minor revision {}, buffers {}/{}",
            self.remote,
            state.remote_minor_revision,
            state.remote_buffer_size,
            state.remote_socket_buffer_size
        );
    }

    fn mark_unresponsive(&self) {
        for channel in self.snapshot_clients() {
            channel.transport_unresponsive();
        }
    }

    /// Tear the circuit down and notify every attached channel.
    pub(crate) fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        debug!("Closing circuit to {}", self.remote);
        self.cancel.cancel();
        if let Some(context) = self.context.upgrade() {
            context.transports().remove_circuit(self);
        }
        let clients: Vec<Arc<Channel>> = {
            let mut clients = self.clients.lock().unwrap();
            let out = clients.values().filter_map(Weak::upgrade).collect();
            clients.clear();
            out
        };
        for channel in clients {
            channel.transport_closed();
        }
    }
}

/// The client's half of the validation handshake.
struct ValidationReply {
    receive_buffer_size: i32,
}

impl TransportSender for ValidationReply {
    fn send(&self, control: &mut SendControl<'_>) {
        control.start_message(commands::CONNECTION_VALIDATION, 8);
        let (buf, _) = control.parts();
        Validation {
            receive_buffer_size: self.receive_buffer_size,
            socket_buffer_size: self.receive_buffer_size,
        }
        .serialize(buf);
        control.flush(true);
    }
}

/// State-of-health probe sent when beacons go quiet.
struct EchoProbe;

impl TransportSender for EchoProbe {
    fn send(&self, control: &mut SendControl<'_>) {
        control.start_message(commands::ECHO, 0);
        control.flush(true);
    }
}

async fn send_pump(
    circuit: Arc<Circuit>,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Arc<dyn TransportSender>>,
) {
    let mut out = BytesMut::new();
    loop {
        let mut batch: Vec<Arc<dyn TransportSender>> = Vec::new();
        tokio::select! {
            _ = circuit.cancel.cancelled() => break,
            count = queue.recv_many(&mut batch, 32) => {
                if count == 0 {
                    break;
                }
            }
        }
        {
            let mut registry = circuit.registry.lock().unwrap();
            let limit = circuit.segment_limit();
            for item in &batch {
                let mut control = SendControl::new(&mut out, &mut registry, limit);
                item.send(&mut control);
                control.finish();
            }
        }
        if out.is_empty() {
            continue;
        }
        if let Err(e) = writer.write_all(&out).await {
            debug!("Send pump for {} stopping: {e}", circuit.remote);
            break;
        }
        out.clear();
    }
    circuit.close();
}

async fn receive_loop(circuit: Arc<Circuit>, mut reader: OwnedReadHalf) {
    let mut header_buf = [0u8; FrameHeader::LEN];
    // command and accumulated body of an in-progress segmented message
    let mut segments: Option<(u8, Vec<u8>)> = None;
    let frame_cap = circuit.receive_buffer_size.max(1 << 20);
    loop {
        let read = tokio::select! {
            _ = circuit.cancel.cancelled() => break,
            r = reader.read_exact(&mut header_buf) => r,
        };
        match read {
            Ok(_) => {}
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!("Receive loop for {} stopping: {e}", circuit.remote);
                }
                break;
            }
        }
        let Ok((_, header)) = FrameHeader::parse(&header_buf) else {
            warn!("Bad frame header from {}, closing circuit", circuit.remote);
            break;
        };
        if header.payload_size as usize > frame_cap {
            warn!(
                "Oversized frame ({} bytes) from {}, closing circuit",
                header.payload_size, circuit.remote
            );
            break;
        }
        let mut payload = vec![0u8; header.payload_size as usize];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        circuit.alive_notify();

        let Some(context) = circuit.context.upgrade() else {
            break;
        };
        match header.segment() {
            Segment::None => dispatch::handle_frame(&context, &circuit, &header, &payload),
            Segment::First => segments = Some((header.command, payload)),
            Segment::Middle => match &mut segments {
                Some((command, accumulated)) if *command == header.command => {
                    accumulated.extend_from_slice(&payload);
                }
                _ => {
                    warn!("Orphan middle segment from {}", circuit.remote);
                    segments = None;
                }
            },
            Segment::Last => match segments.take() {
                Some((command, mut accumulated)) if command == header.command => {
                    accumulated.extend_from_slice(&payload);
                    let whole = FrameHeader {
                        version: header.version,
                        flags: header.flags & !wire::flags::SEGMENT_MASK,
                        command,
                        payload_size: accumulated.len() as u32,
                    };
                    dispatch::handle_frame(&context, &circuit, &whole, &accumulated);
                }
                _ => warn!("Orphan last segment from {}", circuit.remote),
            },
        }
    }
    circuit.close();
}

/// Probe the server with an echo when nothing has been heard for the
/// connection timeout. An unanswered probe marks the circuit unresponsive
/// (channels disconnect but the circuit is held for recovery); continued
/// silence closes it, and resumed traffic revives the held channels.
async fn watchdog(circuit: Arc<Circuit>) {
    let timeout = circuit.connection_timeout;
    let mut probe_outstanding = false;
    let mut unresponsive = false;
    loop {
        tokio::select! {
            _ = circuit.cancel.cancelled() => return,
            _ = tokio::time::sleep(timeout / 2) => {}
        }
        let idle = circuit.last_alive.lock().unwrap().elapsed();
        if idle <= timeout {
            probe_outstanding = false;
            if unresponsive {
                unresponsive = false;
                debug!("Server {} responsive again", circuit.remote);
                for channel in circuit.snapshot_clients() {
                    channel.transport_responsive();
                }
            }
            continue;
        }
        if !probe_outstanding {
            trace!("Probing quiet server {}", circuit.remote);
            let _ = circuit.enqueue(Arc::new(EchoProbe));
            probe_outstanding = true;
        } else if !unresponsive {
            warn!(
                "Server {} unresponsive for {:.1}s, disconnecting its channels",
                circuit.remote,
                idle.as_secs_f32()
            );
            circuit.mark_unresponsive();
            unresponsive = true;
        } else {
            warn!("Giving up on unresponsive server {}", circuit.remote);
            circuit.close();
            return;
        }
    }
}

/// Shares circuits between channels by `(server address, priority)`.
pub(crate) struct TransportRegistry {
    circuits: Mutex<HashMap<(SocketAddr, u16), Arc<Circuit>>>,
    // serializes concurrent connection attempts to avoid duplicate circuits
    connect_gate: tokio::sync::Mutex<()>,
}

impl TransportRegistry {
    pub fn new() -> TransportRegistry {
        TransportRegistry {
            circuits: Mutex::new(HashMap::new()),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lookup(&self, remote: SocketAddr, priority: u16) -> Option<Arc<Circuit>> {
        self.circuits
            .lock()
            .unwrap()
            .get(&(remote, priority))
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Get the shared circuit for an endpoint, connecting if necessary.
    pub async fn get_or_connect(
        &self,
        context: &Arc<ClientContext>,
        remote: SocketAddr,
        priority: u16,
    ) -> io::Result<Arc<Circuit>> {
        if let Some(circuit) = self.lookup(remote, priority) {
            return Ok(circuit);
        }
        let _gate = self.connect_gate.lock().await;
        if let Some(circuit) = self.lookup(remote, priority) {
            return Ok(circuit);
        }
        let circuit = Circuit::connect(context, remote, priority).await?;
        self.circuits
            .lock()
            .unwrap()
            .insert((remote, priority), circuit.clone());
        Ok(circuit)
    }

    pub fn remove_circuit(&self, circuit: &Arc<Circuit>) {
        let mut map = self.circuits.lock().unwrap();
        let key = (circuit.remote, circuit.priority);
        if map.get(&key).is_some_and(|c| Arc::ptr_eq(c, circuit)) {
            map.remove(&key);
        }
    }

    /// Beacons count as liveness for every circuit to that server.
    pub fn alive_notify(&self, server: SocketAddr) {
        for ((addr, _), circuit) in self.circuits.lock().unwrap().iter() {
            if *addr == server {
                circuit.alive_notify();
            }
        }
    }

    pub fn close_all(&self) {
        let circuits: Vec<Arc<Circuit>> = self.circuits.lock().unwrap().values().cloned().collect();
        for circuit in circuits {
            circuit.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PayloadReader;
    use bytes::BufMut;

    #[test]
    fn send_control_frames_messages_in_order() {
        let mut out = BytesMut::new();
        let mut registry = IntrospectionRegistry::new();
        let mut control = SendControl::new(&mut out, &mut registry, 1024);
        control.start_message(commands::ECHO, 0);
        control.start_message(commands::CANCEL_REQUEST, 8);
        let (buf, _) = control.parts();
        buf.put_u32(7);
        buf.put_u32(42);
        control.finish();

        let (rest, first) = FrameHeader::parse(&out).unwrap();
        assert_eq!(first.command, commands::ECHO);
        assert_eq!(first.payload_size, 0);
        let (rest, second) = FrameHeader::parse(rest).unwrap();
        assert_eq!(second.command, commands::CANCEL_REQUEST);
        assert_eq!(second.payload_size, 8);
        let mut reader = PayloadReader::for_frame(rest, &second);
        assert_eq!(reader.u32().unwrap(), 7);
        assert_eq!(reader.u32().unwrap(), 42);
    }

    #[test]
    fn send_control_segments_large_bodies() {
        let mut out = BytesMut::new();
        let mut registry = IntrospectionRegistry::new();
        let mut control = SendControl::new(&mut out, &mut registry, 16);
        control.start_message(commands::MONITOR, 0);
        control.buffer().put_slice(&[7u8; 40]);
        control.finish();

        let (rest, first) = FrameHeader::parse(&out).unwrap();
        assert_eq!(first.segment(), Segment::First);
        assert_eq!(first.payload_size, 16);
        let rest = &rest[16..];
        let (rest, middle) = FrameHeader::parse(rest).unwrap();
        assert_eq!(middle.segment(), Segment::Middle);
        let rest = &rest[middle.payload_size as usize..];
        let (_, last) = FrameHeader::parse(rest).unwrap();
        assert_eq!(last.segment(), Segment::Last);
    }
}
