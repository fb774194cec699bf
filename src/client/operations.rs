//! Operation state machines: one per outstanding request.
//!
//! Every request kind shares the same skeleton: it registers with the
//! context and its channel under a fresh IOID, issues an INIT exchange over
//! the circuit, and from then on arbitrates at most one in-flight request at
//! a time through [`RequestState::start_request`]. The kinds differ only in
//! their command byte, request payloads and completion callbacks, so they
//! are the cases of one [`OperationKind`] variant rather than a type
//! hierarchy.
//!
//! Monitors additionally carry a delivery strategy selected by the
//! `record.queueSize` option of their pvRequest: notify-only (-1), every
//! update (0), or a single coalescing slot (the default).

use std::sync::{Arc, Mutex};

use bytes::BufMut;
use tracing::warn;

use crate::{
    client::{
        channel::Channel,
        requesters::{
            ChannelArrayRequester, ChannelGetRequester, ChannelProcessRequester,
            ChannelPutGetRequester, ChannelPutRequester, ChannelRpcRequester, GetFieldRequester,
            MonitorRequester, Requester, SharedArray, SharedValue, ValueSlot, guard_callback,
            statuses,
        },
        transport::{Circuit, SendControl, TransportSender},
    },
    data::{FieldDesc, PvRequest, PvStructure, PvValue, compress_bitset},
    messages::MessageKind,
    wire::{BitSet, FrameHeader, PayloadReader, Status, WireError, commands, qos, write_size},
};

pub(crate) const NULL_REQUEST: i32 = -1;
pub(crate) const PURE_DESTROY_REQUEST: i32 = -2;

/// Shared request bookkeeping: the pending-request slot, lifecycle flags,
/// and whether a sent request still awaits its response.
#[derive(Debug)]
pub(crate) struct RequestState {
    pending: i32,
    initialized: bool,
    destroyed: bool,
    awaiting_response: bool,
}

impl RequestState {
    fn new() -> RequestState {
        RequestState {
            pending: NULL_REQUEST,
            initialized: false,
            destroyed: false,
            awaiting_response: false,
        }
    }

    /// Claim the pending-request slot. Only `PURE_DESTROY_REQUEST` may
    /// preempt an occupied slot.
    pub(crate) fn start_request(&mut self, qos: i32) -> bool {
        if self.pending != NULL_REQUEST && qos != PURE_DESTROY_REQUEST {
            return false;
        }
        self.pending = qos;
        true
    }

    pub(crate) fn stop_request(&mut self) {
        self.pending = NULL_REQUEST;
    }
}

struct ProcessOp {
    requester: Arc<dyn ChannelProcessRequester>,
    pv_request: Option<PvRequest>,
}

struct GetOp {
    requester: Arc<dyn ChannelGetRequester>,
    pv_request: PvRequest,
    data: Mutex<Option<SharedValue>>,
}

struct PutOp {
    requester: Arc<dyn ChannelPutRequester>,
    pv_request: PvRequest,
    data: Mutex<Option<SharedValue>>,
}

struct PutGetOp {
    requester: Arc<dyn ChannelPutGetRequester>,
    pv_request: PvRequest,
    put_data: Mutex<Option<SharedValue>>,
    get_data: Mutex<Option<SharedValue>>,
}

struct RpcOp {
    requester: Arc<dyn ChannelRpcRequester>,
    pv_request: PvRequest,
    argument: Mutex<Option<SharedValue>>,
}

#[derive(Debug, Clone, Copy)]
struct ArrayParams {
    offset: i32,
    count: i32,
    length: i32,
    capacity: i32,
    /// Capacity last asserted through `set_length`, used to bounds-check puts.
    known_capacity: Option<usize>,
}

struct ArrayOp {
    requester: Arc<dyn ChannelArrayRequester>,
    pv_request: PvRequest,
    desc: Mutex<Option<Arc<FieldDesc>>>,
    data: Mutex<Option<SharedArray>>,
    params: Mutex<ArrayParams>,
}

struct MonitorOp {
    requester: Arc<dyn MonitorRequester>,
    pv_request: Option<PvRequest>,
    queue: Mutex<MonitorQueue>,
    started: Mutex<bool>,
}

struct GetFieldOp {
    requester: Arc<dyn GetFieldRequester>,
    sub_field: String,
}

enum OperationKind {
    Process(ProcessOp),
    Get(GetOp),
    Put(PutOp),
    PutGet(PutGetOp),
    Rpc(RpcOp),
    Array(ArrayOp),
    Monitor(MonitorOp),
    GetField(GetFieldOp),
}

impl OperationKind {
    fn command(&self) -> u8 {
        match self {
            OperationKind::Process(_) => commands::PROCESS,
            OperationKind::Get(_) => commands::GET,
            OperationKind::Put(_) => commands::PUT,
            OperationKind::PutGet(_) => commands::PUT_GET,
            OperationKind::Rpc(_) => commands::RPC,
            OperationKind::Array(_) => commands::ARRAY,
            OperationKind::Monitor(_) => commands::MONITOR,
            OperationKind::GetField(_) => commands::GET_FIELD,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            OperationKind::Process(_) => "process",
            OperationKind::Get(_) => "get",
            OperationKind::Put(_) => "put",
            OperationKind::PutGet(_) => "put-get",
            OperationKind::Rpc(_) => "rpc",
            OperationKind::Array(_) => "array",
            OperationKind::Monitor(_) => "monitor",
            OperationKind::GetField(_) => "get-field",
        }
    }

    fn requester(&self) -> &dyn Requester {
        match self {
            OperationKind::Process(op) => op.requester.as_ref(),
            OperationKind::Get(op) => op.requester.as_ref(),
            OperationKind::Put(op) => op.requester.as_ref(),
            OperationKind::PutGet(op) => op.requester.as_ref(),
            OperationKind::Rpc(op) => op.requester.as_ref(),
            OperationKind::Array(op) => op.requester.as_ref(),
            OperationKind::Monitor(op) => op.requester.as_ref(),
            OperationKind::GetField(op) => op.requester.as_ref(),
        }
    }
}

/// One outstanding request, shared between the channel map, the context
/// IOID map, the circuit send queue and the user-facing handle.
pub(crate) struct Operation {
    ioid: u32,
    channel: Arc<Channel>,
    state: Mutex<RequestState>,
    kind: OperationKind,
}

impl Operation {
    /// Register a new operation with the context and channel, then kick off
    /// its INIT exchange (or report why it cannot).
    fn register(channel: &Arc<Channel>, kind: OperationKind) -> Arc<Operation> {
        let Some(context) = channel.context() else {
            let operation = Arc::new(Operation {
                ioid: 0,
                channel: channel.clone(),
                state: Mutex::new(RequestState::new()),
                kind,
            });
            operation.state.lock().unwrap().destroyed = true;
            operation.connect_failed(statuses::channel_not_connected());
            return operation;
        };
        let channel_arc = channel.clone();
        let operation = context.register_response_request(move |ioid| {
            Arc::new(Operation {
                ioid,
                channel: channel_arc,
                state: Mutex::new(RequestState::new()),
                kind,
            })
        });
        if !channel.register_request(operation.ioid, operation.clone()) {
            context.unregister_response_request(operation.ioid);
            operation.state.lock().unwrap().destroyed = true;
            operation.connect_failed(statuses::channel_destroyed());
            return operation;
        }
        match channel.checked_transport() {
            Ok(circuit) => operation.resubscribe(&circuit),
            Err(_) => operation.connect_failed(statuses::channel_not_connected()),
        }
        operation
    }

    /// An operation that never registered (bad arguments); all methods
    /// report `request destroyed`.
    fn dead(channel: &Arc<Channel>, kind: OperationKind) -> Arc<Operation> {
        let operation = Arc::new(Operation {
            ioid: 0,
            channel: channel.clone(),
            state: Mutex::new(RequestState::new()),
            kind,
        });
        operation.state.lock().unwrap().destroyed = true;
        operation
    }

    fn start_request(&self, qos_code: i32) -> bool {
        self.state.lock().unwrap().start_request(qos_code)
    }

    fn stop_request(&self) {
        self.state.lock().unwrap().stop_request();
    }

    /// Ready for a user-issued request?
    fn check_ready(&self) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(statuses::request_destroyed());
        }
        if !state.initialized {
            return Err(statuses::not_initialized());
        }
        Ok(())
    }

    /// Common issue path: arbitration, transport lookup, enqueue. `fail` is
    /// invoked synchronously (guarded) with the reason when the request
    /// cannot be issued.
    fn issue(self: &Arc<Self>, qos_code: i32, fail: impl FnOnce(Status)) {
        if let Err(status) = self.check_ready() {
            fail(status);
            return;
        }
        if !self.start_request(qos_code) {
            fail(statuses::other_request_pending());
            return;
        }
        let circuit = match self.channel.checked_transport() {
            Ok(circuit) => circuit,
            Err(_) => {
                self.stop_request();
                fail(statuses::channel_not_connected());
                return;
            }
        };
        if circuit.enqueue(self.clone()).is_err() {
            self.stop_request();
            fail(statuses::channel_not_connected());
        }
    }

    /// Re-enter the INIT exchange on a (new) circuit.
    pub(crate) fn resubscribe(self: &Arc<Self>, circuit: &Arc<Circuit>) {
        if matches!(self.kind, OperationKind::GetField(_)) {
            // one-shot introspection does not survive a reconnect
            return;
        }
        if self.state.lock().unwrap().destroyed {
            return;
        }
        self.start_request(qos::INIT as i32);
        let _ = circuit.enqueue(self.clone());
    }

    /// Second pass after a transport recovered without a full disconnect.
    pub(crate) fn update_subscription(self: &Arc<Self>) {
        if let OperationKind::Monitor(op) = &self.kind
            && *op.started.lock().unwrap()
            && self.start_request((qos::PROCESS | qos::GET) as i32)
            && let Ok(circuit) = self.channel.checked_transport()
        {
            let _ = circuit.enqueue(self.clone());
        }
    }

    /// Idempotent teardown. Emits a best-effort cancel frame for an
    /// initialized request and delivers one terminal event if a request was
    /// still in flight.
    pub(crate) fn destroy(self: &Arc<Self>) {
        let (was_initialized, notify) = {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let notify = state.awaiting_response || state.pending != NULL_REQUEST;
            (state.initialized, notify)
        };
        if let Some(context) = self.channel.context() {
            context.unregister_response_request(self.ioid);
        }
        self.channel.unregister_request(self.ioid);
        if was_initialized {
            self.state.lock().unwrap().pending = PURE_DESTROY_REQUEST;
            if let Ok(circuit) = self.channel.checked_transport() {
                let _ = circuit.enqueue(self.clone());
            }
        }
        if notify {
            self.terminal_notify(statuses::request_cancelled());
        }
    }

    /// The owning channel was destroyed: terminate exactly once.
    pub(crate) fn channel_destroyed_notify(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.initialized = false;
            state.stop_request();
        }
        if let Some(context) = self.channel.context() {
            context.unregister_response_request(self.ioid);
        }
        self.channel.unregister_request(self.ioid);
        self.terminal_notify(statuses::channel_destroyed());
    }

    /// The channel lost its circuit: clear in-flight state but stay alive
    /// for automatic recovery.
    pub(crate) fn channel_disconnected_notify(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.stop_request();
            state.awaiting_response = false;
        }
        if let OperationKind::Monitor(op) = &self.kind {
            let requester = op.requester.clone();
            guard_callback("monitor_disconnect", move || requester.monitor_disconnect());
        }
    }

    /// INIT never happened; deliver the connect callback with a failure.
    fn connect_failed(&self, status: Status) {
        match &self.kind {
            OperationKind::Process(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("channel_process_connect", move || {
                    requester.channel_process_connect(status)
                });
            }
            OperationKind::Get(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("channel_get_connect", move || {
                    requester.channel_get_connect(status, None)
                });
            }
            OperationKind::Put(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("channel_put_connect", move || {
                    requester.channel_put_connect(status, None)
                });
            }
            OperationKind::PutGet(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("channel_put_get_connect", move || {
                    requester.channel_put_get_connect(status, None, None)
                });
            }
            OperationKind::Rpc(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("channel_rpc_connect", move || {
                    requester.channel_rpc_connect(status, None)
                });
            }
            OperationKind::Array(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("channel_array_connect", move || {
                    requester.channel_array_connect(status, None)
                });
            }
            OperationKind::Monitor(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("monitor_connect", move || {
                    requester.monitor_connect(status, None)
                });
            }
            OperationKind::GetField(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("get_field_done", move || requester.get_done(status, None));
            }
        }
    }

    /// One terminal event after cancellation or channel destruction.
    fn terminal_notify(&self, status: Status) {
        match &self.kind {
            OperationKind::Process(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("process_done", move || requester.process_done(status));
            }
            OperationKind::Get(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("get_done", move || requester.get_done(status));
            }
            OperationKind::Put(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("put_done", move || requester.put_done(status));
            }
            OperationKind::PutGet(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("put_get_done", move || requester.put_get_done(status));
            }
            OperationKind::Rpc(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("request_done", move || requester.request_done(status, None));
            }
            OperationKind::Array(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("get_array_done", move || requester.get_array_done(status));
            }
            OperationKind::Monitor(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("monitor_connect", move || {
                    requester.monitor_connect(status, None)
                });
            }
            OperationKind::GetField(op) => {
                let (requester, status) = (op.requester.clone(), status);
                guard_callback("get_field_done", move || requester.get_done(status, None));
            }
        }
    }

    /// Forward a command-18 server message to the requester.
    pub(crate) fn requester_message(&self, text: &str, kind: MessageKind) {
        let text = text.to_string();
        let requester = &self.kind;
        guard_callback("message", move || requester.requester().message(&text, kind));
    }

    // ---- response path -------------------------------------------------

    /// Deliver a routed data response to this operation.
    pub(crate) fn response(
        self: &Arc<Self>,
        header: &FrameHeader,
        reader: &mut PayloadReader<'_>,
        circuit: &Arc<Circuit>,
    ) {
        self.state.lock().unwrap().awaiting_response = false;
        let result = match &self.kind {
            OperationKind::GetField(op) => self.get_field_response(op, reader, circuit),
            OperationKind::Monitor(op) => self.monitor_response(op, reader, circuit),
            _ => self.common_response(header, reader, circuit),
        };
        if let Err(e) = result {
            warn!(
                "Bad {} response payload for IOID {}: {e}",
                self.kind.name(),
                self.ioid
            );
        }
    }

    fn common_response(
        self: &Arc<Self>,
        _header: &FrameHeader,
        reader: &mut PayloadReader<'_>,
        circuit: &Arc<Circuit>,
    ) -> Result<(), WireError> {
        let qos_byte = reader.u8()?;
        let status = Status::deserialize(reader)?;
        if qos_byte & qos::INIT != 0 {
            if status.is_success() {
                self.state.lock().unwrap().initialized = true;
            }
            self.init_response(status, reader, circuit)
        } else if qos_byte & qos::DESTROY != 0 {
            self.state.lock().unwrap().initialized = false;
            self.destroy_response(qos_byte, status, reader, circuit)
        } else {
            self.normal_response(qos_byte, status, reader, circuit)
        }
    }

    fn init_response(
        self: &Arc<Self>,
        status: Status,
        reader: &mut PayloadReader<'_>,
        circuit: &Arc<Circuit>,
    ) -> Result<(), WireError> {
        match &self.kind {
            OperationKind::Process(op) => {
                let requester = op.requester.clone();
                guard_callback("channel_process_connect", move || {
                    requester.channel_process_connect(status)
                });
            }
            OperationKind::Get(op) => {
                if !status.is_success() {
                    self.connect_failed(status);
                    return Ok(());
                }
                let structure = circuit
                    .registry()
                    .lock()
                    .unwrap()
                    .deserialize_structure_and_create(reader)?;
                let shared: SharedValue = Arc::new(Mutex::new(ValueSlot::new(structure)));
                *op.data.lock().unwrap() = Some(shared.clone());
                let requester = op.requester.clone();
                guard_callback("channel_get_connect", move || {
                    requester.channel_get_connect(status, Some(&shared))
                });
            }
            OperationKind::Put(op) => {
                if !status.is_success() {
                    self.connect_failed(status);
                    return Ok(());
                }
                let structure = circuit
                    .registry()
                    .lock()
                    .unwrap()
                    .deserialize_structure_and_create(reader)?;
                let shared: SharedValue = Arc::new(Mutex::new(ValueSlot::new(structure)));
                *op.data.lock().unwrap() = Some(shared.clone());
                let requester = op.requester.clone();
                guard_callback("channel_put_connect", move || {
                    requester.channel_put_connect(status, Some(&shared))
                });
            }
            OperationKind::PutGet(op) => {
                if !status.is_success() {
                    self.connect_failed(status);
                    return Ok(());
                }
                let (put_structure, get_structure) = {
                    let mut registry = circuit.registry().lock().unwrap();
                    (
                        registry.deserialize_structure_and_create(reader)?,
                        registry.deserialize_structure_and_create(reader)?,
                    )
                };
                let put_shared: SharedValue = Arc::new(Mutex::new(ValueSlot::new(put_structure)));
                let get_shared: SharedValue = Arc::new(Mutex::new(ValueSlot::new(get_structure)));
                *op.put_data.lock().unwrap() = Some(put_shared.clone());
                *op.get_data.lock().unwrap() = Some(get_shared.clone());
                let requester = op.requester.clone();
                guard_callback("channel_put_get_connect", move || {
                    requester.channel_put_get_connect(status, Some(&put_shared), Some(&get_shared))
                });
            }
            OperationKind::Rpc(op) => {
                if !status.is_success() {
                    self.connect_failed(status);
                    return Ok(());
                }
                let structure = circuit
                    .registry()
                    .lock()
                    .unwrap()
                    .deserialize_structure_and_create(reader)?;
                let shared: SharedValue = Arc::new(Mutex::new(ValueSlot::new(structure)));
                *op.argument.lock().unwrap() = Some(shared.clone());
                let requester = op.requester.clone();
                guard_callback("channel_rpc_connect", move || {
                    requester.channel_rpc_connect(status, Some(&shared))
                });
            }
            OperationKind::Array(op) => {
                if !status.is_success() {
                    self.connect_failed(status);
                    return Ok(());
                }
                let desc = circuit.registry().lock().unwrap().deserialize_field(reader)?;
                let Some(desc) = desc.filter(|d| matches!(d.as_ref(), FieldDesc::ScalarArray(_)))
                else {
                    self.connect_failed(Status::error("server did not describe an array field"));
                    return Ok(());
                };
                let shared: SharedArray = Arc::new(Mutex::new(PvValue::zeroed(&desc)));
                *op.desc.lock().unwrap() = Some(desc);
                *op.data.lock().unwrap() = Some(shared.clone());
                let requester = op.requester.clone();
                guard_callback("channel_array_connect", move || {
                    requester.channel_array_connect(status, Some(&shared))
                });
            }
            OperationKind::Monitor(_) | OperationKind::GetField(_) => unreachable!(),
        }
        Ok(())
    }

    fn normal_response(
        self: &Arc<Self>,
        qos_byte: u8,
        status: Status,
        reader: &mut PayloadReader<'_>,
        circuit: &Arc<Circuit>,
    ) -> Result<(), WireError> {
        match &self.kind {
            OperationKind::Process(op) => {
                let requester = op.requester.clone();
                guard_callback("process_done", move || requester.process_done(status));
            }
            OperationKind::Get(op) => {
                if status.is_success()
                    && let Some(shared) = op.data.lock().unwrap().clone()
                {
                    let changed = reader.bitset()?;
                    let mut slot = shared.lock().unwrap();
                    slot.value.deserialize_masked(reader, &changed)?;
                    slot.changed = changed;
                }
                let requester = op.requester.clone();
                guard_callback("get_done", move || requester.get_done(status));
            }
            OperationKind::Put(op) => {
                if qos_byte & qos::GET != 0 {
                    if status.is_success()
                        && let Some(shared) = op.data.lock().unwrap().clone()
                    {
                        shared.lock().unwrap().value.deserialize_full(reader)?;
                    }
                    let requester = op.requester.clone();
                    guard_callback("get_done", move || requester.get_done(status));
                } else {
                    let requester = op.requester.clone();
                    guard_callback("put_done", move || requester.put_done(status));
                }
            }
            OperationKind::PutGet(op) => {
                if qos_byte & qos::GET != 0 {
                    if status.is_success()
                        && let Some(shared) = op.get_data.lock().unwrap().clone()
                    {
                        shared.lock().unwrap().value.deserialize_full(reader)?;
                    }
                    let requester = op.requester.clone();
                    guard_callback("get_get_done", move || requester.get_get_done(status));
                } else if qos_byte & qos::GET_PUT != 0 {
                    if status.is_success()
                        && let Some(shared) = op.put_data.lock().unwrap().clone()
                    {
                        shared.lock().unwrap().value.deserialize_full(reader)?;
                    }
                    let requester = op.requester.clone();
                    guard_callback("get_put_done", move || requester.get_put_done(status));
                } else {
                    if status.is_success()
                        && let Some(shared) = op.get_data.lock().unwrap().clone()
                    {
                        shared.lock().unwrap().value.deserialize_full(reader)?;
                    }
                    let requester = op.requester.clone();
                    guard_callback("put_get_done", move || requester.put_get_done(status));
                }
            }
            OperationKind::Rpc(op) => {
                let response = if status.is_success() {
                    let mut structure = circuit
                        .registry()
                        .lock()
                        .unwrap()
                        .deserialize_structure_and_create(reader)?;
                    structure.deserialize_full(reader)?;
                    Some(structure)
                } else {
                    None
                };
                let requester = op.requester.clone();
                guard_callback("request_done", move || {
                    requester.request_done(status, response)
                });
            }
            OperationKind::Array(op) => {
                if qos_byte & qos::GET != 0 {
                    if status.is_success()
                        && let (Some(desc), Some(shared)) = (
                            op.desc.lock().unwrap().clone(),
                            op.data.lock().unwrap().clone(),
                        )
                    {
                        *shared.lock().unwrap() = PvValue::deserialize(&desc, reader)?;
                    }
                    let requester = op.requester.clone();
                    guard_callback("get_array_done", move || requester.get_array_done(status));
                } else if qos_byte & qos::GET_PUT != 0 {
                    let requester = op.requester.clone();
                    guard_callback("set_length_done", move || requester.set_length_done(status));
                } else {
                    let requester = op.requester.clone();
                    guard_callback("put_array_done", move || requester.put_array_done(status));
                }
            }
            OperationKind::Monitor(_) | OperationKind::GetField(_) => unreachable!(),
        }
        Ok(())
    }

    fn destroy_response(
        self: &Arc<Self>,
        qos_byte: u8,
        status: Status,
        reader: &mut PayloadReader<'_>,
        circuit: &Arc<Circuit>,
    ) -> Result<(), WireError> {
        match &self.kind {
            // a last get/put carries its final payload with the destroy
            OperationKind::Get(_) | OperationKind::Array(_) => {
                if qos_byte & qos::GET != 0 {
                    self.normal_response(qos_byte, status, reader, circuit)
                } else {
                    Ok(())
                }
            }
            OperationKind::PutGet(_) | OperationKind::Rpc(_) => {
                self.normal_response(qos_byte & !qos::DESTROY, status, reader, circuit)
            }
            OperationKind::Process(op) => {
                let requester = op.requester.clone();
                guard_callback("process_done", move || requester.process_done(status));
                Ok(())
            }
            OperationKind::Put(op) => {
                let requester = op.requester.clone();
                guard_callback("put_done", move || requester.put_done(status));
                Ok(())
            }
            OperationKind::Monitor(_) | OperationKind::GetField(_) => unreachable!(),
        }
    }

    /// Monitors optimize the common data path: no status byte on the wire.
    fn monitor_response(
        self: &Arc<Self>,
        op: &MonitorOp,
        reader: &mut PayloadReader<'_>,
        circuit: &Arc<Circuit>,
    ) -> Result<(), WireError> {
        let qos_byte = reader.u8()?;
        if qos_byte & qos::INIT != 0 {
            let status = Status::deserialize(reader)?;
            if !status.is_success() {
                let requester = op.requester.clone();
                guard_callback("monitor_connect", move || {
                    requester.monitor_connect(status, None)
                });
                return Ok(());
            }
            self.state.lock().unwrap().initialized = true;
            let desc = circuit.registry().lock().unwrap().deserialize_field(reader)?;
            let Some(desc) = desc.filter(|d| matches!(d.as_ref(), FieldDesc::Structure { .. }))
            else {
                let requester = op.requester.clone();
                guard_callback("monitor_connect", move || {
                    requester.monitor_connect(
                        Status::error("server did not describe a structure"),
                        None,
                    )
                });
                return Ok(());
            };
            op.queue.lock().unwrap().init(&desc);
            let requester = op.requester.clone();
            let connect_desc = desc.clone();
            guard_callback("monitor_connect", move || {
                requester.monitor_connect(status, Some(&connect_desc))
            });
            // a monitor that was running before a reconnect resumes itself
            if *op.started.lock().unwrap() {
                let _ = self.monitor_start();
            }
            Ok(())
        } else if qos_byte & qos::DESTROY != 0 {
            let _status = Status::deserialize(reader)?;
            self.state.lock().unwrap().initialized = false;
            Ok(())
        } else {
            let notify = op.queue.lock().unwrap().response(reader)?;
            if notify {
                let requester = op.requester.clone();
                guard_callback("monitor_event", move || requester.monitor_event());
            }
            Ok(())
        }
    }

    fn get_field_response(
        self: &Arc<Self>,
        op: &GetFieldOp,
        reader: &mut PayloadReader<'_>,
        circuit: &Arc<Circuit>,
    ) -> Result<(), WireError> {
        let status = Status::deserialize(reader)?;
        let field = if status.is_success() {
            circuit.registry().lock().unwrap().deserialize_field(reader)?
        } else {
            None
        };
        let requester = op.requester.clone();
        guard_callback("get_field_done", move || requester.get_done(status, field));
        // one-shot: self-destructs after delivering
        {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
        }
        if let Some(context) = self.channel.context() {
            context.unregister_response_request(self.ioid);
        }
        self.channel.unregister_request(self.ioid);
        Ok(())
    }

    // ---- user request entry points -------------------------------------

    fn get_request(self: &Arc<Self>, last_request: bool) {
        let OperationKind::Get(op) = &self.kind else { return };
        let requester = op.requester.clone();
        let qos_code = if last_request {
            (qos::DESTROY | qos::GET) as i32
        } else {
            qos::DEFAULT as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("get_done", move || requester.get_done(status))
        });
    }

    fn put_request(self: &Arc<Self>, last_request: bool) {
        let OperationKind::Put(op) = &self.kind else { return };
        let requester = op.requester.clone();
        let qos_code = if last_request {
            qos::DESTROY as i32
        } else {
            qos::DEFAULT as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("put_done", move || requester.put_done(status))
        });
    }

    fn get_of_put_request(self: &Arc<Self>) {
        let OperationKind::Put(op) = &self.kind else { return };
        let requester = op.requester.clone();
        self.issue(qos::GET as i32, move |status| {
            guard_callback("get_done", move || requester.get_done(status))
        });
    }

    fn put_get_request(self: &Arc<Self>, last_request: bool) {
        let OperationKind::PutGet(op) = &self.kind else { return };
        let requester = op.requester.clone();
        let qos_code = if last_request {
            qos::DESTROY as i32
        } else {
            qos::DEFAULT as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("put_get_done", move || requester.put_get_done(status))
        });
    }

    fn get_get_request(self: &Arc<Self>) {
        let OperationKind::PutGet(op) = &self.kind else { return };
        let requester = op.requester.clone();
        self.issue(qos::GET as i32, move |status| {
            guard_callback("get_get_done", move || requester.get_get_done(status))
        });
    }

    fn get_put_request(self: &Arc<Self>) {
        let OperationKind::PutGet(op) = &self.kind else { return };
        let requester = op.requester.clone();
        self.issue(qos::GET_PUT as i32, move |status| {
            guard_callback("get_put_done", move || requester.get_put_done(status))
        });
    }

    fn process_request(self: &Arc<Self>, last_request: bool) {
        let OperationKind::Process(op) = &self.kind else { return };
        let requester = op.requester.clone();
        let qos_code = if last_request {
            qos::DESTROY as i32
        } else {
            qos::DEFAULT as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("process_done", move || requester.process_done(status))
        });
    }

    fn rpc_request(self: &Arc<Self>, last_request: bool) {
        let OperationKind::Rpc(op) = &self.kind else { return };
        let requester = op.requester.clone();
        let qos_code = if last_request {
            qos::DESTROY as i32
        } else {
            qos::DEFAULT as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("request_done", move || requester.request_done(status, None))
        });
    }

    fn get_array_request(self: &Arc<Self>, last_request: bool, offset: i32, count: i32) {
        let OperationKind::Array(op) = &self.kind else { return };
        {
            let mut params = op.params.lock().unwrap();
            params.offset = offset;
            params.count = count;
        }
        let requester = op.requester.clone();
        let qos_code = if last_request {
            (qos::DESTROY | qos::GET) as i32
        } else {
            qos::GET as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("get_array_done", move || requester.get_array_done(status))
        });
    }

    fn put_array_request(self: &Arc<Self>, last_request: bool, offset: i32, count: i32) {
        let OperationKind::Array(op) = &self.kind else { return };
        {
            let mut params = op.params.lock().unwrap();
            if let Some(capacity) = params.known_capacity
                && offset >= 0
                && count >= 0
                && (offset as usize).saturating_add(count as usize) > capacity
            {
                let requester = op.requester.clone();
                guard_callback("put_array_done", move || {
                    requester.put_array_done(Status::error(
                        "offset + count exceeds array capacity",
                    ))
                });
                return;
            }
            params.offset = offset;
            params.count = count;
        }
        let requester = op.requester.clone();
        let qos_code = if last_request {
            qos::DESTROY as i32
        } else {
            qos::DEFAULT as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("put_array_done", move || requester.put_array_done(status))
        });
    }

    fn set_length_request(self: &Arc<Self>, last_request: bool, length: i32, capacity: i32) {
        let OperationKind::Array(op) = &self.kind else { return };
        {
            let mut params = op.params.lock().unwrap();
            params.length = length;
            params.capacity = capacity;
            if capacity >= 0 {
                params.known_capacity = Some(capacity as usize);
            }
        }
        let requester = op.requester.clone();
        let qos_code = if last_request {
            (qos::DESTROY | qos::GET_PUT) as i32
        } else {
            qos::GET_PUT as i32
        };
        self.issue(qos_code, move |status| {
            guard_callback("set_length_done", move || requester.set_length_done(status))
        });
    }

    fn monitor_start(self: &Arc<Self>) -> Status {
        let OperationKind::Monitor(op) = &self.kind else {
            return statuses::request_destroyed();
        };
        {
            let state = self.state.lock().unwrap();
            if state.destroyed {
                return statuses::request_destroyed();
            }
            if !state.initialized {
                return statuses::not_initialized();
            }
        }
        let started = op.queue.lock().unwrap().start();
        if !started.is_success() {
            return started;
        }
        if !self.start_request((qos::PROCESS | qos::GET) as i32) {
            return statuses::other_request_pending();
        }
        match self.channel.checked_transport() {
            Ok(circuit) => {
                if circuit.enqueue(self.clone()).is_err() {
                    self.stop_request();
                    return statuses::channel_not_connected();
                }
                *op.started.lock().unwrap() = true;
                Status::ok()
            }
            Err(_) => {
                self.stop_request();
                statuses::channel_not_connected()
            }
        }
    }

    fn monitor_stop(self: &Arc<Self>) -> Status {
        let OperationKind::Monitor(op) = &self.kind else {
            return statuses::request_destroyed();
        };
        {
            let state = self.state.lock().unwrap();
            if state.destroyed {
                return statuses::request_destroyed();
            }
            if !state.initialized {
                return statuses::not_initialized();
            }
        }
        op.queue.lock().unwrap().stop();
        if !self.start_request(qos::PROCESS as i32) {
            return statuses::other_request_pending();
        }
        match self.channel.checked_transport() {
            Ok(circuit) => {
                if circuit.enqueue(self.clone()).is_err() {
                    self.stop_request();
                    return statuses::channel_not_connected();
                }
                *op.started.lock().unwrap() = false;
                Status::ok()
            }
            Err(_) => {
                self.stop_request();
                statuses::channel_not_connected()
            }
        }
    }
}

impl TransportSender for Operation {
    fn send(&self, control: &mut SendControl<'_>) {
        let pending = self.state.lock().unwrap().pending;
        if pending == NULL_REQUEST {
            return;
        }
        if pending == PURE_DESTROY_REQUEST {
            control.start_message(commands::CANCEL_REQUEST, 8);
            let (buf, _) = control.parts();
            buf.put_u32(self.channel.server_channel_id());
            buf.put_u32(self.ioid);
            self.stop_request();
            return;
        }
        let qos_byte = pending as u8;

        if let OperationKind::GetField(op) = &self.kind {
            control.start_message(commands::GET_FIELD, 8);
            let (buf, _) = control.parts();
            buf.put_u32(self.channel.server_channel_id());
            buf.put_u32(self.ioid);
            crate::wire::write_string(buf, &op.sub_field);
            let mut state = self.state.lock().unwrap();
            state.stop_request();
            state.awaiting_response = true;
            return;
        }

        control.start_message(self.kind.command(), 9);
        {
            let (buf, _) = control.parts();
            buf.put_u32(self.channel.server_channel_id());
            buf.put_u32(self.ioid);
            buf.put_u8(qos_byte);
        }

        if qos_byte & qos::INIT != 0 {
            let (buf, registry) = control.parts();
            match &self.kind {
                OperationKind::Process(op) => {
                    registry.serialize_pv_request(buf, op.pv_request.as_ref())
                }
                OperationKind::Get(op) => registry.serialize_pv_request(buf, Some(&op.pv_request)),
                OperationKind::Put(op) => registry.serialize_pv_request(buf, Some(&op.pv_request)),
                OperationKind::PutGet(op) => {
                    registry.serialize_pv_request(buf, Some(&op.pv_request))
                }
                OperationKind::Rpc(op) => registry.serialize_pv_request(buf, Some(&op.pv_request)),
                OperationKind::Array(op) => {
                    registry.serialize_pv_request(buf, Some(&op.pv_request))
                }
                OperationKind::Monitor(op) => {
                    registry.serialize_pv_request(buf, op.pv_request.as_ref())
                }
                OperationKind::GetField(_) => unreachable!(),
            }
        } else {
            match &self.kind {
                // process, monitor start/stop: the QoS byte says it all
                OperationKind::Process(_) | OperationKind::Monitor(_) => {}
                OperationKind::Get(_) => {}
                OperationKind::Put(op) => {
                    if qos_byte & qos::GET == 0 {
                        // serialize only what has been changed
                        if let Some(shared) = op.data.lock().unwrap().clone() {
                            let slot = shared.lock().unwrap();
                            let (buf, _) = control.parts();
                            slot.changed.serialize(buf);
                            slot.value.serialize_masked(buf, &slot.changed);
                        }
                    }
                }
                OperationKind::PutGet(op) => {
                    if qos_byte & (qos::GET | qos::GET_PUT) == 0
                        && let Some(shared) = op.put_data.lock().unwrap().clone()
                    {
                        let slot = shared.lock().unwrap();
                        let (buf, _) = control.parts();
                        slot.value.serialize_full(buf);
                    }
                }
                OperationKind::Rpc(op) => {
                    if let Some(shared) = op.argument.lock().unwrap().clone() {
                        let slot = shared.lock().unwrap();
                        let (buf, _) = control.parts();
                        slot.changed.serialize(buf);
                        slot.value.serialize_masked(buf, &slot.changed);
                    }
                }
                OperationKind::Array(op) => {
                    let params = *op.params.lock().unwrap();
                    let (buf, _) = control.parts();
                    if qos_byte & qos::GET != 0 {
                        write_size(buf, params.offset);
                        write_size(buf, params.count);
                    } else if qos_byte & qos::GET_PUT != 0 {
                        write_size(buf, params.length);
                        write_size(buf, params.capacity);
                    } else {
                        write_size(buf, params.offset);
                        let data = op.data.lock().unwrap().clone();
                        match data {
                            Some(shared) => serialize_array_slice(
                                buf,
                                &shared.lock().unwrap(),
                                params.count.max(0) as usize,
                            ),
                            None => write_size(buf, 0),
                        }
                    }
                }
                OperationKind::GetField(_) => unreachable!(),
            }
        }

        let mut state = self.state.lock().unwrap();
        state.stop_request();
        state.awaiting_response = true;
    }
}

/// Serialize the first `count` elements of an array value.
fn serialize_array_slice(buf: &mut bytes::BytesMut, value: &PvValue, count: usize) {
    macro_rules! slice_arm {
        ($v:expr, $put:ident) => {{
            let n = count.min($v.len());
            write_size(buf, n as i32);
            for e in &$v[..n] {
                buf.$put(*e);
            }
        }};
    }
    match value {
        PvValue::IntArray(v) => slice_arm!(v, put_i32),
        PvValue::LongArray(v) => slice_arm!(v, put_i64),
        PvValue::FloatArray(v) => slice_arm!(v, put_f32),
        PvValue::DoubleArray(v) => slice_arm!(v, put_f64),
        PvValue::BooleanArray(v) => {
            let n = count.min(v.len());
            write_size(buf, n as i32);
            for e in &v[..n] {
                buf.put_u8(*e as u8);
            }
        }
        PvValue::StringArray(v) => {
            let n = count.min(v.len());
            write_size(buf, n as i32);
            for e in &v[..n] {
                crate::wire::write_string(buf, e);
            }
        }
        _ => write_size(buf, 0),
    }
}

// ---- monitor delivery strategies ---------------------------------------

/// One delivered monitor element.
#[derive(Debug, Clone)]
pub struct MonitorElement {
    /// Absent in notify-only mode.
    pub value: Option<PvStructure>,
    pub changed: BitSet,
    pub overrun: BitSet,
}

#[derive(Debug)]
pub(crate) struct MonitorSlot {
    value: PvStructure,
    changed: BitSet,
    overrun: BitSet,
}

/// The three delivery strategies, keyed by `record.queueSize`.
#[derive(Debug)]
pub(crate) enum MonitorQueue {
    /// `queueSize = -1`: data-less notification per update.
    Notify { got: bool },
    /// `queueSize = 0`: every update delivered verbatim, no merging.
    Entire { slot: Option<MonitorSlot>, got: bool },
    /// `queueSize >= 1`: one coalescing slot.
    Single {
        slot: Option<MonitorSlot>,
        got: bool,
        need_compress: bool,
    },
}

impl MonitorQueue {
    pub(crate) fn for_queue_size(queue_size: Option<i32>) -> MonitorQueue {
        match queue_size {
            Some(-1) => MonitorQueue::Notify { got: false },
            Some(0) => MonitorQueue::Entire {
                slot: None,
                got: false,
            },
            _ => MonitorQueue::Single {
                slot: None,
                got: false,
                need_compress: false,
            },
        }
    }

    fn init(&mut self, desc: &Arc<FieldDesc>) {
        let fresh = || MonitorSlot {
            value: PvStructure::zeroed(desc),
            changed: BitSet::new(),
            overrun: BitSet::new(),
        };
        match self {
            MonitorQueue::Notify { .. } => {}
            MonitorQueue::Entire { slot, got } => {
                *slot = Some(fresh());
                *got = false;
            }
            MonitorQueue::Single {
                slot,
                got,
                need_compress,
            } => {
                *slot = Some(fresh());
                *got = false;
                *need_compress = false;
            }
        }
    }

    /// Apply one wire update. Returns whether the requester should be
    /// notified.
    fn response(&mut self, reader: &mut PayloadReader<'_>) -> Result<bool, WireError> {
        match self {
            MonitorQueue::Notify { got } => {
                *got = true;
                Ok(true)
            }
            MonitorQueue::Entire { slot, got } => {
                let Some(slot) = slot else { return Ok(false) };
                slot.changed = reader.bitset()?;
                slot.value.deserialize_masked(reader, &slot.changed)?;
                slot.overrun = reader.bitset()?;
                *got = true;
                Ok(true)
            }
            MonitorQueue::Single {
                slot,
                got,
                need_compress,
            } => {
                let Some(slot) = slot else { return Ok(false) };
                if !*got {
                    slot.changed = reader.bitset()?;
                    slot.value.deserialize_masked(reader, &slot.changed)?;
                    slot.overrun = reader.bitset()?;
                    *got = true;
                    *need_compress = true;
                    Ok(true)
                } else {
                    let incoming_changed = reader.bitset()?;
                    slot.value.deserialize_masked(reader, &incoming_changed)?;
                    let incoming_overrun = reader.bitset()?;
                    // a field updated twice without a poll is an overrun
                    slot.overrun.or_and(&incoming_changed, &slot.changed);
                    slot.changed.or_with(&incoming_changed);
                    slot.overrun.or_with(&incoming_overrun);
                    *need_compress = true;
                    Ok(false)
                }
            }
        }
    }

    fn poll(&mut self) -> Option<MonitorElement> {
        match self {
            MonitorQueue::Notify { got } => got.then(|| MonitorElement {
                value: None,
                changed: BitSet::new(),
                overrun: BitSet::new(),
            }),
            MonitorQueue::Entire { slot, got } => {
                if !*got {
                    return None;
                }
                let slot = slot.as_ref()?;
                Some(MonitorElement {
                    value: Some(slot.value.clone()),
                    changed: slot.changed.clone(),
                    overrun: slot.overrun.clone(),
                })
            }
            MonitorQueue::Single {
                slot,
                got,
                need_compress,
            } => {
                if !*got {
                    return None;
                }
                let slot = slot.as_mut()?;
                if *need_compress {
                    compress_bitset(&mut slot.changed, slot.value.desc());
                    compress_bitset(&mut slot.overrun, slot.value.desc());
                    *need_compress = false;
                }
                Some(MonitorElement {
                    value: Some(slot.value.clone()),
                    changed: slot.changed.clone(),
                    overrun: slot.overrun.clone(),
                })
            }
        }
    }

    fn release(&mut self) {
        match self {
            MonitorQueue::Notify { got }
            | MonitorQueue::Entire { got, .. }
            | MonitorQueue::Single { got, .. } => *got = false,
        }
    }

    fn start(&mut self) -> Status {
        match self {
            MonitorQueue::Notify { got } => {
                *got = false;
                Status::ok()
            }
            MonitorQueue::Entire { slot, got } => {
                if slot.is_none() {
                    return Status::error("Monitor not connected.");
                }
                *got = false;
                Status::ok()
            }
            MonitorQueue::Single { slot, got, .. } => {
                let Some(slot) = slot else {
                    return Status::error("Monitor not connected.");
                };
                slot.changed.clear();
                slot.overrun.clear();
                *got = false;
                Status::ok()
            }
        }
    }

    fn stop(&mut self) {}
}

// ---- factories and public handles --------------------------------------

pub(crate) fn create_process(
    channel: &Arc<Channel>,
    requester: Arc<dyn ChannelProcessRequester>,
    pv_request: Option<PvRequest>,
) -> ChannelProcess {
    // pvRequest may legitimately be absent for process
    let kind = OperationKind::Process(ProcessOp {
        requester,
        pv_request,
    });
    ChannelProcess {
        operation: Operation::register(channel, kind),
    }
}

pub(crate) fn create_get(
    channel: &Arc<Channel>,
    requester: Arc<dyn ChannelGetRequester>,
    pv_request: Option<PvRequest>,
) -> ChannelGet {
    let Some(pv_request) = pv_request else {
        let reporter = requester.clone();
        guard_callback("channel_get_connect", move || {
            reporter.channel_get_connect(statuses::pv_request_null(), None)
        });
        return ChannelGet {
            operation: Operation::dead(
                channel,
                OperationKind::Get(GetOp {
                    requester,
                    pv_request: PvRequest::all(),
                    data: Mutex::new(None),
                }),
            ),
        };
    };
    let kind = OperationKind::Get(GetOp {
        requester,
        pv_request,
        data: Mutex::new(None),
    });
    ChannelGet {
        operation: Operation::register(channel, kind),
    }
}

pub(crate) fn create_put(
    channel: &Arc<Channel>,
    requester: Arc<dyn ChannelPutRequester>,
    pv_request: Option<PvRequest>,
) -> ChannelPut {
    let Some(pv_request) = pv_request else {
        let reporter = requester.clone();
        guard_callback("channel_put_connect", move || {
            reporter.channel_put_connect(statuses::pv_request_null(), None)
        });
        return ChannelPut {
            operation: Operation::dead(
                channel,
                OperationKind::Put(PutOp {
                    requester,
                    pv_request: PvRequest::all(),
                    data: Mutex::new(None),
                }),
            ),
        };
    };
    let kind = OperationKind::Put(PutOp {
        requester,
        pv_request,
        data: Mutex::new(None),
    });
    ChannelPut {
        operation: Operation::register(channel, kind),
    }
}

pub(crate) fn create_put_get(
    channel: &Arc<Channel>,
    requester: Arc<dyn ChannelPutGetRequester>,
    pv_request: Option<PvRequest>,
) -> ChannelPutGet {
    let Some(pv_request) = pv_request else {
        let reporter = requester.clone();
        guard_callback("channel_put_get_connect", move || {
            reporter.channel_put_get_connect(statuses::pv_request_null(), None, None)
        });
        return ChannelPutGet {
            operation: Operation::dead(
                channel,
                OperationKind::PutGet(PutGetOp {
                    requester,
                    pv_request: PvRequest::all(),
                    put_data: Mutex::new(None),
                    get_data: Mutex::new(None),
                }),
            ),
        };
    };
    let kind = OperationKind::PutGet(PutGetOp {
        requester,
        pv_request,
        put_data: Mutex::new(None),
        get_data: Mutex::new(None),
    });
    ChannelPutGet {
        operation: Operation::register(channel, kind),
    }
}

pub(crate) fn create_rpc(
    channel: &Arc<Channel>,
    requester: Arc<dyn ChannelRpcRequester>,
    pv_request: Option<PvRequest>,
) -> ChannelRpc {
    let Some(pv_request) = pv_request else {
        let reporter = requester.clone();
        guard_callback("channel_rpc_connect", move || {
            reporter.channel_rpc_connect(statuses::pv_request_null(), None)
        });
        return ChannelRpc {
            operation: Operation::dead(
                channel,
                OperationKind::Rpc(RpcOp {
                    requester,
                    pv_request: PvRequest::all(),
                    argument: Mutex::new(None),
                }),
            ),
        };
    };
    let kind = OperationKind::Rpc(RpcOp {
        requester,
        pv_request,
        argument: Mutex::new(None),
    });
    ChannelRpc {
        operation: Operation::register(channel, kind),
    }
}

pub(crate) fn create_array(
    channel: &Arc<Channel>,
    requester: Arc<dyn ChannelArrayRequester>,
    pv_request: Option<PvRequest>,
) -> ChannelArray {
    let params = ArrayParams {
        offset: 0,
        count: 0,
        length: -1,
        capacity: -1,
        known_capacity: None,
    };
    let Some(pv_request) = pv_request else {
        let reporter = requester.clone();
        guard_callback("channel_array_connect", move || {
            reporter.channel_array_connect(statuses::pv_request_null(), None)
        });
        return ChannelArray {
            operation: Operation::dead(
                channel,
                OperationKind::Array(ArrayOp {
                    requester,
                    pv_request: PvRequest::all(),
                    desc: Mutex::new(None),
                    data: Mutex::new(None),
                    params: Mutex::new(params),
                }),
            ),
        };
    };
    let kind = OperationKind::Array(ArrayOp {
        requester,
        pv_request,
        desc: Mutex::new(None),
        data: Mutex::new(None),
        params: Mutex::new(params),
    });
    ChannelArray {
        operation: Operation::register(channel, kind),
    }
}

pub(crate) fn create_monitor(
    channel: &Arc<Channel>,
    requester: Arc<dyn MonitorRequester>,
    pv_request: Option<PvRequest>,
) -> Monitor {
    let queue_size = match pv_request.as_ref().map(PvRequest::queue_size) {
        Some(Err(status)) => {
            let reporter = requester.clone();
            guard_callback("monitor_connect", move || {
                reporter.monitor_connect(status, None)
            });
            return Monitor {
                operation: Operation::dead(
                    channel,
                    OperationKind::Monitor(MonitorOp {
                        requester,
                        pv_request,
                        queue: Mutex::new(MonitorQueue::for_queue_size(None)),
                        started: Mutex::new(false),
                    }),
                ),
            };
        }
        Some(Ok(size)) => size,
        None => None,
    };
    let kind = OperationKind::Monitor(MonitorOp {
        requester,
        pv_request,
        queue: Mutex::new(MonitorQueue::for_queue_size(queue_size)),
        started: Mutex::new(false),
    });
    Monitor {
        operation: Operation::register(channel, kind),
    }
}

pub(crate) fn create_get_field(
    channel: &Arc<Channel>,
    requester: Arc<dyn GetFieldRequester>,
    sub_field: &str,
) {
    let kind = OperationKind::GetField(GetFieldOp {
        requester: requester.clone(),
        sub_field: sub_field.to_string(),
    });
    let operation = Operation::register_get_field(channel, kind);
    if operation.is_none() {
        guard_callback("get_field_done", move || {
            requester.get_done(statuses::channel_not_connected(), None)
        });
    }
}

impl Operation {
    /// GetField has no INIT cycle: register and enqueue in one step.
    fn register_get_field(channel: &Arc<Channel>, kind: OperationKind) -> Option<Arc<Operation>> {
        let context = channel.context()?;
        let channel_arc = channel.clone();
        let operation = context.register_response_request(move |ioid| {
            Arc::new(Operation {
                ioid,
                channel: channel_arc,
                state: Mutex::new(RequestState::new()),
                kind,
            })
        });
        if !channel.register_request(operation.ioid, operation.clone()) {
            context.unregister_response_request(operation.ioid);
            return None;
        }
        operation.start_request(qos::INIT as i32);
        let circuit = match channel.checked_transport() {
            Ok(circuit) => circuit,
            Err(_) => {
                operation.unregister_quietly();
                return None;
            }
        };
        if circuit.enqueue(operation.clone()).is_err() {
            operation.unregister_quietly();
            return None;
        }
        Some(operation)
    }

    fn unregister_quietly(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        if let Some(context) = self.channel.context() {
            context.unregister_response_request(self.ioid);
        }
        self.channel.unregister_request(self.ioid);
    }
}

/// Handle to a process operation.
pub struct ChannelProcess {
    operation: Arc<Operation>,
}

impl ChannelProcess {
    pub fn process(&self, last_request: bool) {
        self.operation.process_request(last_request);
    }

    pub fn destroy(&self) {
        self.operation.destroy();
    }
}

/// Handle to a get operation.
pub struct ChannelGet {
    operation: Arc<Operation>,
}

impl ChannelGet {
    pub fn get(&self, last_request: bool) {
        self.operation.get_request(last_request);
    }

    /// The shared result slot, once connected.
    pub fn data(&self) -> Option<SharedValue> {
        match &self.operation.kind {
            OperationKind::Get(op) => op.data.lock().unwrap().clone(),
            _ => None,
        }
    }

    pub fn cancel(&self) {
        self.operation.destroy();
    }

    pub fn destroy(&self) {
        self.operation.destroy();
    }
}

/// Handle to a put operation.
pub struct ChannelPut {
    operation: Arc<Operation>,
}

impl ChannelPut {
    /// Send the changed fields of the shared data slot.
    pub fn put(&self, last_request: bool) {
        self.operation.put_request(last_request);
    }

    /// Fetch the server's current value into the shared data slot.
    pub fn get(&self) {
        self.operation.get_of_put_request();
    }

    pub fn data(&self) -> Option<SharedValue> {
        match &self.operation.kind {
            OperationKind::Put(op) => op.data.lock().unwrap().clone(),
            _ => None,
        }
    }

    pub fn cancel(&self) {
        self.operation.destroy();
    }

    pub fn destroy(&self) {
        self.operation.destroy();
    }
}

/// Handle to a put-get operation.
pub struct ChannelPutGet {
    operation: Arc<Operation>,
}

impl ChannelPutGet {
    pub fn put_get(&self, last_request: bool) {
        self.operation.put_get_request(last_request);
    }

    pub fn get_get(&self) {
        self.operation.get_get_request();
    }

    pub fn get_put(&self) {
        self.operation.get_put_request();
    }

    pub fn put_data(&self) -> Option<SharedValue> {
        match &self.operation.kind {
            OperationKind::PutGet(op) => op.put_data.lock().unwrap().clone(),
            _ => None,
        }
    }

    pub fn get_data(&self) -> Option<SharedValue> {
        match &self.operation.kind {
            OperationKind::PutGet(op) => op.get_data.lock().unwrap().clone(),
            _ => None,
        }
    }

    pub fn destroy(&self) {
        self.operation.destroy();
    }
}

/// Handle to an RPC operation.
pub struct ChannelRpc {
    operation: Arc<Operation>,
}

impl ChannelRpc {
    /// Send the argument slot's changed fields and await the response.
    pub fn request(&self, last_request: bool) {
        self.operation.rpc_request(last_request);
    }

    pub fn argument(&self) -> Option<SharedValue> {
        match &self.operation.kind {
            OperationKind::Rpc(op) => op.argument.lock().unwrap().clone(),
            _ => None,
        }
    }

    pub fn destroy(&self) {
        self.operation.destroy();
    }
}

/// Handle to a bulk-array operation.
pub struct ChannelArray {
    operation: Arc<Operation>,
}

impl ChannelArray {
    pub fn get_array(&self, last_request: bool, offset: i32, count: i32) {
        self.operation.get_array_request(last_request, offset, count);
    }

    /// Send the first `count` elements of the shared data slot, placing them
    /// at `offset` on the server.
    pub fn put_array(&self, last_request: bool, offset: i32, count: i32) {
        self.operation.put_array_request(last_request, offset, count);
    }

    pub fn set_length(&self, last_request: bool, length: i32, capacity: i32) {
        self.operation.set_length_request(last_request, length, capacity);
    }

    pub fn data(&self) -> Option<SharedArray> {
        match &self.operation.kind {
            OperationKind::Array(op) => op.data.lock().unwrap().clone(),
            _ => None,
        }
    }

    pub fn destroy(&self) {
        self.operation.destroy();
    }
}

/// Handle to a monitor subscription.
pub struct Monitor {
    operation: Arc<Operation>,
}

impl Monitor {
    /// Begin (or resume) delivery. The subscription's INIT state survives a
    /// stop/start cycle.
    pub fn start(&self) -> Status {
        self.operation.monitor_start()
    }

    pub fn stop(&self) -> Status {
        self.operation.monitor_stop()
    }

    /// Take the buffered element, if any. In the coalescing strategy the
    /// changed/overrun sets are compressed against the structure layout
    /// before they are handed out.
    pub fn poll(&self) -> Option<MonitorElement> {
        match &self.operation.kind {
            OperationKind::Monitor(op) => op.queue.lock().unwrap().poll(),
            _ => None,
        }
    }

    /// Release the polled element, making the slot available again.
    pub fn release(&self) {
        if let OperationKind::Monitor(op) = &self.operation.kind {
            op.queue.lock().unwrap().release();
        }
    }

    pub fn destroy(&self) {
        self.operation.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ScalarKind;
    use bytes::BytesMut;

    #[test]
    fn request_arbitration() {
        let mut state = RequestState::new();
        assert!(state.start_request(qos::DEFAULT as i32));
        // slot occupied: only pure destroy may preempt
        assert!(!state.start_request(qos::GET as i32));
        assert!(state.start_request(PURE_DESTROY_REQUEST));
        state.stop_request();
        assert!(state.start_request(qos::GET as i32));
    }

    fn three_field_desc() -> Arc<FieldDesc> {
        FieldDesc::structure(
            "structure",
            vec![
                ("value", FieldDesc::Scalar(ScalarKind::Int)),
                ("count", FieldDesc::Scalar(ScalarKind::Int)),
                ("flag", FieldDesc::Scalar(ScalarKind::Int)),
            ],
        )
    }

    /// Build a monitor update payload: changed set, masked data, overrun set.
    fn update_payload(desc: &Arc<FieldDesc>, changed: &[usize], values: &[(usize, i32)]) -> BytesMut {
        let changed = BitSet::from_bits(changed.iter().copied());
        let mut source = PvStructure::zeroed(desc);
        let names = ["value", "count", "flag"];
        for (offset, v) in values {
            *source.field_mut(names[offset - 1]).unwrap() = PvValue::Int(*v);
        }
        let mut buf = BytesMut::new();
        changed.serialize(&mut buf);
        source.serialize_masked(&mut buf, &changed);
        BitSet::new().serialize(&mut buf);
        buf
    }

    #[test]
    fn monitor_single_coalesces_updates() {
        let desc = three_field_desc();
        let mut queue = MonitorQueue::for_queue_size(Some(2));
        queue.init(&desc);

        // three updates with changed sets {1}, {2}, {1} and no poll between
        let first = update_payload(&desc, &[1], &[(1, 10)]);
        assert!(queue
            .response(&mut PayloadReader::new(&first, true))
            .unwrap());
        let second = update_payload(&desc, &[2], &[(2, 20)]);
        assert!(!queue
            .response(&mut PayloadReader::new(&second, true))
            .unwrap());
        let third = update_payload(&desc, &[1], &[(1, 11)]);
        assert!(!queue
            .response(&mut PayloadReader::new(&third, true))
            .unwrap());

        let element = queue.poll().unwrap();
        assert_eq!(element.changed, BitSet::from_bits([1, 2]));
        assert_eq!(element.overrun, BitSet::from_bits([1]));
        let value = element.value.unwrap();
        assert_eq!(value.field("value"), Some(&PvValue::Int(11)));
        assert_eq!(value.field("count"), Some(&PvValue::Int(20)));

        // release resets the slot; the next update is a fresh first element
        queue.release();
        assert!(queue.poll().is_none());
        let fresh = update_payload(&desc, &[3], &[(3, 5)]);
        assert!(queue
            .response(&mut PayloadReader::new(&fresh, true))
            .unwrap());
        let element = queue.poll().unwrap();
        assert_eq!(element.changed, BitSet::from_bits([3]));
        assert!(element.overrun.is_empty());
    }

    #[test]
    fn monitor_single_reported_changes_cover_inputs() {
        let desc = three_field_desc();
        let mut queue = MonitorQueue::for_queue_size(None);
        queue.init(&desc);
        let inputs: Vec<Vec<usize>> = vec![vec![1], vec![2, 3], vec![3], vec![1]];
        for changed in &inputs {
            let payload = update_payload(&desc, changed, &[]);
            queue
                .response(&mut PayloadReader::new(&payload, true))
                .unwrap();
        }
        let element = queue.poll().unwrap();
        // OR of reported == OR of inputs ({1,2,3} compresses to the root)
        assert_eq!(element.changed, BitSet::from_bits([0]));
        // 3 and 1 each appeared twice without an intervening poll
        assert_eq!(element.overrun, BitSet::from_bits([1, 3]));
    }

    #[test]
    fn monitor_notify_carries_no_data() {
        let mut queue = MonitorQueue::for_queue_size(Some(-1));
        let desc = three_field_desc();
        queue.init(&desc);
        let payload = update_payload(&desc, &[1], &[(1, 1)]);
        assert!(queue
            .response(&mut PayloadReader::new(&payload, true))
            .unwrap());
        let element = queue.poll().unwrap();
        assert!(element.value.is_none());
        queue.release();
        assert!(queue.poll().is_none());
    }

    #[test]
    fn monitor_entire_delivers_every_update() {
        let desc = three_field_desc();
        let mut queue = MonitorQueue::for_queue_size(Some(0));
        queue.init(&desc);
        let first = update_payload(&desc, &[1], &[(1, 1)]);
        assert!(queue
            .response(&mut PayloadReader::new(&first, true))
            .unwrap());
        // every update notifies, even while an element is buffered
        let second = update_payload(&desc, &[2], &[(2, 2)]);
        assert!(queue
            .response(&mut PayloadReader::new(&second, true))
            .unwrap());
        let element = queue.poll().unwrap();
        assert_eq!(element.changed, BitSet::from_bits([2]));
    }

    #[test]
    fn monitor_start_requires_connection() {
        let mut queue = MonitorQueue::for_queue_size(Some(2));
        assert!(!queue.start().is_success());
        queue.init(&three_field_desc());
        assert!(queue.start().is_success());
    }

    #[tokio::test]
    async fn registration_tracks_context_and_channel_maps() {
        use crate::client::context::{ClientConfig, ClientContext};
        use crate::client::requesters::{ChannelRequester, ConnectionState};

        struct Quiet;
        impl Requester for Quiet {}
        impl ChannelRequester for Quiet {
            fn channel_created(&self, _status: Status) {}
            fn channel_state_change(&self, _state: ConnectionState) {}
        }

        struct Collector(Mutex<Vec<Status>>);
        impl Requester for Collector {}
        impl ChannelGetRequester for Collector {
            fn channel_get_connect(&self, status: Status, _data: Option<&SharedValue>) {
                self.0.lock().unwrap().push(status);
            }
            fn get_done(&self, status: Status) {
                self.0.lock().unwrap().push(status);
            }
        }

        let context = ClientContext::with_config(ClientConfig {
            broadcast_port: 0,
            broadcast_addresses: Some(Vec::new()),
            ..ClientConfig::default()
        })
        .await
        .unwrap();
        let channel = context
            .provider()
            .create_channel("reg:pv", Arc::new(Quiet), 0, None)
            .unwrap();

        let requester = Arc::new(Collector(Mutex::new(Vec::new())));
        let get = create_get(&channel, requester.clone(), Some(PvRequest::all()));
        // the IOID lives in the context map and the channel map together
        assert_eq!(context.pending_count(), 1);
        assert_eq!(channel.request_count(), 1);
        // the channel never connected, so the connect fails synchronously
        {
            let events = requester.0.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].message, "channel not connected");
        }

        get.destroy();
        assert_eq!(context.pending_count(), 0);
        assert_eq!(channel.request_count(), 0);
        // cancelling twice behaves identically to once: no extra events
        get.destroy();
        get.cancel();
        assert_eq!(requester.0.lock().unwrap().len(), 1);

        context.destroy();
    }

    #[test]
    fn queue_size_selection() {
        assert!(matches!(
            MonitorQueue::for_queue_size(Some(-1)),
            MonitorQueue::Notify { .. }
        ));
        assert!(matches!(
            MonitorQueue::for_queue_size(Some(0)),
            MonitorQueue::Entire { .. }
        ));
        assert!(matches!(
            MonitorQueue::for_queue_size(Some(2)),
            MonitorQueue::Single { .. }
        ));
        assert!(matches!(
            MonitorQueue::for_queue_size(None),
            MonitorQueue::Single { .. }
        ));
    }
}
