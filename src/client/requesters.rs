//! Callback traits through which operation results reach the application,
//! and the canonical statuses the client machinery reports.
//!
//! Every callback is invoked with no client lock held, and a panic inside a
//! callback is contained and logged rather than allowed back into protocol
//! machinery.

use std::sync::{Arc, Mutex};

use tracing::error;

use crate::{
    data::{FieldDesc, PvStructure, PvValue},
    messages::MessageKind,
    wire::{BitSet, Status},
};

/// Channel connection lifecycle, as reported to [`ChannelRequester`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NeverConnected,
    Connected,
    Disconnected,
    Destroyed,
}

/// A structure value plus the bit set naming which fields changed.
#[derive(Debug, Clone)]
pub struct ValueSlot {
    pub value: PvStructure,
    pub changed: BitSet,
}

impl ValueSlot {
    pub(crate) fn new(value: PvStructure) -> ValueSlot {
        ValueSlot {
            value,
            changed: BitSet::new(),
        }
    }
}

/// Shared handle to operation data: the client deserializes into it, the
/// application reads (or, for puts, writes) through it.
pub type SharedValue = Arc<Mutex<ValueSlot>>;

/// Shared handle to a bulk-array operation's element data.
pub type SharedArray = Arc<Mutex<PvValue>>;

/// Base callback surface shared by every requester.
pub trait Requester: Send + Sync {
    /// A server-originated message (command 18) about this request.
    fn message(&self, text: &str, kind: MessageKind) {
        tracing::info!(?kind, "server message: {text}");
    }
}

pub trait ChannelRequester: Requester {
    /// The provider finished creating the channel object.
    fn channel_created(&self, status: Status);
    fn channel_state_change(&self, state: ConnectionState);
}

pub trait ChannelProcessRequester: Requester {
    fn channel_process_connect(&self, status: Status);
    fn process_done(&self, status: Status);
}

pub trait ChannelGetRequester: Requester {
    /// INIT completed; on success `data` is the slot results are applied to.
    fn channel_get_connect(&self, status: Status, data: Option<&SharedValue>);
    fn get_done(&self, status: Status);
}

pub trait ChannelPutRequester: Requester {
    /// INIT completed; on success `data` is the slot the application fills
    /// (value plus changed bit set) before calling `put`.
    fn channel_put_connect(&self, status: Status, data: Option<&SharedValue>);
    fn put_done(&self, status: Status);
    /// Completion of a get-of-put.
    fn get_done(&self, status: Status);
}

pub trait ChannelPutGetRequester: Requester {
    fn channel_put_get_connect(
        &self,
        status: Status,
        put_data: Option<&SharedValue>,
        get_data: Option<&SharedValue>,
    );
    fn put_get_done(&self, status: Status);
    fn get_get_done(&self, status: Status);
    fn get_put_done(&self, status: Status);
}

pub trait ChannelRpcRequester: Requester {
    /// INIT completed; on success `argument` is the slot the application
    /// fills before calling `request`.
    fn channel_rpc_connect(&self, status: Status, argument: Option<&SharedValue>);
    fn request_done(&self, status: Status, response: Option<PvStructure>);
}

pub trait ChannelArrayRequester: Requester {
    fn channel_array_connect(&self, status: Status, data: Option<&SharedArray>);
    fn get_array_done(&self, status: Status);
    fn put_array_done(&self, status: Status);
    fn set_length_done(&self, status: Status);
}

pub trait MonitorRequester: Requester {
    fn monitor_connect(&self, status: Status, structure: Option<&Arc<FieldDesc>>);
    /// At least one element is ready to poll.
    fn monitor_event(&self);
    /// The channel lost its circuit; the subscription will be re-established
    /// automatically on reconnect.
    fn monitor_disconnect(&self) {}
}

pub trait GetFieldRequester: Requester {
    fn get_done(&self, status: Status, field: Option<Arc<FieldDesc>>);
}

/// The canonical statuses reported by the client machinery.
pub mod statuses {
    use crate::wire::Status;

    pub fn channel_destroyed() -> Status {
        Status::warning("channel destroyed")
    }

    pub fn channel_disconnected() -> Status {
        Status::warning("channel disconnected")
    }

    pub fn not_initialized() -> Status {
        Status::error("request not initialized")
    }

    pub fn request_destroyed() -> Status {
        Status::error("request destroyed")
    }

    pub fn channel_not_connected() -> Status {
        Status::error("channel not connected")
    }

    pub fn other_request_pending() -> Status {
        Status::error("other request pending")
    }

    pub fn pv_request_null() -> Status {
        Status::error("pvRequest == 0")
    }

    pub fn request_cancelled() -> Status {
        Status::error("request cancelled")
    }
}

/// Run a user callback, containing any panic so it cannot unwind into the
/// transport or dispatch machinery.
pub(crate) fn guard_callback<F: FnOnce()>(what: &str, callback: F) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        error!("Unhandled panic from client code in {what}: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_contains_panics() {
        guard_callback("test", || panic!("boom"));
        let mut reached = false;
        guard_callback("test", || reached = true);
        assert!(reached);
    }

    #[test]
    fn status_texts_match_protocol() {
        assert_eq!(statuses::channel_destroyed().message, "channel destroyed");
        assert!(statuses::channel_destroyed().is_success());
        assert!(!statuses::other_request_pending().is_success());
    }
}
