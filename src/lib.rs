// #![warn(missing_docs)]

//! Rust client for the PVAccess protocol.
//!
//! This crate is a pure-rust client for [PVAccess], the network protocol
//! used to reach hierarchical, strongly-typed process variables in
//! distributed control systems. It does not depend on the C++ [pvAccessCPP]
//! project at all.
//!
//! The client locates named PVs with UDP broadcast searches, keeps one
//! long-lived TCP "virtual circuit" per server (shared by every channel to
//! that server at the same priority), and multiplexes channel operations -
//! introspection, one-shot get/put/rpc, processing, bulk arrays and
//! long-running monitors - over those circuits. Disconnected channels
//! re-search and re-establish their server-side state without application
//! involvement.
//!
//! The usual entry point is [`ClientContext::new`], then
//! [`ClientContext::provider`] to create channels.
//!
//! [PVAccess]:
//!     https://docs.epics-controls.org/en/latest/internal/pva-internals.html
//! [pvAccessCPP]: https://github.com/epics-base/pvAccessCPP

pub mod client;
pub mod data;
pub mod messages;
pub mod utils;
pub mod wire;

pub use client::{
    Channel, ChannelArray, ChannelArrayRequester, ChannelGet, ChannelGetRequester,
    ChannelProcess, ChannelProcessRequester, ChannelProvider, ChannelPut, ChannelPutGet,
    ChannelPutGetRequester, ChannelPutRequester, ChannelRequester, ChannelRpc,
    ChannelRpcRequester, ClientConfig, ClientContext, ConnectionState, ContextError,
    ContextState, GetFieldRequester, Monitor, MonitorElement, MonitorRequester, Requester,
    SharedArray, SharedValue, ValueSlot,
};
pub use data::{FieldDesc, PvRequest, PvStructure, PvValue, ScalarKind};
pub use wire::{BitSet, Status, StatusKind};
