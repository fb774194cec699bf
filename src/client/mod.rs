pub(crate) mod beacon;
pub mod channel;
pub mod context;
pub(crate) mod dispatch;
pub mod operations;
pub mod requesters;
pub(crate) mod search;
pub(crate) mod transport;

pub use channel::Channel;
pub use context::{
    ChannelProvider, ClientConfig, ClientContext, ContextError, ContextState, PRIORITY_DEFAULT,
    PRIORITY_MAX, PRIORITY_MIN,
};
pub use operations::{
    ChannelArray, ChannelGet, ChannelProcess, ChannelPut, ChannelPutGet, ChannelRpc, Monitor,
    MonitorElement,
};
pub use requesters::{
    ChannelArrayRequester, ChannelGetRequester, ChannelProcessRequester, ChannelPutGetRequester,
    ChannelPutRequester, ChannelRequester, ChannelRpcRequester, ConnectionState,
    GetFieldRequester, MonitorRequester, Requester, SharedArray, SharedValue, ValueSlot, statuses,
};
