//! Dispatch of received frames by command byte.
//!
//! A fixed 28-entry table routes circuit frames; commands outside the table
//! or assigned to no client behavior are logged and dropped, and the circuit
//! survives. Datagram packets (beacons, search replies) go through
//! [`dispatch_datagram`], which applies the same table semantics to the two
//! UDP receive paths.

use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, trace, warn};

use crate::{
    client::{context::ClientContext, transport::Circuit},
    messages::{Beacon, CreateChannelResponse, MessageKind, SearchResponse, Validation, parse_datagram},
    wire::{FrameHeader, PayloadReader, commands},
};

type Handler = fn(&Arc<ClientContext>, &Arc<Circuit>, &FrameHeader, &[u8]);

/// Response handlers indexed by command byte.
static HANDLER_TABLE: [Handler; commands::HANDLER_COUNT] = [
    handle_beacon,          /*  0 */
    handle_validation,      /*  1 */
    handle_noop,            /*  2 - echo */
    handle_noop,            /*  3 - search (server-only) */
    handle_search_response, /*  4 */
    handle_noop,            /*  5 - introspection search */
    handle_data_response,   /*  6 - introspection search data */
    handle_create_channel,  /*  7 */
    handle_noop,            /*  8 - destroy channel */
    handle_bad,             /*  9 */
    handle_data_response,   /* 10 - get */
    handle_data_response,   /* 11 - put */
    handle_data_response,   /* 12 - put-get */
    handle_data_response,   /* 13 - monitor */
    handle_data_response,   /* 14 - array */
    handle_bad,             /* 15 - cancel */
    handle_data_response,   /* 16 - process */
    handle_data_response,   /* 17 - get field */
    handle_message,         /* 18 - message to requester */
    handle_bad,             /* 19 - grouped monitors */
    handle_data_response,   /* 20 - rpc */
    handle_bad,             /* 21 */
    handle_bad,             /* 22 */
    handle_bad,             /* 23 */
    handle_bad,             /* 24 */
    handle_bad,             /* 25 */
    handle_bad,             /* 26 */
    handle_bad,             /* 27 */
];

/// Route one circuit frame to its handler.
pub(crate) fn handle_frame(
    context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    payload: &[u8],
) {
    let command = header.command as usize;
    if command >= commands::HANDLER_COUNT {
        warn!(
            "Invalid (or unsupported) command {} from {}",
            header.command,
            circuit.remote()
        );
        return;
    }
    HANDLER_TABLE[command](context, circuit, header, payload);
}

fn handle_noop(
    _context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    _payload: &[u8],
) {
    trace!("Ignoring command {} from {}", header.command, circuit.remote());
}

fn handle_bad(
    _context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    _payload: &[u8],
) {
    warn!(
        "Undecipherable message (bad response type {}) from {}",
        header.command,
        circuit.remote()
    );
}

fn handle_beacon(
    context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    _header: &FrameHeader,
    payload: &[u8],
) {
    if let Some(beacon) = Beacon::parse(payload) {
        context.beacon_notify(circuit.remote(), &beacon);
    }
}

fn handle_validation(
    _context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    payload: &[u8],
) {
    let mut reader = PayloadReader::for_frame(payload, header);
    match Validation::parse(&mut reader) {
        Ok(validation) => circuit.handle_validation(header, validation),
        Err(e) => warn!("Bad connection validation from {}: {e}", circuit.remote()),
    }
}

fn handle_search_response(
    context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    payload: &[u8],
) {
    let mut reader = PayloadReader::for_frame(payload, header);
    match SearchResponse::parse(&mut reader) {
        Ok(Some(response)) => {
            context
                .search()
                .forward_response(circuit.remote(), response, header.minor_revision());
        }
        Ok(None) => {}
        Err(e) => warn!("Bad search response from {}: {e}", circuit.remote()),
    }
}

fn handle_create_channel(
    context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    payload: &[u8],
) {
    let mut reader = PayloadReader::for_frame(payload, header);
    let response = match CreateChannelResponse::parse(&mut reader) {
        Ok(response) => response,
        Err(e) => {
            warn!("Bad create-channel response from {}: {e}", circuit.remote());
            return;
        }
    };
    let Some(channel) = context.get_channel(response.cid) else {
        debug!(
            "Create-channel response for unknown CID {} from {}",
            response.cid,
            circuit.remote()
        );
        return;
    };
    if response.status.is_success() {
        channel.connection_completed(response.sid);
    } else {
        debug!(
            "Channel '{}' creation failed: {}",
            channel.name(),
            response.status.message
        );
        channel.create_channel_failed();
    }
}

/// Route a data response by IOID. The lookup clones the operation `Arc` out
/// of the map under its lock, so the operation cannot be reclaimed while the
/// response is being delivered.
fn handle_data_response(
    context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    payload: &[u8],
) {
    let mut reader = PayloadReader::for_frame(payload, header);
    let Ok(ioid) = reader.u32() else {
        warn!("Truncated data response from {}", circuit.remote());
        return;
    };
    let Some(operation) = context.get_response_request(ioid) else {
        trace!("Data response for unknown IOID {ioid} from {}", circuit.remote());
        return;
    };
    operation.response(header, &mut reader, circuit);
}

fn handle_message(
    context: &Arc<ClientContext>,
    circuit: &Arc<Circuit>,
    header: &FrameHeader,
    payload: &[u8],
) {
    let mut reader = PayloadReader::for_frame(payload, header);
    let parsed = (|| -> Result<(u32, u8, String), crate::wire::WireError> {
        Ok((reader.u32()?, reader.u8()?, reader.string()?))
    })();
    match parsed {
        Ok((ioid, kind, text)) => {
            if let Some(operation) = context.get_response_request(ioid) {
                operation.requester_message(&text, MessageKind::from_byte(kind));
            }
        }
        Err(e) => warn!("Bad requester message from {}: {e}", circuit.remote()),
    }
}

/// Apply the handler-table semantics to one UDP packet, which may carry
/// several messages.
pub(crate) fn dispatch_datagram(context: &Arc<ClientContext>, data: &[u8], origin: SocketAddr) {
    let frames = match parse_datagram(data) {
        Ok(frames) => frames,
        Err(e) => {
            debug!("Unparseable datagram from {origin}: {e}");
            return;
        }
    };
    for (header, payload) in frames {
        match header.command {
            commands::BEACON => {
                if let Some(beacon) = Beacon::parse(payload) {
                    context.beacon_notify(origin, &beacon);
                }
            }
            commands::SEARCH_RESPONSE => {
                let mut reader = PayloadReader::for_frame(payload, &header);
                if let Ok(Some(response)) = SearchResponse::parse(&mut reader) {
                    context
                        .search()
                        .forward_response(origin, response, header.minor_revision());
                }
            }
            other => trace!("Ignoring datagram command {other} from {origin}"),
        }
    }
}
