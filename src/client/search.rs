//! UDP channel search with exponential back-off.
//!
//! Channels in the searching state live in a single task that owns the
//! search socket. The task batches every due channel into as few MTU-sized
//! frames as possible, broadcasts them, and backs each channel off
//! geometrically up to a configurable ceiling. A beacon anomaly (server
//! restart) promotes every searching channel to immediate emission.
//!
//! Search replies arrive on the same socket and are matched back to their
//! channels by CID; replies received on other transports are forwarded into
//! the task through its command channel.

use std::{
    cmp::min,
    collections::HashMap,
    future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tokio::{io, net::UdpSocket, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    client::channel::Channel,
    messages::{SearchRequest, SearchResponse, append_frame, parse_datagram},
    utils::wrapping_inplace_add,
    wire::{FrameHeader, MAX_UDP_SEND, PayloadReader, commands},
};

pub(crate) enum SearchCommand {
    Register(Arc<Channel>),
    Unregister(u32),
    BeaconAnomaly,
    Response {
        origin: SocketAddr,
        response: SearchResponse,
        minor_revision: u8,
    },
}

/// Handle through which the rest of the client talks to the search task.
pub(crate) struct SearchManager {
    command_tx: mpsc::UnboundedSender<SearchCommand>,
}

impl SearchManager {
    /// Bind the search socket and start the task.
    pub async fn start(
        broadcast_addresses: Vec<SocketAddr>,
        max_interval: Duration,
        cancel: CancellationToken,
    ) -> io::Result<SearchManager> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = SearchTask {
            socket,
            broadcast_addresses,
            entries: HashMap::new(),
            sequence_id: 0,
            max_interval,
            cancel,
        };
        tokio::spawn(task.run(command_rx));
        Ok(SearchManager { command_tx })
    }

    pub fn register(&self, channel: Arc<Channel>) {
        let _ = self.command_tx.send(SearchCommand::Register(channel));
    }

    pub fn unregister(&self, cid: u32) {
        let _ = self.command_tx.send(SearchCommand::Unregister(cid));
    }

    /// A server restarted somewhere: re-search everything immediately.
    pub fn beacon_anomaly(&self) {
        let _ = self.command_tx.send(SearchCommand::BeaconAnomaly);
    }

    /// Feed in a search response received on another transport.
    pub fn forward_response(&self, origin: SocketAddr, response: SearchResponse, minor_revision: u8) {
        let _ = self.command_tx.send(SearchCommand::Response {
            origin,
            response,
            minor_revision,
        });
    }
}

struct SearchEntry {
    channel: Weak<Channel>,
    name: String,
    /// Searches already emitted for this channel.
    attempts: u32,
    next_search_at: Instant,
}

struct SearchTask {
    socket: UdpSocket,
    broadcast_addresses: Vec<SocketAddr>,
    entries: HashMap<u32, SearchEntry>,
    sequence_id: i32,
    max_interval: Duration,
    cancel: CancellationToken,
}

impl SearchTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SearchCommand>) {
        let mut buf = vec![0u8; 0xFFFF];
        loop {
            let mut batch = Vec::new();
            select! {
                _ = self.cancel.cancelled() => break,
                count = commands.recv_many(&mut batch, 32) => {
                    if count == 0 {
                        break;
                    }
                    for command in batch {
                        self.handle_command(command);
                    }
                }
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((size, origin)) => self.handle_packet(&buf[..size], origin),
                    Err(e) => error!("Error waiting for search responses: {e}"),
                },
                _ = self.next_attempt() => self.emit_due().await,
            }
        }
    }

    fn handle_command(&mut self, command: SearchCommand) {
        match command {
            SearchCommand::Register(channel) => {
                debug!("Searching for channel '{}'", channel.name());
                self.entries.insert(
                    channel.cid(),
                    SearchEntry {
                        name: channel.name().to_string(),
                        channel: Arc::downgrade(&channel),
                        attempts: 0,
                        next_search_at: Instant::now(),
                    },
                );
            }
            SearchCommand::Unregister(cid) => {
                self.entries.remove(&cid);
            }
            SearchCommand::BeaconAnomaly => {
                debug!("Beacon anomaly: boosting {} searches", self.entries.len());
                let now = Instant::now();
                for entry in self.entries.values_mut() {
                    entry.attempts = 0;
                    entry.next_search_at = now;
                }
            }
            SearchCommand::Response {
                origin,
                response,
                minor_revision,
            } => self.handle_response(origin, response, minor_revision),
        }
    }

    fn handle_packet(&mut self, data: &[u8], origin: SocketAddr) {
        let Ok(frames) = parse_datagram(data) else {
            warn!("Received unparseable search response packet from {origin}");
            return;
        };
        for (header, payload) in frames {
            if header.command != commands::SEARCH_RESPONSE {
                trace!("Ignoring command {} on search socket", header.command);
                continue;
            }
            let mut reader = PayloadReader::for_frame(payload, &header);
            match SearchResponse::parse(&mut reader) {
                Ok(Some(response)) => {
                    self.handle_response(origin, response, header.minor_revision())
                }
                Ok(None) => {}
                Err(e) => warn!("Bad search response from {origin}: {e}"),
            }
        }
    }

    fn handle_response(&mut self, origin: SocketAddr, response: SearchResponse, minor: u8) {
        let server = response.server_endpoint(origin);
        for cid in &response.cids {
            let Some(entry) = self.entries.remove(cid) else {
                debug!("Received unrequested or duplicate search response for CID {cid}");
                continue;
            };
            let Some(channel) = entry.channel.upgrade() else {
                continue;
            };
            debug!("Found server for '{}': {server}", entry.name);
            channel.search_response(minor, server);
        }
    }

    /// Wait until the earliest pending attempt is due.
    fn next_attempt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        match self.entries.values().map(|e| e.next_search_at).min() {
            None => Box::pin(future::pending()),
            Some(instant) => {
                if instant < Instant::now() {
                    Box::pin(future::ready(()))
                } else {
                    Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
                        instant,
                    )))
                }
            }
        }
    }

    async fn emit_due(&mut self) {
        let now = Instant::now();
        // dead channels fall out of the searching set here
        self.entries.retain(|_, e| e.channel.upgrade().is_some());

        let mut due = Vec::new();
        let max_interval = self.max_interval;
        for (cid, entry) in self.entries.iter_mut() {
            if entry.next_search_at > now {
                continue;
            }
            entry.attempts += 1;
            entry.next_search_at = now + backoff_delay(entry.attempts, max_interval);
            due.push((*cid, entry.name.clone()));
        }
        if due.is_empty() {
            return;
        }

        for frame_channels in batch_entries(due) {
            let request = SearchRequest {
                sequence_id: wrapping_inplace_add(&mut self.sequence_id),
                channels: frame_channels,
            };
            let mut payload = BytesMut::new();
            request.serialize(&mut payload);
            let mut packet = BytesMut::new();
            append_frame(&mut packet, commands::SEARCH_REQUEST, &payload);
            for addr in &self.broadcast_addresses {
                trace!("Sending search packet to {addr}");
                if let Err(e) = self.socket.send_to(&packet, *addr).await {
                    warn!("Failed to send search to {addr}: {e}");
                }
            }
        }
    }
}

/// Delay before the next search after `attempts` emissions: geometric from
/// 64 ms, capped at `max_interval`.
fn backoff_delay(attempts: u32, max_interval: Duration) -> Duration {
    let exponential = Duration::from_millis(32 * 2u64.pow(min(attempts, 11)));
    min(exponential, max_interval)
}

/// Split the due channels into frames that honor the UDP MTU.
fn batch_entries(due: Vec<(u32, String)>) -> Vec<Vec<(u32, String)>> {
    // sequence id + count
    const FRAME_FIXED: usize = 4 + 2;
    let budget = MAX_UDP_SEND - FrameHeader::LEN - FRAME_FIXED;
    let mut frames = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for (cid, name) in due {
        let size = SearchRequest::entry_size(&name);
        if !current.is_empty() && used + size > budget {
            frames.push(std::mem::take(&mut current));
            used = 0;
        }
        used += size;
        current.push((cid, name));
    }
    if !current.is_empty() {
        frames.push(current);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_capped() {
        let max = Duration::from_secs(60);
        let mut last = Duration::ZERO;
        for attempts in 1..64 {
            let delay = backoff_delay(attempts, max);
            assert!(delay >= last, "attempt {attempts} went backwards");
            assert!(delay <= max);
            last = delay;
        }
        assert_eq!(backoff_delay(1000, max), max);
        // does not overflow for absurd attempt counts
        assert_eq!(backoff_delay(u32::MAX, max), max);
    }

    #[test]
    fn backoff_grows_geometrically() {
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(1, max), Duration::from_millis(64));
        assert_eq!(backoff_delay(2, max), Duration::from_millis(128));
        assert_eq!(backoff_delay(3, max), Duration::from_millis(256));
    }

    #[test]
    fn batching_honors_the_mtu() {
        let name = "a".repeat(100);
        let due: Vec<(u32, String)> = (0..100).map(|i| (i, name.clone())).collect();
        let frames = batch_entries(due);
        assert!(frames.len() > 1);
        for frame in &frames {
            let size: usize = frame
                .iter()
                .map(|(_, name)| SearchRequest::entry_size(name))
                .sum();
            assert!(size + FrameHeader::LEN + 6 <= MAX_UDP_SEND);
        }
        let total: usize = frames.iter().map(Vec::len).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn oversized_single_entry_still_gets_a_frame() {
        let huge = "x".repeat(2000);
        let frames = batch_entries(vec![(1, huge)]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 1);
    }

    #[tokio::test]
    async fn beacon_anomaly_promotes_entries_to_immediate() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut task = SearchTask {
            socket,
            broadcast_addresses: Vec::new(),
            entries: HashMap::new(),
            sequence_id: 0,
            max_interval: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        };
        // a channel that has backed off far into the future
        task.entries.insert(
            7,
            SearchEntry {
                channel: Weak::new(),
                name: "nope".to_string(),
                attempts: 9,
                next_search_at: Instant::now() + Duration::from_secs(500),
            },
        );
        task.handle_command(SearchCommand::BeaconAnomaly);
        let entry = &task.entries[&7];
        assert_eq!(entry.attempts, 0);
        assert!(entry.next_search_at <= Instant::now());
    }
}
