//! Per-server beacon bookkeeping.
//!
//! Servers announce liveness over UDP with a sequential id that is monotone
//! within one server startup, plus the startup timestamp itself. A changed
//! startup timestamp or a backward jump in the sequential id means the
//! server restarted, which is the trigger for re-searching disconnected
//! channels immediately.

use std::net::SocketAddr;

use tracing::debug;

use crate::messages::Beacon;

/// Liveness state for one server endpoint.
#[derive(Debug)]
pub(crate) struct BeaconHandler {
    server: SocketAddr,
    last: Option<BeaconSample>,
}

#[derive(Debug, Clone, Copy)]
struct BeaconSample {
    sequence_id: u16,
    startup_secs: i64,
    startup_nanos: i32,
}

impl BeaconHandler {
    pub fn new(server: SocketAddr) -> BeaconHandler {
        BeaconHandler { server, last: None }
    }

    /// Record a beacon; returns true when it signals a server restart.
    ///
    /// The first beacon from a server only establishes the baseline. A
    /// duplicate sequential id is tolerated (UDP may deliver a packet on
    /// several interfaces); a regression is an anomaly.
    pub fn beacon_notify(&mut self, beacon: &Beacon) -> bool {
        let sample = BeaconSample {
            sequence_id: beacon.sequence_id,
            startup_secs: beacon.startup_secs,
            startup_nanos: beacon.startup_nanos,
        };
        let Some(last) = self.last.replace(sample) else {
            debug!("First beacon from {}", self.server);
            return false;
        };
        if last.startup_secs != sample.startup_secs || last.startup_nanos != sample.startup_nanos {
            debug!("Beacon anomaly from {}: startup timestamp changed", self.server);
            return true;
        }
        let delta = sample.sequence_id.wrapping_sub(last.sequence_id) as i16;
        if delta < 0 {
            debug!(
                "Beacon anomaly from {}: sequential id went backwards ({} after {})",
                self.server, sample.sequence_id, last.sequence_id
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn beacon(sequence_id: u16, startup_secs: i64) -> Beacon {
        Beacon::new(sequence_id, startup_secs, Ipv4Addr::LOCALHOST, 5075)
    }

    #[test]
    fn first_beacon_is_quiet() {
        let mut handler = BeaconHandler::new("127.0.0.1:5075".parse().unwrap());
        assert!(!handler.beacon_notify(&beacon(10, 100)));
    }

    #[test]
    fn monotone_sequence_is_quiet() {
        let mut handler = BeaconHandler::new("127.0.0.1:5075".parse().unwrap());
        assert!(!handler.beacon_notify(&beacon(10, 100)));
        assert!(!handler.beacon_notify(&beacon(11, 100)));
        assert!(!handler.beacon_notify(&beacon(11, 100))); // duplicate delivery
        assert!(!handler.beacon_notify(&beacon(400, 100)));
    }

    #[test]
    fn sequence_wrap_is_quiet() {
        let mut handler = BeaconHandler::new("127.0.0.1:5075".parse().unwrap());
        assert!(!handler.beacon_notify(&beacon(u16::MAX, 100)));
        assert!(!handler.beacon_notify(&beacon(0, 100)));
    }

    #[test]
    fn sequence_regression_is_anomaly() {
        let mut handler = BeaconHandler::new("127.0.0.1:5075".parse().unwrap());
        assert!(!handler.beacon_notify(&beacon(500, 100)));
        assert!(handler.beacon_notify(&beacon(2, 100)));
    }

    #[test]
    fn startup_change_is_anomaly() {
        let mut handler = BeaconHandler::new("127.0.0.1:5075".parse().unwrap());
        assert!(!handler.beacon_notify(&beacon(10, 100)));
        assert!(handler.beacon_notify(&beacon(11, 200)));
    }
}
