use num::{FromPrimitive, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{SocketAddr, ToSocketAddrs},
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = address.to_socket_addrs()?.next().unwrap();
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::from_u8(1).unwrap());
    id
}

/// Get the broadcast (beacon + search) port, either from environment or default 5076
pub fn get_default_broadcast_port() -> u16 {
    env::var("EPICS4_CA_BROADCAST_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5076u16)
}

/// Whether the interface broadcast addresses should be discovered at runtime
pub fn get_default_auto_addr_list() -> bool {
    env::var("EPICS4_CA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no") && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true)
}

/// Seconds without a beacon before a connected circuit is probed
pub fn get_default_connection_timeout() -> f32 {
    env::var("EPICS4_CA_CONN_TMO")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30.0f32)
        .max(0.1f32)
}

/// Period in seconds between two beacons from a healthy server
pub fn get_default_beacon_period() -> f32 {
    env::var("EPICS4_CA_BEACON_PERIOD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15.0f32)
        .max(0.1f32)
}

/// Receive buffer size (maximum payload we expect to be sent)
pub fn get_default_receive_buffer_size() -> usize {
    env::var("EPICS4_CA_MAX_ARRAY_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(crate::wire::MAX_TCP_RECV)
        .max(1024)
}

/// Ceiling for the search retry back-off
pub fn get_default_max_search_interval() -> f32 {
    env::var("EPICS4_CA_MAX_SEARCH_PERIOD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300.0f32)
        .max(60f32)
}

/// Get the target list of broadcast IPs, by reading the environment and interfaces
///
/// Hostnames are resolved if in the environment setting, so this will re-resolve
pub fn get_target_broadcast_ips(broadcast_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    if get_default_auto_addr_list() {
        ips.extend(
            datalink::interfaces()
                .into_iter()
                .filter(|i| !i.is_loopback())
                .flat_map(|i| i.ips.into_iter())
                .filter(|i| i.is_ipv4())
                .flat_map(|f| (f.broadcast(), broadcast_port).to_socket_addrs())
                .flatten(),
        );
    }
    if let Ok(addr_list) = env::var("EPICS4_CA_ADDR_LIST") {
        for add in addr_list.split_ascii_whitespace() {
            let resolved = if add.contains(":") {
                add.to_socket_addrs()
            } else {
                (add, broadcast_port).to_socket_addrs()
            };
            match resolved {
                Ok(addr) => {
                    debug!("Adding search IP: {add} => {addr:?}");
                    ips.extend(addr);
                }
                Err(e) => {
                    warn!("Failed to convert '{add}' to address: {e}");
                    continue;
                }
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_inplace_add() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut i = u32::MAX;
        assert_eq!(wrapping_inplace_add(&mut i), u32::MAX);
        assert_eq!(i, 0);
    }

    #[tokio::test]
    async fn reusable_socket_allows_two_binds() {
        let first = new_reusable_udp_socket("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let _second = new_reusable_udp_socket(format!("127.0.0.1:{port}")).unwrap();
    }
}
