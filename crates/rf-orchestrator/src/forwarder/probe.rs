//! Port availability and liveness probes

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};

use rf_core::error::{ForwarderError, Transport};

/// Check that neither the TCP nor the UDP listen port is bound.
///
/// The TCP check sets `SO_REUSEADDR` like the listener does, so sockets
/// lingering in `TIME_WAIT` do not count as bound.
pub fn check_port_available(ip: IpAddr, port: u16) -> Result<(), ForwarderError> {
    let addr = SocketAddr::new(ip, port);
    let in_use = |transport, source| ForwarderError::PortInUse {
        port,
        transport,
        source,
    };

    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4(),
        IpAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|source| ForwarderError::Launch { port, source })?;
    socket
        .set_reuseaddr(true)
        .map_err(|source| ForwarderError::Launch { port, source })?;
    socket.bind(addr).map_err(|e| in_use(Transport::Tcp, e))?;
    drop(socket);

    std::net::UdpSocket::bind(addr).map_err(|e| in_use(Transport::Udp, e))?;
    Ok(())
}

/// Connect to `addr` within `timeout`.
///
/// Connect only: nothing is written, so no probe datagram or bytes ever reach
/// the tunnel backend. A forwarder whose TCP listener accepts is taken as live;
/// its relay loops are checked separately through `ForwarderInstance::is_alive`.
pub async fn probe_liveness(addr: SocketAddr, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("connect to {} failed: {}", addr, e)),
        Err(_) => Err(format!("connect to {} timed out after {:?}", addr, timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_free_port_is_available() {
        let port = {
            let listener = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(check_port_available(LOOPBACK, port).is_ok());
    }

    #[test]
    fn test_udp_binding_detected() {
        let udp = std::net::UdpSocket::bind((LOOPBACK, 0)).unwrap();
        let port = udp.local_addr().unwrap().port();

        assert!(matches!(
            check_port_available(LOOPBACK, port),
            Err(ForwarderError::PortInUse {
                transport: Transport::Udp,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_tcp_listener_detected() {
        let listener = tokio::net::TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(matches!(
            check_port_available(LOOPBACK, port),
            Err(ForwarderError::PortInUse {
                transport: Transport::Tcp,
                ..
            })
        ));
        assert!(probe_liveness(SocketAddr::new(LOOPBACK, port), Duration::from_secs(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_probe_fails_without_listener() {
        let port = {
            let listener = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(probe_liveness(SocketAddr::new(LOOPBACK, port), Duration::from_secs(1))
            .await
            .is_err());
    }
}
