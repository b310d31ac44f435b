//! UDP/53 front-end: bind with address reuse, loop on `recv_from`, and spawn
//! one short-lived handler per datagram. A malformed datagram is logged and
//! dropped; nothing a handler does can take the loop down.

use crate::codec;
use crate::race::RaceDispatcher;
use crate::error::SetupError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Largest datagram we accept; anything bigger is truncated by the kernel
/// and will fail to parse.
const MAX_DATAGRAM: usize = 8192;

/// Bind a non-blocking UDP socket with address reuse so the IPv4 and IPv6
/// instances can coexist on the same port.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, SetupError> {
    let bind = || -> std::io::Result<UdpSocket> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    };
    bind().map_err(|e| SetupError::Bind {
        addr,
        reason: match e.kind() {
            std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
            std::io::ErrorKind::AddrInUse => "already in use".to_string(),
            _ => e.to_string(),
        },
    })
}

/// Serve one bound socket until shutdown.
pub async fn serve(
    socket: UdpSocket,
    dispatcher: Arc<RaceDispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    info!("serving DNS on udp/{local}");
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("listener on {local} shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("recv on {local} failed: {e}");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let socket = socket.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    handle_datagram(datagram, src, socket, dispatcher).await;
                });
            }
        }
    }
}

async fn handle_datagram(
    datagram: Vec<u8>,
    src: SocketAddr,
    socket: Arc<UdpSocket>,
    dispatcher: Arc<RaceDispatcher>,
) {
    let inbound = match codec::parse_query(&datagram) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!("invalid message from {src}: {e}");
            return;
        }
    };

    let reply = match dispatcher.resolve(&inbound.query).await {
        Ok(answer) => match codec::build_response(&inbound, &answer) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("encoding answer for {src} failed: {e}");
                match codec::build_servfail(&inbound) {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
        },
        // Anything that escapes the race surfaces as SERVFAIL, never as a
        // dead handler.
        Err(e) => {
            debug!(
                "no answer for {} {} from {src}: {e}",
                inbound.query.qname, inbound.query.qtype
            );
            match codec::build_servfail(&inbound) {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };

    if let Err(e) = socket.send_to(&reply, src).await {
        warn!("send to {src} failed: {e}");
    }
}
