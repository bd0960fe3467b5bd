// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `tokio`-driven datagram loop around [`ServerHandler`], for callers who
//! already run an async runtime and would rather not dedicate a blocking
//! thread to `recv_from`. The dispatch logic itself is unchanged — this
//! module only supplies the socket loop, mirroring how `rpc::server` keeps
//! its sync `RequestHandler` and adds a thin async driver on top rather than
//! forking the handler into two implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::server::ServerHandler;
use crate::wire;

/// Binds `addr` and serves requests until `shutdown` resolves, or forever
/// if the caller passes `std::future::pending()`.
///
/// Each inbound datagram is decoded and dispatched on the current task;
/// `ServerHandler::handle` is synchronous (it only touches in-memory caches
/// and the [`crate::contracts::Fetcher`] the caller supplied), so it runs
/// via [`tokio::task::spawn_blocking`] to avoid stalling the reactor if that
/// fetcher performs blocking I/O.
pub async fn serve_udp(
    addr: SocketAddr,
    handler: Arc<ServerHandler>,
    psk: Vec<u8>,
    mut shutdown: impl std::future::Future<Output = ()> + Unpin,
) -> std::io::Result<()> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let mut buf = vec![0u8; 65535];
    loop {
        let recv = socket.recv_from(&mut buf);
        tokio::select! {
            () = &mut shutdown => return Ok(()),
            result = recv => {
                let (len, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("akari-udp async server recv error: {e}");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let handler = handler.clone();
                let psk = psk.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    handle_one(&handler, &psk, &datagram, peer, &socket).await;
                });
            }
        }
    }
}

async fn handle_one(handler: &Arc<ServerHandler>, psk: &[u8], datagram: &[u8], peer: SocketAddr, socket: &UdpSocket) {
    let packet = match wire::decode(datagram, psk) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("akari-udp async server: dropping undecodable datagram from {peer}: {e}");
            return;
        }
    };
    let handler = handler.clone();
    let outgoing = match tokio::task::spawn_blocking(move || handler.handle(&packet)).await {
        Ok(datagrams) => datagrams,
        Err(e) => {
            log::warn!("akari-udp async server: handler task panicked: {e}");
            return;
        }
    };
    for datagram in outgoing {
        if let Err(e) = socket.send_to(&datagram, peer).await {
            log::warn!("akari-udp async server: send to {peer} failed: {e}");
        }
    }
}
