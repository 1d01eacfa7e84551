use crate::{Node, config::Config, server::PeerDirectory};

use std::{io::ErrorKind::ConnectionReset, net::UdpSocket, sync::Arc, thread};

use codec::{HEADER_SIZE, P2P_QUERY, P2P_REPLY};

use super::client::ClientRegistry;

/// The peer-to-peer receive path.
///
/// Reads datagrams, splits them into frames (the fill ticker packs
/// several into one packet) and dispatches each to the engine. Unknown
/// senders are dropped before any parsing.
pub fn listen(
    config: &Config,
    node: Arc<Node<ClientRegistry>>,
    socket: &UdpSocket,
    directory: Arc<PeerDirectory>,
) -> anyhow::Result<()> {
    let local_addr = socket.local_addr()?;
    for _ in 0..config.network.max_threads.max(1) {
        let socket = socket.try_clone()?;
        let node = node.clone();
        let directory = directory.clone();
        let mtu = config.network.mtu;

        thread::spawn(move || {
            let mut buf = vec![0u8; mtu * 2];
            loop {
                let (size, address) = match socket.recv_from(&mut buf) {
                    Ok(it) => it,
                    // The remote endpoint going away is not our problem.
                    Err(e) if e.kind() == ConnectionReset => continue,
                    Err(e) => {
                        log::error!("receive on {local_addr} failed: {e}");
                        break;
                    }
                };

                let Some(peer) = directory.identify(&address) else {
                    log::trace!("datagram from unknown address {address}");
                    continue;
                };

                let mut offset = 0;
                while offset + HEADER_SIZE <= size {
                    let frame =
                        u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;

                    if frame < HEADER_SIZE || offset + frame > size {
                        // A literally impossible frame size; nothing
                        // after it can be trusted either.
                        node.stats.protocol_violations.add(1);
                        break;
                    }

                    let bytes = &buf[offset..offset + frame];
                    let kind = u16::from_be_bytes(bytes[2..4].try_into().unwrap());
                    let result = match kind {
                        P2P_QUERY => {
                            node.traffic.record(&peer);
                            node.engine.handle_query(&peer, bytes)
                        }
                        P2P_REPLY => node.engine.handle_reply(Some(&peer), bytes),
                        _ => {
                            log::debug!("unknown message type {kind} from {:?}", peer);
                            Ok(())
                        }
                    };

                    if let Err(e) = result {
                        log::debug!("frame from {:?} rejected: {e}", peer);
                    }

                    offset += frame;
                }
            }
        });
    }

    log::info!(
        "p2p transport listening: listen={}, peers={}",
        local_addr,
        config.network.peers.len()
    );

    Ok(())
}
