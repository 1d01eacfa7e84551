pub mod client;
pub mod udp;

use crate::{Node, config::Config};

use std::{
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    thread,
    time::Duration,
};

use ahash::AHashMap;
use codec::PeerId;
use parking_lot::RwLock;
use routing::{Topology, Transport};

use self::client::ClientRegistry;

/// The statically configured neighbourhood.
///
/// Maps peer identities to datagram addresses and back. Connectivity is
/// assumed for every configured peer; a dynamic connection manager would
/// replace this wholesale.
pub struct PeerDirectory {
    by_id: RwLock<AHashMap<PeerId, SocketAddr>>,
    by_addr: RwLock<AHashMap<SocketAddr, PeerId>>,
}

impl PeerDirectory {
    pub fn new(peers: &[crate::config::Peer]) -> Self {
        let mut by_id = AHashMap::with_capacity(peers.len());
        let mut by_addr = AHashMap::with_capacity(peers.len());
        for it in peers {
            by_id.insert(it.id, it.address);
            by_addr.insert(it.address, it.id);
        }

        Self {
            by_id: RwLock::new(by_id),
            by_addr: RwLock::new(by_addr),
        }
    }

    pub fn identify(&self, address: &SocketAddr) -> Option<PeerId> {
        self.by_addr.read().get(address).copied()
    }

    pub fn address_of(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.by_id.read().get(peer).copied()
    }

    pub fn all(&self) -> Vec<PeerId> {
        self.by_id.read().keys().copied().collect()
    }
}

impl Topology for PeerDirectory {
    fn estimate_network_size(&self) -> u32 {
        (self.by_id.read().len() as u32).max(1)
    }
}

/// The datagram transport the engine sends through.
pub struct UdpTransport {
    socket: UdpSocket,
    directory: Arc<PeerDirectory>,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket, directory: Arc<PeerDirectory>) -> Self {
        Self { socket, directory }
    }
}

impl Transport for UdpTransport {
    fn unicast(&self, peer: &PeerId, bytes: &[u8], _priority: u32, _deadline: i64) {
        let Some(address) = self.directory.address_of(peer) else {
            log::debug!("no address for peer {:?}, dropping frame", peer);
            return;
        };

        if let Err(e) = self.socket.send_to(bytes, address) {
            log::warn!("send to {address} failed: {e}");
        }
    }

    fn for_each_connected(&self, callback: &mut dyn FnMut(&PeerId)) {
        for peer in self.directory.all() {
            callback(&peer);
        }
    }
}

/// Bring the whole server up: receive threads, the fill ticker and the
/// client listener.
pub fn start(
    config: &Config,
    node: Arc<Node<ClientRegistry>>,
    socket: UdpSocket,
    directory: Arc<PeerDirectory>,
) -> anyhow::Result<()> {
    udp::listen(config, node.clone(), &socket, directory.clone())?;
    client::listen(config, node.clone())?;

    // The fill ticker. Whenever a datagram with spare room would go out,
    // the spare bytes carry pending queries and migrating content; with a
    // datagram transport there is no organic "spare room", so a periodic
    // tick stands in for it.
    let mtu = config.network.mtu;
    thread::spawn(move || {
        let mut buf = vec![0u8; mtu];
        loop {
            for peer in directory.all() {
                let mut written = node.engine.fill(&peer, &mut buf);
                written += node
                    .migration
                    .fill(&node.engine, &peer, &mut buf[written..]);

                if written > 0 {
                    if let Some(address) = directory.address_of(&peer) {
                        if let Err(e) = socket.send_to(&buf[..written], address) {
                            log::warn!("fill send to {address} failed: {e}");
                        }
                    }
                }
            }

            thread::sleep(Duration::from_millis(1_000));
        }
    });

    Ok(())
}
