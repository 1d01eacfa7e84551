use crate::{Node, config::Config, search, store};

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc::{Sender, channel},
    },
    thread,
};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use codec::{
    HEADER_SIZE, Key, MAX_FRAME_SIZE,
    client::{ClientPacket, SearchResult},
};
use parking_lot::Mutex;
use routing::{
    BlockValue,
    manager::{ClientId, ResponseSink},
};

/// Connected local clients and their outbound channels.
///
/// Doubles as the query manager's response sink: a delivered block is
/// encoded as a result frame and queued on the owning client's writer.
#[derive(Default, Clone)]
pub struct ClientRegistry {
    senders: Arc<Mutex<AHashMap<u64, Sender<Bytes>>>>,
}

impl ClientRegistry {
    fn register(&self, id: u64, sender: Sender<Bytes>) {
        self.senders.lock().insert(id, sender);
    }

    fn unregister(&self, id: u64) {
        self.senders.lock().remove(&id);
    }
}

impl ResponseSink for ClientRegistry {
    fn deliver(&self, client: ClientId, key: &Key, value: &BlockValue) {
        let mut bytes = BytesMut::with_capacity(HEADER_SIZE + 76 + value.data.len());
        let result = SearchResult {
            block_type: value.block_type,
            expiration: value.expiration,
            key: *key,
            data: &value.data,
        };

        if result.encode(&mut bytes).is_err() {
            return;
        }

        // The sink runs under the manager lock: hand off, never block.
        if let Some(sender) = self.senders.lock().get(&client.0) {
            let _ = sender.send(bytes.freeze());
        }
    }
}

/// Accept local client connections.
pub fn listen(config: &Config, node: Arc<Node<ClientRegistry>>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.client.listen)?;
    let local_addr = listener.local_addr()?;

    thread::spawn(move || {
        let next_id = AtomicU64::new(1);
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };

            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let node = node.clone();
            thread::spawn(move || serve(node, stream, id));
        }
    });

    log::info!("client interface listening: listen={local_addr}");
    Ok(())
}

fn serve(node: Arc<Node<ClientRegistry>>, stream: TcpStream, id: u64) {
    let registry = node.manager.sink().clone();
    let (sender, receiver) = channel::<Bytes>();
    registry.register(id, sender);

    // Writer half: drain delivered results onto the socket.
    {
        let mut stream = match stream.try_clone() {
            Ok(it) => it,
            Err(_) => {
                registry.unregister(id);
                return;
            }
        };

        thread::spawn(move || {
            while let Ok(bytes) = receiver.recv() {
                if stream.write_all(&bytes).is_err() {
                    break;
                }
            }
        });
    }

    let client = ClientId(id);
    let mut stream = stream;
    loop {
        match read_frame(&mut stream) {
            Some(frame) => {
                if let Err(e) = dispatch(&node, client, &frame) {
                    log::debug!("client {id} frame rejected: {e}");
                }
            }
            None => break,
        }
    }

    // Client gone: drop its channel and everything it was waiting for.
    registry.unregister(id);
    node.manager.client_exit(client);
    log::info!("client disconnected: id={id}");
}

fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).ok()?;
    let size = u16::from_be_bytes(header[0..2].try_into().unwrap()) as usize;
    if size < HEADER_SIZE || size > MAX_FRAME_SIZE {
        return None;
    }

    let mut frame = vec![0u8; size];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    stream.read_exact(&mut frame[HEADER_SIZE..]).ok()?;
    Some(frame)
}

fn dispatch(
    node: &Node<ClientRegistry>,
    client: ClientId,
    frame: &[u8],
) -> Result<(), anyhow::Error> {
    match codec::client::decode(frame)? {
        ClientPacket::SearchStart(request) => {
            let outcome = search::start_search(
                &node.engine,
                &node.manager,
                &node.observer,
                &node.lookup,
                client,
                &request,
            )?;

            log::debug!(
                "client {:?} search for {:?}: {:?}",
                client,
                request.keys[0],
                outcome
            );
        }
        ClientPacket::SearchStop(key) => {
            search::stop_search(&node.engine, &node.manager, client, &key);
        }
        ClientPacket::Insert(insert) => {
            let value = store::block(
                insert.block_type,
                insert.anonymity,
                insert.expiration,
                insert.data,
            );

            if node.observer.insert(&insert.key, value, insert.priority).is_err() {
                log::warn!("client {:?} inserted invalid content", client);
            }
        }
    }

    Ok(())
}
