pub mod config;
pub mod observer;
pub mod search;
pub mod server;
pub mod store;

use std::sync::Arc;

use codec::PeerId;
use rand::Rng;
use routing::{
    Topology, Transport,
    engine::{Engine, EngineOptions},
    lookup::{LookupJob, LookupWorker},
    manager::{QueryManager, ResponseSink},
    migration::MigrationPusher,
    stats::EngineStats,
    EXTREME_PRIORITY,
};

use self::{
    config::Config,
    observer::{IdleLoad, Observer, TrafficMonitor, TrustTable, payload_to_value},
    server::{PeerDirectory, UdpTransport, client::ClientRegistry},
    store::MemoryDatastore,
};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "gap-server.",
    env!("CARGO_PKG_VERSION")
);

/// One assembled node: the routing engine plus the file-sharing layer
/// around it.
pub struct Node<T>
where
    T: ResponseSink + 'static,
{
    pub my_id: PeerId,
    pub engine: Arc<Engine>,
    pub manager: Arc<QueryManager<T>>,
    pub observer: Arc<Observer<T>>,
    pub store: Arc<MemoryDatastore>,
    pub migration: Arc<MigrationPusher>,
    pub lookup: Arc<LookupWorker>,
    pub traffic: Arc<TrafficMonitor>,
    pub trust: Arc<TrustTable>,
    pub stats: Arc<EngineStats>,
}

impl<T> Node<T>
where
    T: ResponseSink + 'static,
{
    pub fn new(
        my_id: PeerId,
        routing: &config::Routing,
        transport: Arc<dyn Transport>,
        topology: Arc<dyn Topology>,
        sink: T,
    ) -> Self {
        let stats = Arc::new(EngineStats::default());
        let store = Arc::new(MemoryDatastore::default());
        let traffic = Arc::new(TrafficMonitor::default());
        let trust = Arc::new(TrustTable::default());
        let manager = Arc::new(QueryManager::new(sink, stats.clone()));
        let observer = Arc::new(Observer::new(store.clone(), manager.clone(), traffic.clone()));

        let engine = Engine::new(EngineOptions {
            my_id,
            table_size: routing.table_size,
            bitmap_keep_chance: routing.bitmap_keep_chance,
            hard_cpu_limit: routing.hard_cpu_limit,
            hard_upload_limit: routing.hard_upload_limit,
            blockstore: observer.clone(),
            transport,
            identity: trust.clone(),
            topology,
            traffic: Some(traffic.clone()),
            load: Arc::new(IdleLoad),
            stats: stats.clone(),
        });

        let migration = Arc::new(MigrationPusher::new(
            store.clone(),
            Some(traffic.clone()),
            stats.clone(),
        ));

        // The background worker probing the store for client searches;
        // everything it finds goes straight to the query manager.
        let lookup = {
            use routing::Blockstore;

            let observer = observer.clone();
            let manager = manager.clone();
            Arc::new(LookupWorker::new(move |job: LookupJob| {
                observer.get(job.block_type, EXTREME_PRIORITY, &job.keys, &mut |key, payload| {
                    if let Some(value) = payload_to_value(payload) {
                        manager.process_response(key, &value);
                    }

                    true
                });
            }))
        };

        Self {
            my_id,
            engine,
            manager,
            observer,
            store,
            migration,
            lookup,
            traffic,
            trust,
            stats,
        }
    }
}

/// Generate a throwaway identity for nodes that were not given one.
pub fn random_identity() -> PeerId {
    let mut bytes = [0u8; 64];
    rand::rng().fill(&mut bytes);
    PeerId(bytes)
}

/// In order to let integration tests use the crate directly and start
/// the node, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let socket = std::net::UdpSocket::bind(config.network.listen)?;
    let directory = Arc::new(PeerDirectory::new(&config.network.peers));
    let transport = Arc::new(UdpTransport::new(socket.try_clone()?, directory.clone()));

    let my_id = config.identity.unwrap_or_else(random_identity);
    log::info!("{} starting: identity={:?}", SOFTWARE, my_id);

    let node = Arc::new(Node::new(
        my_id,
        &config.routing,
        transport,
        directory.clone(),
        ClientRegistry::default(),
    ));

    server::start(&config, node, socket, directory)?;

    // The node is non-blocking after it runs; keep the process alive.
    std::future::pending::<()>().await;
    Ok(())
}
