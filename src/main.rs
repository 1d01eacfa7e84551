#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use gap_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.network.peers.is_empty() {
        log::warn!(
            "No peers are configured; the node will answer local clients but route nothing :-)"
        );
    }

    gap_server::startup(config).await
}
