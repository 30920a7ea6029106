use std::sync::Arc;

use pricecast::bus::RedisTransport;
use pricecast::store::RedisPriceStore;
use pricecast::transport::start_websocket_server;
use pricecast::utils::logging;
use pricecast::{PriceFeed, load_config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> pricecast::Result<()> {
    dotenvy::dotenv().ok();

    let settings = load_config()?;
    logging::init(&settings.logging.level);

    let transport = Arc::new(RedisTransport::new(&settings.bus.url)?);
    let store = Arc::new(RedisPriceStore::new(
        &settings.bus.url,
        settings.store.key_prefix.clone(),
    )?);

    let addr = settings.server.addr();
    let feed = Arc::new(PriceFeed::new(settings, transport, store));
    feed.start().await?;

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let feed = Arc::clone(&feed);
        let shutdown = shutdown.clone();
        async move { start_websocket_server(&addr, feed, shutdown).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        joined = &mut server => match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("WebSocket server failed: {e}"),
            Err(e) => error!("WebSocket server task panicked: {e}"),
        },
    }

    shutdown.cancel();
    feed.stop().await;
    Ok(())
}
