use tracing::info;

use muf_broker::Broker;
use muf_core::telemetry::init_tracing;
use muf_core::{AppContext, MufConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing("info");

    let ctx = AppContext::new(MufConfig::load());
    let addr = ctx.config().broker.bind_address.clone();
    let broker = Broker::bind(&ctx, &addr).await?;
    info!(addr = %broker.local_addr(), "MUF broker listening");

    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
            signal_ctx.shutdown();
        }
    });

    broker.run().await?;
    Ok(())
}
