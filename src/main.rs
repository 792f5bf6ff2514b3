use anyhow::Result;
use auction_live::{
    api::{AuctionApi, NotificationStore, RestClient},
    cli::Args,
    config::Config,
    engine::AuctionEngine,
    monitoring::setup_metrics,
    tracing_setup::setup_tracing,
    transport::build_connector,
    ui::{ConsolePresenter, UIOptions},
};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_tracing(&args.log_level, args.json_logs)?;
    info!("Starting auction-live v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(&args)?;

    if config.metrics.enabled {
        setup_metrics(config.metrics.port).await?;
    }

    let rest = Arc::new(RestClient::new(config.api.clone())?);
    let connector = build_connector(&config.connection)?;
    let api: Arc<dyn AuctionApi> = rest.clone();
    let store: Arc<dyn NotificationStore> = rest;

    let engine = Arc::new(AuctionEngine::init(config, connector, api, Some(store)).await);

    let mut presenter = ConsolePresenter::new(
        engine.clone(),
        UIOptions {
            colored: !args.no_color,
        },
    );
    for auction_id in &args.auctions {
        presenter.open(*auction_id).await;
    }

    info!("Client started. Type `quit` or press Ctrl+C to exit");
    presenter.run().await;
    drop(presenter);

    engine.shutdown().await;
    info!("Client stopped successfully");
    Ok(())
}
