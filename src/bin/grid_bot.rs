//! Grid trading bot binary
//!
//! Wires the ledger, fill detector, simulated gateway, price feed and
//! control server together and runs until interrupted.
//!
//! ```bash
//! cargo run --bin grid_bot -- --config config.toml
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use gridbot::{
    feed, server, EngineEvent, EngineSettings, EventBroadcaster, FillDetector, GridEngine,
    Ledger, OrderGateway, PriceFeed, PricePrecision, Settings, SimulatedGateway,
};

#[tokio::main]
async fn main() {
    match dotenvy::dotenv() {
        Ok(path) => println!("Loaded environment from {}", path.display()),
        Err(_) => {}
    }

    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].clone()
    } else {
        "config".to_string()
    };

    let settings = match Settings::new(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log.level.clone()),
    )
    .init();

    let ledger = Arc::new(match &settings.engine.ledger_file {
        Some(path) => Ledger::load_or_create(path),
        None => Ledger::in_memory(),
    });

    let (detector, fills_rx) =
        FillDetector::new(Duration::from_secs(settings.engine.confirm_seconds));
    let detector = Arc::new(detector);

    let gateway = Arc::new(SimulatedGateway::new(Duration::from_millis(
        settings.engine.gateway_delay_ms,
    )));

    let broadcaster = EventBroadcaster::new();
    let price_feed = Arc::new(PriceFeed::new(settings.feed.pair_code.clone()));

    // Every price tick drives fill evaluation and the event stream
    {
        let detector = Arc::clone(&detector);
        let broadcaster = broadcaster.clone();
        let pair_code = settings.feed.pair_code.clone();
        price_feed.add_listener(move |price| {
            detector.update_price(price);
            broadcaster.publish(EngineEvent::PriceTick {
                pair_code: pair_code.clone(),
                price,
            });
        });
    }

    let engine = Arc::new(GridEngine::new(
        Arc::clone(&ledger),
        Arc::clone(&detector),
        gateway as Arc<dyn OrderGateway>,
        broadcaster.clone(),
        Arc::clone(&price_feed),
        EngineSettings {
            price_max_age: Duration::from_secs(settings.engine.price_max_age_secs),
            self_fill_guard_ratio: settings.engine.self_fill_guard_ratio,
            precision: PricePrecision::default(),
        },
    ));

    engine.spawn_fill_worker(fills_rx);

    if let Some(ws_url) = settings.feed.ws_url.clone() {
        let price_feed = Arc::clone(&price_feed);
        tokio::spawn(feed::run_ws(ws_url, price_feed));
    } else {
        info!("No feed.ws_url configured; prices must come from elsewhere");
    }

    if settings.server.enabled {
        let state = server::AppState {
            engine,
            ledger,
            broadcaster,
        };
        if let Err(e) = server::serve(state, &settings.server.host, settings.server.port).await {
            error!("Server failed: {}", e);
        }
    } else {
        info!("Server disabled; running headless until interrupted");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for shutdown signal: {}", e);
        }
    }
}
