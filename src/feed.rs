//! Price feed adapter
//!
//! Keeps the last trade price plus its age and fans each update out to
//! registered listeners (the fill detector among them). Prices arrive as
//! venue WebSocket frames parsed by `handle_message`, or directly through
//! `record` in simulation and tests.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Last known price and when it was observed
#[derive(Debug, Clone, Copy)]
pub struct PriceSample {
    pub price: f64,
    pub observed_at: Instant,
}

impl PriceSample {
    pub fn age(&self) -> Duration {
        self.observed_at.elapsed()
    }
}

type PriceListener = Box<dyn Fn(f64) + Send + Sync>;

/// Scalar last-trade price source
pub struct PriceFeed {
    pair_code: String,
    sample: RwLock<Option<PriceSample>>,
    listeners: RwLock<Vec<PriceListener>>,
}

impl PriceFeed {
    pub fn new(pair_code: impl Into<String>) -> Self {
        Self {
            pair_code: pair_code.into(),
            sample: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: impl Fn(f64) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("listener list poisoned")
            .push(Box::new(listener));
    }

    /// Store a new sample and notify every listener in order
    pub fn record(&self, price: f64) {
        {
            let mut sample = self.sample.write().expect("price sample poisoned");
            *sample = Some(PriceSample {
                price,
                observed_at: Instant::now(),
            });
        }

        let listeners = self.listeners.read().expect("listener list poisoned");
        for listener in listeners.iter() {
            listener(price);
        }
    }

    pub fn latest(&self) -> Option<PriceSample> {
        *self.sample.read().expect("price sample poisoned")
    }

    /// Parse a venue market frame and record the price it carries.
    ///
    /// Expected shape: `{"biz":"futures","pairCode":"btc","data":{"p":"..."}}`.
    /// Frames for other pairs or channels are ignored; malformed frames are
    /// logged at debug and dropped.
    pub fn handle_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!("Unparseable feed frame: {}", e);
                return;
            }
        };

        if value.get("biz").and_then(Value::as_str) != Some("futures") {
            return;
        }
        if value.get("pairCode").and_then(Value::as_str) != Some(self.pair_code.as_str()) {
            return;
        }

        let price = value
            .get("data")
            .and_then(|data| data.get("p"))
            .and_then(|p| match p {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            });

        match price {
            Some(price) => self.record(price),
            None => debug!("Feed frame without price field"),
        }
    }
}

/// Run the WebSocket price source until the process exits, reconnecting
/// with a fixed backoff on any transport error.
pub async fn run_ws(url: String, feed: std::sync::Arc<PriceFeed>) {
    loop {
        info!("Connecting to price feed {}", url);
        match connect_async(&url).await {
            Ok((mut stream, _)) => {
                info!("Price feed connected");
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => feed.handle_message(&text),
                        Ok(Message::Close(_)) => {
                            warn!("Price feed closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Price feed stream error: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => error!("Price feed connect failed: {}", e),
        }

        warn!("Price feed disconnected, retrying in 5s");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
