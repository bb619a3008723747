//! Live trade feed.
//!
//! Messages arrive as `{topic, type, payload}` envelopes. Only
//! `activity`/`trades` payloads are narrowed into [`FeedTrade`]; everything
//! else becomes [`FeedMessage::Other`] and is ignored by the worker.

use crate::event_bus::EventBus;
use crate::events::OperationalEvent;
use chrono::Utc;
use common::config;
use common::types::Side;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const TRADES_TOPIC: &str = "activity";
const TRADES_TYPE: &str = "trades";
const PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("malformed feed message: {0}")]
    Malformed(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("feed closed by server")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedTrade {
    pub asset_id: String,
    pub condition_id: Option<String>,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub proxy_wallet: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub transaction_hash: Option<String>,
    pub outcome: Option<String>,
}

impl FeedTrade {
    pub fn value(&self) -> f64 {
        self.price * self.size
    }

    /// Stable identity for deduplication. One transaction can fill several
    /// makers on the same asset, so the side and size are part of the key.
    pub fn trade_key(&self) -> String {
        match self.transaction_hash.as_deref().filter(|h| !h.is_empty()) {
            Some(tx) => format!(
                "{}:{}:{}:{:.6}",
                tx.to_lowercase(),
                self.asset_id,
                self.side,
                self.size
            ),
            None => format!(
                "{}:{}:{}:{}:{:.6}",
                self.proxy_wallet.as_deref().unwrap_or("-").to_lowercase(),
                self.asset_id,
                self.timestamp,
                self.side,
                self.size
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Trade(FeedTrade),
    Other { topic: String, kind: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    topic: String,
    #[serde(default, rename = "type")]
    kind: String,
    payload: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrade {
    #[serde(alias = "asset_id", alias = "assetId", alias = "tokenId")]
    asset: Option<String>,
    #[serde(alias = "condition_id", alias = "market")]
    condition_id: Option<String>,
    price: Option<Value>,
    size: Option<Value>,
    side: Option<String>,
    #[serde(alias = "proxy_wallet", alias = "wallet", alias = "user")]
    proxy_wallet: Option<String>,
    timestamp: Option<Value>,
    #[serde(alias = "transaction_hash", alias = "txHash")]
    transaction_hash: Option<String>,
    outcome: Option<String>,
}

fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Seconds or milliseconds; anything past year 33658 in seconds is milliseconds.
fn unix_seconds(v: Option<&Value>) -> Option<i64> {
    let raw = number(v)?;
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    let secs = if raw > 1e12 { raw / 1000.0 } else { raw };
    Some(secs as i64)
}

impl TryFrom<RawTrade> for FeedTrade {
    type Error = FeedError;

    fn try_from(raw: RawTrade) -> Result<Self, FeedError> {
        let missing = |field: &str| FeedError::Malformed(format!("trade without {field}"));
        let asset_id = raw.asset.filter(|a| !a.is_empty()).ok_or_else(|| missing("asset"))?;
        let price = number(raw.price.as_ref()).ok_or_else(|| missing("price"))?;
        let size = number(raw.size.as_ref()).ok_or_else(|| missing("size"))?;
        let side = raw
            .side
            .as_deref()
            .and_then(Side::from_str_loose)
            .ok_or_else(|| missing("side"))?;
        let timestamp = unix_seconds(raw.timestamp.as_ref()).unwrap_or_else(|| Utc::now().timestamp());
        Ok(Self {
            asset_id,
            condition_id: raw.condition_id.filter(|c| !c.is_empty()),
            price,
            size,
            side,
            proxy_wallet: raw.proxy_wallet.map(|w| w.trim().to_lowercase()),
            timestamp,
            transaction_hash: raw.transaction_hash.filter(|h| !h.is_empty()),
            outcome: raw.outcome,
        })
    }
}

impl FeedMessage {
    pub fn parse(text: &str) -> Result<Self, FeedError> {
        let env: Envelope =
            serde_json::from_str(text).map_err(|e| FeedError::Malformed(e.to_string()))?;
        if env.topic != TRADES_TOPIC || env.kind != TRADES_TYPE {
            return Ok(Self::Other {
                topic: env.topic,
                kind: env.kind,
            });
        }
        let payload = env
            .payload
            .ok_or_else(|| FeedError::Malformed("trade message without payload".to_string()))?;
        let raw: RawTrade =
            serde_json::from_value(payload).map_err(|e| FeedError::Malformed(e.to_string()))?;
        Ok(Self::Trade(FeedTrade::try_from(raw)?))
    }
}

fn subscribe_message() -> String {
    serde_json::json!({
        "action": "subscribe",
        "subscriptions": [{ "topic": TRADES_TOPIC, "type": TRADES_TYPE }],
    })
    .to_string()
}

/// Doubling reconnect delay, reset after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial.min(max),
        }
    }

    pub fn from_config(cfg: &config::Feed) -> Self {
        Self::new(
            Duration::from_millis(cfg.initial_backoff_ms),
            Duration::from_secs(cfg.max_backoff_secs),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}

enum StreamEnd {
    Stopped,
    Closed,
}

pub struct FeedHandle {
    pub trades: mpsc::Receiver<FeedTrade>,
    pub connected: watch::Receiver<bool>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Spawn the reconnecting feed loop.
pub fn spawn(cfg: config::Feed, bus: EventBus, cancel: CancellationToken) -> FeedHandle {
    let (tx, trades) = mpsc::channel(cfg.channel_capacity.max(1));
    let (state_tx, connected) = watch::channel(false);
    let task = tokio::spawn(run(cfg, tx, state_tx, bus, cancel));
    FeedHandle {
        trades,
        connected,
        task,
    }
}

pub async fn run(
    cfg: config::Feed,
    tx: mpsc::Sender<FeedTrade>,
    connected: watch::Sender<bool>,
    bus: EventBus,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::from_config(&cfg);
    loop {
        let error = match stream_once(&cfg.ws_url, &tx, &connected, &bus, &mut backoff, &cancel).await {
            Ok(StreamEnd::Stopped) => break,
            Ok(StreamEnd::Closed) => FeedError::Closed.to_string(),
            Err(e) => e.to_string(),
        };
        connected.send_replace(false);
        metrics::counter!("enricher_feed_disconnects_total").increment(1);

        let delay = backoff.next_delay();
        tracing::warn!(%error, delay_ms = delay.as_millis() as u64, "feed disconnected, reconnecting");
        bus.publish_operational(OperationalEvent::FeedDisconnected {
            error,
            reconnect_in_ms: delay.as_millis() as u64,
            disconnected_at: Utc::now(),
        });
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    connected.send_replace(false);
    tracing::info!("feed stopped");
}

/// Mirror the feed's connection state into `enricher_feed_connected` and log
/// how long each outage lasted. Returns the number of connections observed.
pub async fn track_connection(mut connected: watch::Receiver<bool>, cancel: CancellationToken) -> u64 {
    let mut connects = 0;
    let mut was_up = *connected.borrow_and_update();
    let mut down_since = (!was_up).then(tokio::time::Instant::now);
    metrics::gauge!("enricher_feed_connected").set(if was_up { 1.0 } else { 0.0 });
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let up = *connected.borrow_and_update();
        if up == was_up {
            continue;
        }
        was_up = up;
        metrics::gauge!("enricher_feed_connected").set(if up { 1.0 } else { 0.0 });
        if up {
            connects += 1;
            if let Some(since) = down_since.take() {
                tracing::debug!(down_ms = since.elapsed().as_millis() as u64, "feed available");
            }
        } else {
            down_since = Some(tokio::time::Instant::now());
        }
    }
    connects
}

async fn stream_once(
    url: &str,
    tx: &mpsc::Sender<FeedTrade>,
    connected: &watch::Sender<bool>,
    bus: &EventBus,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Result<StreamEnd, FeedError> {
    let (mut ws, _response) = tokio::select! {
        () = cancel.cancelled() => return Ok(StreamEnd::Stopped),
        res = tokio_tungstenite::connect_async(url) => res?,
    };
    ws.send(Message::Text(subscribe_message())).await?;

    backoff.reset();
    connected.send_replace(true);
    metrics::counter!("enricher_feed_connects_total").increment(1);
    tracing::info!(%url, "feed connected");
    bus.publish_operational(OperationalEvent::FeedConnected {
        url: url.to_string(),
        connected_at: Utc::now(),
    });

    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(StreamEnd::Stopped);
            }
            _ = ping.tick() => {
                ws.send(Message::Ping(Vec::new())).await?;
                continue;
            }
            msg = ws.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => match FeedMessage::parse(&text) {
                Ok(FeedMessage::Trade(trade)) => {
                    metrics::counter!("enricher_feed_trades_total").increment(1);
                    if tx.send(trade).await.is_err() {
                        return Ok(StreamEnd::Stopped);
                    }
                }
                Ok(FeedMessage::Other { topic, kind }) => {
                    tracing::trace!(%topic, %kind, "ignoring feed message");
                }
                Err(e) => {
                    metrics::counter!("enricher_feed_malformed_total").increment(1);
                    tracing::debug!(error = %e, "skipping malformed feed message");
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(StreamEnd::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
