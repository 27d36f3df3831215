//! Bitunix WebSocket feed with transparent reconnection.
//!
//! The feed turns the exchange's streaming channels into typed [`FeedEvent`]s
//! delivered over an mpsc channel. Each instance (public or private endpoint)
//! keeps the *desired* subscription set and replays it after every successful
//! reconnect, before any further event is forwarded — consumers never need to
//! know a reconnect happened. Steady-state disconnects are retried forever
//! with a fixed backoff; the private login handshake is best-effort with a
//! fixed timeout.

use crate::exchange::types::Side;
use crate::indicators::Candle;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::ops::ControlFlow;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Order lifecycle transitions reported on the private channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventKind {
    Create,
    Filled,
    Canceled,
}

impl OrderEventKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Some(Self::Create),
            "FILLED" => Some(Self::Filled),
            "CANCELED" | "CANCEL" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// One order create/fill/cancel notification.
#[derive(Debug, Clone)]
pub struct OrderUpdateEvent {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub event: OrderEventKind,
}

/// Typed events delivered to the trading core.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Latest mark price, with the funding rate when the venue attaches one.
    PriceTick {
        symbol: String,
        price: Decimal,
        funding_rate: Option<Decimal>,
    },
    /// Order lifecycle notification.
    OrderUpdate(OrderUpdateEvent),
    /// A closed candle from the kline stream.
    CandleClosed { symbol: String, candle: Candle },
    /// Margin-coin balance snapshot.
    BalanceUpdate { coin: String, available: Decimal },
    /// Connection established and all subscriptions replayed.
    Connected,
    /// Connection lost; the supervisor is about to retry.
    Disconnected,
}

/// One desired stream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub symbol: Option<String>,
    pub channel: String,
}

/// Credentials for the private endpoint's login handshake.
#[derive(Debug, Clone)]
pub struct FeedCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Supervised WebSocket connection to one Bitunix endpoint.
pub struct BitunixFeed {
    url: String,
    credentials: Option<FeedCredentials>,
    reconnect_backoff: Duration,
    subscriptions: Mutex<Vec<Subscription>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl BitunixFeed {
    /// Create a feed for a public endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            reconnect_backoff: RECONNECT_BACKOFF,
            subscriptions: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
        }
    }

    /// Create a feed for a private endpoint requiring login.
    pub fn with_credentials(url: impl Into<String>, credentials: FeedCredentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..Self::new(url)
        }
    }

    /// Override the reconnect backoff (tests use a short one).
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Subscribe to mark-price ticks for a symbol.
    pub fn subscribe_price(&self, symbol: &str) {
        self.add_subscription(Subscription {
            symbol: Some(symbol.to_string()),
            channel: "price".to_string(),
        });
    }

    /// Subscribe to closed 1-minute candles for a symbol.
    pub fn subscribe_klines(&self, symbol: &str, interval: &str) {
        self.add_subscription(Subscription {
            symbol: Some(symbol.to_string()),
            channel: format!("kline_{interval}"),
        });
    }

    /// Subscribe to order lifecycle updates (private endpoint).
    pub fn subscribe_orders(&self) {
        self.add_subscription(Subscription {
            symbol: None,
            channel: "order".to_string(),
        });
    }

    /// Subscribe to balance snapshots (private endpoint).
    pub fn subscribe_balance(&self) {
        self.add_subscription(Subscription {
            symbol: None,
            channel: "balance".to_string(),
        });
    }

    /// Record a desired subscription; if currently connected, send it now.
    /// Either way it is replayed after every reconnect.
    fn add_subscription(&self, sub: Subscription) {
        {
            let mut subs = self.subscriptions.lock().expect("subscription lock poisoned");
            if subs.contains(&sub) {
                return;
            }
            subs.push(sub.clone());
        }

        let outbound = self.outbound.lock().expect("outbound lock poisoned");
        if let Some(sender) = outbound.as_ref() {
            let _ = sender.send(Message::Text(subscribe_frame(&[sub]).into()));
        }
    }

    /// Spawn the supervisor task. It runs until the event receiver is dropped.
    pub fn start(self: std::sync::Arc<Self>, tx: mpsc::Sender<FeedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx).await })
    }

    async fn run(&self, tx: mpsc::Sender<FeedEvent>) {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!(url = %self.url, "Feed connected");
                    if self.session(stream, &tx).await.is_break() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Feed connect failed");
                }
            }

            tokio::time::sleep(self.reconnect_backoff).await;
        }
    }

    /// Drive one connection: login, replay subscriptions, pump events.
    ///
    /// Returns `Break` when the event receiver is gone and the supervisor
    /// should stop for good.
    async fn session(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        tx: &mpsc::Sender<FeedEvent>,
    ) -> ControlFlow<()> {
        let (mut write, mut read) = stream.split();

        if let Some(creds) = &self.credentials {
            if write
                .send(Message::Text(login_frame(creds).into()))
                .await
                .is_err()
            {
                let _ = tx.send(FeedEvent::Disconnected).await;
                return ControlFlow::Continue(());
            }

            // Best-effort: proceed after the timeout even without an ack.
            let ack = tokio::time::timeout(LOGIN_TIMEOUT, async {
                while let Some(Ok(Message::Text(text))) = read.next().await {
                    if text.contains("\"op\":\"login\"") || text.contains("\"event\":\"login\"") {
                        return true;
                    }
                }
                false
            })
            .await;
            match ack {
                Ok(true) => debug!("Feed login acknowledged"),
                _ => warn!("Feed login not acknowledged in time, proceeding"),
            }
        }

        // Replay every desired subscription before any event goes live.
        let subs = self
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .clone();
        if !subs.is_empty() {
            if write
                .send(Message::Text(subscribe_frame(&subs).into()))
                .await
                .is_err()
            {
                let _ = tx.send(FeedEvent::Disconnected).await;
                return ControlFlow::Continue(());
            }
            debug!(count = subs.len(), "Subscriptions replayed");
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        *self.outbound.lock().expect("outbound lock poisoned") = Some(out_tx);

        if tx.send(FeedEvent::Connected).await.is_err() {
            return ControlFlow::Break(());
        }

        let flow = 'pump: loop {
            tokio::select! {
                Some(msg) = out_rx.recv() => {
                    if write.send(msg).await.is_err() {
                        break 'pump ControlFlow::Continue(());
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        for event in parse_frame(&text) {
                            if tx.send(event).await.is_err() {
                                break 'pump ControlFlow::Break(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(url = %self.url, "Feed closed by server");
                        break 'pump ControlFlow::Continue(());
                    }
                    Some(Err(e)) => {
                        error!(url = %self.url, error = %e, "Feed stream error");
                        break 'pump ControlFlow::Continue(());
                    }
                    Some(Ok(_)) => {}
                },
            }
        };

        *self.outbound.lock().expect("outbound lock poisoned") = None;
        if tx.send(FeedEvent::Disconnected).await.is_err() {
            return ControlFlow::Break(());
        }
        flow
    }
}

/// Login frame: HMAC-SHA256 of `timestamp + nonce` with the API secret.
fn login_frame(creds: &FeedCredentials) -> String {
    let timestamp = Utc::now().timestamp_millis().to_string();
    let nonce = Uuid::new_v4().simple().to_string();

    let mut mac = Hmac::<Sha256>::new_from_slice(creds.api_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("{timestamp}{nonce}").as_bytes());
    let sign = hex::encode(mac.finalize().into_bytes());

    serde_json::json!({
        "op": "login",
        "args": [{
            "apiKey": creds.api_key,
            "timestamp": timestamp,
            "nonce": nonce,
            "sign": sign,
        }]
    })
    .to_string()
}

fn subscribe_frame(subs: &[Subscription]) -> String {
    let args: Vec<serde_json::Value> = subs
        .iter()
        .map(|s| match &s.symbol {
            Some(symbol) => serde_json::json!({ "symbol": symbol, "ch": s.channel }),
            None => serde_json::json!({ "ch": s.channel }),
        })
        .collect();

    serde_json::json!({ "op": "subscribe", "args": args }).to_string()
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    ch: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PricePayload {
    #[serde(rename = "markPrice", with = "rust_decimal::serde::str")]
    mark_price: Decimal,
    #[serde(rename = "fundingRate", default, with = "rust_decimal::serde::str_option")]
    funding_rate: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    open: Decimal,
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    high: Decimal,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    low: Decimal,
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    close: Decimal,
    #[serde(rename = "t")]
    close_time: i64,
    /// Whether this candle is final (closed).
    #[serde(rename = "x", default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct OrderPayload {
    #[serde(rename = "orderId")]
    order_id: String,
    symbol: String,
    side: String,
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    qty: Decimal,
    event: String,
}

#[derive(Debug, Deserialize)]
struct BalancePayload {
    coin: String,
    #[serde(with = "rust_decimal::serde::str")]
    available: Decimal,
}

/// Translate one text frame into zero or more feed events.
///
/// Unknown channels and malformed payloads are dropped, not errors — the
/// exchange mixes acks and heartbeats into the same stream.
fn parse_frame(text: &str) -> Vec<FeedEvent> {
    let Ok(frame) = serde_json::from_str::<RawFrame>(text) else {
        return Vec::new();
    };
    let Some(channel) = frame.ch.as_deref() else {
        return Vec::new();
    };
    let Some(data) = frame.data else {
        return Vec::new();
    };

    match channel {
        "price" => {
            let Some(symbol) = frame.symbol else {
                return Vec::new();
            };
            match serde_json::from_value::<PricePayload>(data) {
                Ok(p) => vec![FeedEvent::PriceTick {
                    symbol,
                    price: p.mark_price,
                    funding_rate: p.funding_rate,
                }],
                Err(_) => Vec::new(),
            }
        }
        ch if ch.starts_with("kline") => {
            let Some(symbol) = frame.symbol else {
                return Vec::new();
            };
            match serde_json::from_value::<KlinePayload>(data) {
                Ok(k) if k.is_final => vec![FeedEvent::CandleClosed {
                    symbol,
                    candle: Candle {
                        close_time: Utc
                            .timestamp_millis_opt(k.close_time)
                            .single()
                            .unwrap_or_else(Utc::now),
                        open: k.open,
                        high: k.high,
                        low: k.low,
                        close: k.close,
                    },
                }],
                _ => Vec::new(),
            }
        }
        "order" => match serde_json::from_value::<Vec<OrderPayload>>(data) {
            Ok(orders) => orders
                .into_iter()
                .filter_map(|o| {
                    let side = Side::from_order_side(&o.side)?;
                    let event = OrderEventKind::parse(&o.event)?;
                    Some(FeedEvent::OrderUpdate(OrderUpdateEvent {
                        order_id: o.order_id,
                        symbol: o.symbol,
                        side,
                        price: o.price,
                        qty: o.qty,
                        event,
                    }))
                })
                .collect(),
            Err(_) => Vec::new(),
        },
        "balance" => match serde_json::from_value::<Vec<BalancePayload>>(data) {
            Ok(balances) => balances
                .into_iter()
                .map(|b| FeedEvent::BalanceUpdate {
                    coin: b.coin,
                    available: b.available,
                })
                .collect(),
            Err(_) => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_parse_price_tick() {
        let frame = r#"{"ch":"price","symbol":"BTCUSDT","data":{"markPrice":"64000.5","fundingRate":"0.0001"}}"#;
        let events = parse_frame(frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::PriceTick {
                symbol,
                price,
                funding_rate,
            } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(*price, dec!(64000.5));
                assert_eq!(*funding_rate, Some(dec!(0.0001)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_kline_skips_unclosed_candles() {
        let open = r#"{"ch":"kline_1m","symbol":"BTCUSDT","data":{"o":"1","h":"2","l":"0.5","c":"1.5","t":1700000000000,"x":false}}"#;
        assert!(parse_frame(open).is_empty());

        let closed = r#"{"ch":"kline_1m","symbol":"BTCUSDT","data":{"o":"1","h":"2","l":"0.5","c":"1.5","t":1700000000000,"x":true}}"#;
        let events = parse_frame(closed);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::CandleClosed { symbol, candle } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(candle.high, dec!(2));
                assert_eq!(candle.close, dec!(1.5));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_order_batch() {
        let frame = r#"{"ch":"order","data":[
            {"orderId":"1","symbol":"BTCUSDT","side":"BUY","price":"64000","qty":"0.01","event":"FILLED"},
            {"orderId":"2","symbol":"BTCUSDT","side":"SELL","price":"65000","qty":"0.01","event":"CANCELED"}
        ]}"#;
        let events = parse_frame(frame);
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (FeedEvent::OrderUpdate(a), FeedEvent::OrderUpdate(b)) => {
                assert_eq!(a.event, OrderEventKind::Filled);
                assert_eq!(a.side, Side::Long);
                assert_eq!(b.event, OrderEventKind::Canceled);
                assert_eq!(b.side, Side::Short);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_parse_balance_and_garbage() {
        let frame = r#"{"ch":"balance","data":[{"coin":"USDT","available":"1234.56"}]}"#;
        let events = parse_frame(frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::BalanceUpdate { coin, available } => {
                assert_eq!(coin, "USDT");
                assert_eq!(*available, dec!(1234.56));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(parse_frame("pong").is_empty());
        assert!(parse_frame(r#"{"op":"subscribe","code":0}"#).is_empty());
        assert!(parse_frame(r#"{"ch":"mystery","data":{}}"#).is_empty());
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = subscribe_frame(&[
            Subscription {
                symbol: Some("BTCUSDT".into()),
                channel: "price".into(),
            },
            Subscription {
                symbol: None,
                channel: "balance".into(),
            },
        ]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["symbol"], "BTCUSDT");
        assert_eq!(value["args"][0]["ch"], "price");
        assert_eq!(value["args"][1]["ch"], "balance");
        assert!(value["args"][1].get("symbol").is_none());
    }

    /// After a disconnect, every previously-requested subscription is
    /// reissued before any new event reaches the consumer.
    #[tokio::test]
    async fn test_reconnect_replays_subscriptions_before_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: receive the subscription frame, then drop.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first_subs = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text.to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("server read failed: {other:?}"),
                }
            };
            drop(ws);

            // Second connection: the client must resubscribe before we emit
            // the first live event.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let second_subs = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text.to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("server read failed: {other:?}"),
                }
            };
            let tick = r#"{"ch":"price","symbol":"BTCUSDT","data":{"markPrice":"50000"}}"#;
            ws.send(Message::Text(tick.to_string().into()))
                .await
                .unwrap();
            // Hold the connection open long enough for the client to read.
            tokio::time::sleep(Duration::from_millis(500)).await;

            (first_subs, second_subs)
        });

        let feed = Arc::new(
            BitunixFeed::new(format!("ws://{addr}"))
                .with_reconnect_backoff(Duration::from_millis(50)),
        );
        feed.subscribe_price("BTCUSDT");
        feed.subscribe_balance();

        let (tx, mut rx) = mpsc::channel(64);
        let _handle = Arc::clone(&feed).start(tx);

        let mut events = Vec::new();
        while events.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for feed events")
                .expect("feed channel closed");
            events.push(event);
        }

        assert!(matches!(events[0], FeedEvent::Connected));
        assert!(matches!(events[1], FeedEvent::Disconnected));
        assert!(matches!(events[2], FeedEvent::Connected));
        match &events[3] {
            FeedEvent::PriceTick { symbol, price, .. } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(*price, dec!(50000));
            }
            other => panic!("expected the tick after resubscription, got {other:?}"),
        }

        let (first_subs, second_subs) = server.await.unwrap();
        for subs in [&first_subs, &second_subs] {
            assert!(subs.contains("\"ch\":\"price\""), "missing price sub: {subs}");
            assert!(subs.contains("\"ch\":\"balance\""), "missing balance sub: {subs}");
        }
    }
}
