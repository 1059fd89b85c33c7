//! Bybit v5 public WebSocket feed writing into a [`StreamingStore`].

use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{StreamingConfig, StreamingStore};
use crate::connectors::bybit::bybit_interval;

/// Topics per subscribe request; Bybit rejects larger batches.
const TOPICS_PER_REQUEST: usize = 10;

#[derive(Debug, Serialize)]
struct OpRequest<'a> {
    op: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
}

enum Exit {
    Shutdown,
    Disconnected,
}

/// Every topic the feed subscribes for `symbols`.
pub fn topics_for(config: &StreamingConfig, symbols: &[String]) -> Vec<String> {
    let intervals: Vec<String> = config
        .kline_intervals
        .iter()
        .filter_map(|tf| match bybit_interval(tf) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(timeframe = %tf, error = %e, "skipping kline interval");
                None
            }
        })
        .collect();

    let mut topics = Vec::new();
    for symbol in symbols {
        topics.push(format!("tickers.{symbol}"));
        topics.push(format!("orderbook.{}.{symbol}", config.orderbook_depth));
        topics.push(format!("publicTrade.{symbol}"));
        topics.push(format!("allLiquidation.{symbol}"));
        for token in &intervals {
            topics.push(format!("kline.{token}.{symbol}"));
        }
    }
    topics
}

/// Subscribes `symbols` on the store and starts the feed task. The task is
/// owned by the store; [`StreamingStore::close`] stops it.
pub fn spawn_bybit_feed(store: Arc<StreamingStore>, symbols: Vec<String>) {
    store.subscribe(symbols.iter().cloned());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed_store = store.clone();
    let task = tokio::spawn(async move {
        run(feed_store, symbols, shutdown_rx).await;
    });
    store.attach_feed(shutdown_tx, task);
}

async fn run(store: Arc<StreamingStore>, symbols: Vec<String>, mut shutdown: watch::Receiver<bool>) {
    let config = store.config().clone();
    let topics = topics_for(&config, &symbols);
    let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);

    loop {
        match connect_and_run(&store, &config, &topics, &mut shutdown).await {
            Ok(Exit::Shutdown) => {
                info!("bybit feed stopped");
                store.mark_connected(false);
                return;
            }
            Ok(Exit::Disconnected) => {
                info!("bybit websocket closed");
            }
            Err(e) => {
                error!(error = %e, "bybit websocket failed");
            }
        }
        store.mark_connected(false);

        info!(delay_secs = config.reconnect_delay_secs, "reconnecting");
        tokio::select! {
            _ = sleep(reconnect_delay) => {}
            _ = shutdown.changed() => {
                info!("bybit feed stopped while reconnecting");
                return;
            }
        }
    }
}

async fn connect_and_run(
    store: &StreamingStore,
    config: &StreamingConfig,
    topics: &[String],
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Exit> {
    info!(url = %config.ws_url, topics = topics.len(), "connecting to bybit websocket");
    let handshake = async {
        let (ws_stream, response) = tokio_tungstenite::connect_async(config.ws_url.as_str()).await?;
        debug!(status = ?response.status(), "websocket handshake complete");

        let (mut write, read) = ws_stream.split();
        for chunk in topics.chunks(TOPICS_PER_REQUEST) {
            let request = OpRequest {
                op: "subscribe",
                args: chunk.to_vec(),
            };
            write.send(Message::Text(serde_json::to_string(&request)?)).await?;
        }
        Ok::<_, anyhow::Error>((write, read))
    };

    // an exchange that accepts TCP but stalls the upgrade must not block shutdown
    let (mut write, mut read) = tokio::select! {
        connected = handshake => connected?,
        _ = shutdown.changed() => {
            info!("bybit feed stopped while connecting");
            return Ok(Exit::Shutdown);
        }
    };
    store.mark_connected(true);

    let mut heartbeat = interval(Duration::from_secs(config.heartbeat_secs.max(1)));
    let ping = serde_json::to_string(&OpRequest {
        op: "ping",
        args: Vec::new(),
    })?;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(store, &text),
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "websocket closed by server");
                        return Ok(Exit::Disconnected);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(bytes = data.len(), "unexpected binary frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(anyhow!("websocket stream error: {e}")),
                    None => return Ok(Exit::Disconnected),
                }
            }
            _ = heartbeat.tick() => {
                write.send(Message::Text(ping.clone())).await?;
                debug!("sent ping");
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(Exit::Shutdown);
            }
        }
    }
}

fn handle_text(store: &StreamingStore, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable websocket frame");
            return;
        }
    };

    if let Some(op) = frame.get("op").and_then(Value::as_str) {
        let success = frame.get("success").and_then(Value::as_bool).unwrap_or(true);
        if !success {
            warn!(op, message = ?frame.get("ret_msg"), "websocket op rejected");
        } else {
            debug!(op, "websocket op acknowledged");
        }
        return;
    }

    let Some(topic) = frame.get("topic").and_then(Value::as_str) else {
        debug!("frame without topic");
        return;
    };
    let Some(symbol) = topic.rsplit('.').next() else {
        return;
    };
    store.handle_message(symbol, topic, &frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_cover_every_kind() {
        let config = StreamingConfig {
            kline_intervals: vec!["1m".into(), "4h".into(), "7m".into()],
            ..StreamingConfig::default()
        };
        let topics = topics_for(&config, &["BTCUSDT".to_string()]);
        assert_eq!(
            topics,
            vec![
                "tickers.BTCUSDT",
                "orderbook.50.BTCUSDT",
                "publicTrade.BTCUSDT",
                "allLiquidation.BTCUSDT",
                "kline.1.BTCUSDT",
                "kline.240.BTCUSDT",
            ]
        );
    }

    #[tokio::test]
    async fn test_close_while_handshake_stalls() {
        // accepts connections and never answers the websocket upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = StreamingConfig {
            ws_url: format!("ws://{addr}"),
            ..StreamingConfig::default()
        };
        let store = Arc::new(StreamingStore::new(config));
        spawn_bybit_feed(store.clone(), vec!["BTCUSDT".to_string()]);
        sleep(Duration::from_millis(300)).await;

        let closed = tokio::time::timeout(Duration::from_secs(5), store.close()).await;
        assert!(closed.is_ok(), "close blocked on a stalled handshake");
        assert!(!store.is_connected());
        assert!(store.subscribed_symbols().is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn test_handle_text_routes_by_topic() {
        let store = StreamingStore::new(StreamingConfig::default());
        store.subscribe(["ETHUSDT"]);
        handle_text(
            &store,
            r#"{"topic":"tickers.ETHUSDT","type":"snapshot","ts":1708627200000,"data":{"symbol":"ETHUSDT","lastPrice":"3000.5"}}"#,
        );
        handle_text(&store, r#"{"op":"pong","success":true}"#);
        handle_text(&store, "not json");
        assert_eq!(store.ticker("ETHUSDT").and_then(|t| t.last), Some(3000.5));
    }
}
