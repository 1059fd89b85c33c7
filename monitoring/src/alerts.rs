//! Delivery of directional signals to downstream consumers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SignalDecision, SignalType};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::error::SinkError;

/// A decision on its way out, tagged so it can be traced through whatever
/// consumes it. `trace_id` ties together everything produced in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedSignal {
    pub signal_id: Uuid,
    pub trace_id: Uuid,
    pub symbol: String,
    pub decision: SignalDecision,
    #[serde(default)]
    pub components: HashMap<String, f64>,
    pub forwarded_at: DateTime<Utc>,
}

impl ForwardedSignal {
    pub fn new(symbol: impl Into<String>, trace_id: Uuid, decision: SignalDecision) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            trace_id,
            symbol: symbol.into(),
            decision,
            components: HashMap::new(),
            forwarded_at: Utc::now(),
        }
    }

    pub fn with_components(mut self, components: HashMap<String, f64>) -> Self {
        self.components = components;
        self
    }

    pub fn signal_type(&self) -> SignalType {
        self.decision.signal_type
    }
}

#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, signal: ForwardedSignal) -> Result<(), SinkError>;
}

/// Hands signals to an in-process consumer over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSignalSink {
    tx: mpsc::Sender<ForwardedSignal>,
}

impl ChannelSignalSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ForwardedSignal>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SignalSink for ChannelSignalSink {
    async fn send(&self, signal: ForwardedSignal) -> Result<(), SinkError> {
        self.tx.send(signal).await.map_err(|_| SinkError::Closed)
    }
}

/// Writes each signal to the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSignalSink;

#[async_trait]
impl SignalSink for LoggingSignalSink {
    async fn send(&self, signal: ForwardedSignal) -> Result<(), SinkError> {
        let params = signal.decision.trade_params.as_ref();
        info!(
            signal_id = %signal.signal_id,
            trace_id = %signal.trace_id,
            symbol = %signal.symbol,
            signal_type = %signal.decision.signal_type,
            score = signal.decision.score,
            reliability = signal.decision.reliability,
            entry = ?params.map(|p| p.entry_price),
            stop_loss = ?params.and_then(|p| p.stop_loss),
            take_profit = ?params.and_then(|p| p.take_profit),
            "signal"
        );
        Ok(())
    }
}
