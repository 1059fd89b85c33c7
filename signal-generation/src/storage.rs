// Decision Breakdown Storage
// Keeps the latest full decision breakdown per symbol for inspection

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ConfluenceResult, SignalDecision, SnapshotSource};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Everything that went into one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBreakdown {
    pub symbol: String,
    pub trace_id: Uuid,
    pub decision: SignalDecision,
    pub confluence: ConfluenceResult,
    pub quality_score: f64,
    pub data_valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    pub source: SnapshotSource,
    pub forwarded: bool,
    pub created_at: DateTime<Utc>,
}

/// Keyed by symbol; a write replaces the previous breakdown.
#[async_trait]
pub trait BreakdownCache: Send + Sync {
    async fn put(&self, breakdown: &DecisionBreakdown) -> Result<()>;

    async fn get(&self, symbol: &str) -> Result<Option<DecisionBreakdown>>;
}

#[derive(Default)]
pub struct InMemoryBreakdownCache {
    entries: RwLock<HashMap<String, DecisionBreakdown>>,
}

impl InMemoryBreakdownCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl BreakdownCache for InMemoryBreakdownCache {
    async fn put(&self, breakdown: &DecisionBreakdown) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(breakdown.symbol.clone(), breakdown.clone());
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<DecisionBreakdown>> {
        Ok(self.entries.read().await.get(symbol).cloned())
    }
}

const DEFAULT_PREFIX: &str = "signal:breakdown";

/// Breakdowns stored as JSON strings under `{prefix}:{symbol}` with a TTL.
#[derive(Clone)]
pub struct RedisBreakdownCache {
    manager: ConnectionManager,
    prefix: String,
    ttl_secs: u64,
}

impl RedisBreakdownCache {
    pub async fn connect(url: &str, ttl_secs: u64) -> Result<Self> {
        let client = Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self {
            manager,
            prefix: DEFAULT_PREFIX.to_string(),
            ttl_secs,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn key(&self, symbol: &str) -> String {
        format!("{}:{symbol}", self.prefix)
    }
}

#[async_trait]
impl BreakdownCache for RedisBreakdownCache {
    async fn put(&self, breakdown: &DecisionBreakdown) -> Result<()> {
        let key = self.key(&breakdown.symbol);
        let payload = serde_json::to_string(breakdown)?;
        let mut con = self.manager.clone();

        let started = Instant::now();
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(payload);
        if self.ttl_secs > 0 {
            cmd.arg("EX").arg(self.ttl_secs);
        }
        cmd.query_async::<()>(&mut con)
            .await
            .with_context(|| format!("redis SET {key}"))?;
        debug!(%key, elapsed = ?started.elapsed(), "breakdown written");
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<DecisionBreakdown>> {
        let key = self.key(symbol);
        let mut con = self.manager.clone();
        let raw: Option<String> = con.get(&key).await.with_context(|| format!("redis GET {key}"))?;
        raw.map(|s| serde_json::from_str(&s).with_context(|| format!("corrupt breakdown under {key}")))
            .transpose()
    }
}
