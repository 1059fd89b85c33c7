// Pipeline Settings
// One document for every tunable section, layered from a file and PIPELINE__* env vars

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use data_ingestion::{BybitConfig, CollectorConfig, StreamingConfig};
use portfolio_risk::TradingConfig;
use serde::{Deserialize, Serialize};

use crate::decision::{HysteresisMode, Thresholds};
use crate::pipeline::PipelineConfig;
use crate::validation::ValidationConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_breakdown_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_breakdown_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub exchange: BybitConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub hysteresis: HysteresisMode,
    #[serde(default)]
    pub trading: TradingConfig,
    /// Breakdowns go to Redis when set, otherwise nowhere
    #[serde(default)]
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl PipelineSettings {
    /// Reads `path` (any format the `config` crate recognises by extension)
    /// when given, then applies `PIPELINE__SECTION__KEY` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Self = builder
            .add_source(
                Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read pipeline settings")?
            .try_deserialize()
            .context("invalid pipeline settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .context("failed to read pipeline settings")?
            .try_deserialize()
            .context("invalid pipeline settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.check().map_err(|e| anyhow!("thresholds: {e}"))?;
        self.trading.validate().map_err(|e| anyhow!("trading: {e}"))?;
        if self.collector.max_concurrent_symbols == 0 {
            return Err(anyhow!("collector: max_concurrent_symbols must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.pipeline.min_forward_reliability) {
            return Err(anyhow!(
                "pipeline: min_forward_reliability {} outside 0-100",
                self.pipeline.min_forward_reliability
            ));
        }
        Ok(())
    }
}
