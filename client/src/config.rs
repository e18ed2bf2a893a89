use std::{fs, time::Duration};

use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use randpa_core::types::{
	duration_millis_format, option_duration_millis_format, tracing_level_format, RandpaConfig,
	DEFAULT_RETAINED_PROOFS, DEFAULT_ROUND_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::{cli::CliOpts, devnet::DevnetConfig};

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	/// Validator identity. Without it the node observes finality and never votes (default: None).
	pub producer_name: Option<String>,
	/// Signing keys in `<public-key-hex>=<scheme>:<data>` form. Ignored without producer name (default: []).
	pub signature_providers: Vec<String>,
	/// Round deadline in milliseconds, local votes are re-broadcast when it passes (default: 3000).
	#[serde(with = "duration_millis_format")]
	pub round_timeout: Duration,
	/// Remote signer request deadline in milliseconds, unbounded if not set (default: None).
	#[serde(with = "option_duration_millis_format")]
	pub remote_signer_timeout: Option<Duration>,
	/// Number of finality proofs kept for catch-up requests (default: 64).
	pub retained_proofs: usize,
	/// Number of simulated validators in the devnet (default: 4).
	pub devnet_validators: usize,
	/// Devnet block interval in milliseconds (default: 500).
	#[serde(with = "duration_millis_format")]
	pub block_interval: Duration,
	/// Devnet stops producing blocks after this block number, runs until interrupted if not set (default: None).
	pub block_limit: Option<u32>,
	/// Devnet blocks already on the host chain when the nodes start (default: 0).
	pub devnet_history: u32,
	/// Metrics are logged every interval, in milliseconds (default: 10000).
	#[serde(with = "duration_millis_format")]
	pub metrics_flush_interval: Duration,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			log_level: Level::INFO,
			log_format_json: false,
			producer_name: None,
			signature_providers: vec![],
			round_timeout: DEFAULT_ROUND_TIMEOUT,
			remote_signer_timeout: None,
			retained_proofs: DEFAULT_RETAINED_PROOFS,
			devnet_validators: 4,
			block_interval: Duration::from_millis(500),
			block_limit: None,
			devnet_history: 0,
			metrics_flush_interval: Duration::from_secs(10),
		}
	}
}

impl RuntimeConfig {
	pub fn is_validator(&self) -> bool {
		self.producer_name.is_some()
	}
}

impl From<&RuntimeConfig> for RandpaConfig {
	fn from(val: &RuntimeConfig) -> Self {
		RandpaConfig {
			is_validator: val.is_validator(),
			round_timeout: val.round_timeout,
			retained_proofs: val.retained_proofs,
		}
	}
}

impl From<&RuntimeConfig> for DevnetConfig {
	fn from(val: &RuntimeConfig) -> Self {
		DevnetConfig {
			validators: val.devnet_validators,
			block_interval: val.block_interval,
			block_limit: val.block_limit,
			history: val.devnet_history,
			metrics_flush_interval: val.metrics_flush_interval,
			randpa: val.into(),
		}
	}
}

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {}", config_path))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	// Flags override the config parameters
	if let Some(producer_name) = &opts.producer_name {
		cfg.producer_name = Some(producer_name.clone());
	}
	if !opts.signature_providers.is_empty() {
		cfg.signature_providers = opts.signature_providers.clone();
	}
	if let Some(round_timeout) = opts.round_timeout {
		cfg.round_timeout = Duration::from_millis(round_timeout);
	}
	if let Some(remote_signer_timeout) = opts.remote_signer_timeout {
		cfg.remote_signer_timeout = Some(Duration::from_millis(remote_signer_timeout));
	}
	cfg.retained_proofs = opts.retained_proofs.unwrap_or(cfg.retained_proofs);
	cfg.devnet_validators = opts.validators.unwrap_or(cfg.devnet_validators);
	if let Some(block_interval) = opts.block_interval {
		cfg.block_interval = Duration::from_millis(block_interval);
	}
	cfg.block_limit = opts.block_limit.or(cfg.block_limit);
	cfg.devnet_history = opts.history.unwrap_or(cfg.devnet_history);
	if let Some(interval) = opts.metrics_flush_interval {
		cfg.metrics_flush_interval = Duration::from_millis(interval);
	}

	if cfg.round_timeout.is_zero() {
		return Err(eyre!("Round timeout must be greater than zero"));
	}
	if cfg.block_interval.is_zero() || cfg.metrics_flush_interval.is_zero() {
		return Err(eyre!("Devnet intervals must be greater than zero"));
	}

	Ok(cfg)
}
