//! RANDPA finality node running against an in-process devnet.

use crate::{cli::CliOpts, config::load_runtime_config};
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use config::RuntimeConfig;
use randpa_core::{
	signer::{signature_providers, SignatureProvider},
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span, user_signal},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, span, Level};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod cli;
mod config;
mod devnet;

/// Providers the node votes with. Observers never sign, so their providers are ignored.
fn configured_signers(cfg: &RuntimeConfig) -> Result<Vec<Arc<dyn SignatureProvider>>> {
	let Some(producer_name) = &cfg.producer_name else {
		if !cfg.signature_providers.is_empty() {
			info!("No producer name set, ignoring signature providers");
		}
		return Ok(vec![]);
	};

	let providers = signature_providers(&cfg.signature_providers, cfg.remote_signer_timeout);
	if providers.is_empty() {
		return Err(eyre!("Producer {producer_name} has no usable signature provider"));
	}
	Ok(providers)
}

async fn run(cfg: RuntimeConfig, shutdown: CancellationToken) -> Result<()> {
	let version = clap::crate_version!();
	info!("Running RANDPA node version: {version}.");
	info!("Using config: {cfg:?}");

	let signers = configured_signers(&cfg)?;
	match &cfg.producer_name {
		Some(producer_name) => info!(%producer_name, keys = signers.len(), "Running as validator"),
		None => info!("Running as observer"),
	}

	let summary = devnet::run((&cfg).into(), signers, shutdown)
		.await
		.wrap_err("Devnet failed")?;
	info!(
		produced = summary.produced,
		head = ?summary.head,
		finalized = ?summary.finalized.first().copied().flatten(),
		"Devnet stopped"
	);
	Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = CancellationToken::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.clone())?;

	let span = span!(
		Level::INFO,
		"run",
		producer_name = cfg.producer_name.clone().unwrap_or_default()
	);
	// Do not enter span if logs format is not JSON
	let _enter = if cfg.log_format_json {
		Some(span.enter())
	} else {
		None
	};

	// spawn a task to watch for ctrl-c signals from user to trigger the shutdown
	spawn_in_span({
		let shutdown = shutdown.clone();
		async move {
			user_signal().await;
			info!("User signaled shutdown");
			shutdown.cancel();
		}
	});

	if let Err(error) = run(cfg, shutdown.clone()).await {
		error!("{error:#}");
		shutdown.cancel();
		return Err(error.wrap_err("Running RANDPA node failed"));
	};

	Ok(())
}
