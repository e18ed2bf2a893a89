use clap::{command, Parser};
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the yaml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
	/// Validator identity, the node votes only when set
	#[arg(long, value_name = "NAME")]
	pub producer_name: Option<String>,
	/// Signing key in `<public-key-hex>=<scheme>:<data>` form, schemes are `local-key` and `remote-signer` (repeatable)
	#[arg(long = "signature-provider", value_name = "KEY=SCHEME:DATA")]
	pub signature_providers: Vec<String>,
	/// Round timeout in milliseconds
	#[arg(long, value_name = "MILLIS")]
	pub round_timeout: Option<u64>,
	/// Remote signer request deadline in milliseconds
	#[arg(long, value_name = "MILLIS")]
	pub remote_signer_timeout: Option<u64>,
	/// Number of finality proofs kept for catch-up requests
	#[arg(long)]
	pub retained_proofs: Option<usize>,
	/// Number of simulated devnet validators
	#[arg(long)]
	pub validators: Option<usize>,
	/// Devnet block interval in milliseconds
	#[arg(long, value_name = "MILLIS")]
	pub block_interval: Option<u64>,
	/// Stop producing devnet blocks after this block number
	#[arg(long)]
	pub block_limit: Option<u32>,
	/// Devnet blocks already on the host chain when the nodes start
	#[arg(long)]
	pub history: Option<u32>,
	/// Metrics flush interval in milliseconds
	#[arg(long, value_name = "MILLIS")]
	pub metrics_flush_interval: Option<u64>,
}
