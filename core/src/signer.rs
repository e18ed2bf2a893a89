//! Vote signing backends.
//!
//! Providers are configured with `<public-key-hex>=<scheme>:<data>` entries, where the scheme is
//! `local-key` (data is the hex encoded ed25519 seed) or `remote-signer` (data is the signer URL).

use std::{str::FromStr, sync::Arc, time::Duration};

use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
#[cfg(test)]
use mockall::automock;
use sp_core::{ed25519, Pair as _};
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::types::{PublicKey, Signature};

#[cfg_attr(test, automock)]
pub trait SignatureProvider: Send + Sync {
	fn public_key(&self) -> PublicKey;

	fn sign(&self, digest: &[u8; 32]) -> Result<Signature>;
}

/// Signs with an ed25519 key held in memory.
pub struct LocalKeySigner {
	pair: ed25519::Pair,
}

impl LocalKeySigner {
	pub fn new(pair: ed25519::Pair) -> Self {
		LocalKeySigner { pair }
	}

	pub fn from_seed_hex(seed: &str) -> Result<Self> {
		let seed = decode_array::<32>(seed).wrap_err("Invalid local key seed")?;
		Ok(LocalKeySigner::new(ed25519::Pair::from_seed(&seed)))
	}
}

impl SignatureProvider for LocalKeySigner {
	fn public_key(&self) -> PublicKey {
		self.pair.public()
	}

	fn sign(&self, digest: &[u8; 32]) -> Result<Signature> {
		Ok(self.pair.sign(digest))
	}
}

/// Delegates signing to an external service. The request body is `[digest_hex, public_key_hex]`,
/// the response is the hex encoded signature.
pub struct RemoteSigner {
	url: String,
	public_key: PublicKey,
	timeout: Option<Duration>,
}

impl RemoteSigner {
	/// Without a timeout, requests wait for the signer indefinitely.
	pub fn new(url: String, public_key: PublicKey, timeout: Option<Duration>) -> Self {
		RemoteSigner {
			url,
			public_key,
			timeout,
		}
	}
}

impl SignatureProvider for RemoteSigner {
	fn public_key(&self) -> PublicKey {
		self.public_key
	}

	fn sign(&self, digest: &[u8; 32]) -> Result<Signature> {
		// Blocking client must not outlive the blocking context, so it is built per request
		let client = reqwest::blocking::Client::builder()
			.timeout(self.timeout)
			.build()
			.wrap_err("Failed to build remote signer client")?;

		let params = [hex::encode(digest), hex::encode(self.public_key)];
		let response = client
			.post(&self.url)
			.json(&params)
			.send()
			.and_then(|response| response.error_for_status())
			.wrap_err_with(|| format!("Remote signer {} request failed", self.url))?
			.json::<String>()
			.wrap_err("Failed to parse remote signer response")?;

		let signature = Signature::from_raw(
			decode_array::<64>(&response).wrap_err("Invalid remote signature")?,
		);
		if !ed25519::Pair::verify(&signature, digest, &self.public_key) {
			return Err(eyre!("Remote signer returned a signature for another key"));
		}
		Ok(signature)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum SignerScheme {
	LocalKey,
	RemoteSigner,
}

/// Parsed `<public-key-hex>=<scheme>:<data>` entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerSpec {
	pub public_key: PublicKey,
	pub scheme: SignerScheme,
	pub data: String,
}

impl FromStr for SignerSpec {
	type Err = color_eyre::Report;

	fn from_str(spec: &str) -> Result<Self> {
		let (public_key, provider) = spec
			.split_once('=')
			.ok_or_else(|| eyre!("Expected <public-key>=<scheme>:<data>"))?;
		let (scheme, data) = provider
			.split_once(':')
			.ok_or_else(|| eyre!("Expected <scheme>:<data> after the public key"))?;

		let public_key = PublicKey::from_raw(
			decode_array::<32>(public_key.trim()).wrap_err("Invalid public key")?,
		);
		let scheme = SignerScheme::from_str(scheme)
			.map_err(|_| eyre!("Unsupported signature provider scheme {scheme}"))?;
		if data.is_empty() {
			return Err(eyre!("Missing {scheme} data"));
		}

		Ok(SignerSpec {
			public_key,
			scheme,
			data: data.to_string(),
		})
	}
}

impl SignerSpec {
	pub fn into_provider(self, remote_timeout: Option<Duration>) -> Result<Arc<dyn SignatureProvider>> {
		match self.scheme {
			SignerScheme::LocalKey => {
				let signer = LocalKeySigner::from_seed_hex(&self.data)?;
				if signer.public_key() != self.public_key {
					return Err(eyre!("Local key does not match public key {}", hex::encode(self.public_key)));
				}
				Ok(Arc::new(signer))
			},
			SignerScheme::RemoteSigner => Ok(Arc::new(RemoteSigner::new(
				self.data,
				self.public_key,
				remote_timeout,
			))),
		}
	}
}

/// Builds providers for every well formed entry. Malformed entries are logged and skipped.
pub fn signature_providers(
	specs: &[String],
	remote_timeout: Option<Duration>,
) -> Vec<Arc<dyn SignatureProvider>> {
	let providers: Vec<_> = specs
		.iter()
		.filter_map(|spec| {
			match SignerSpec::from_str(spec).and_then(|parsed| parsed.into_provider(remote_timeout)) {
				Ok(provider) => {
					debug!(public_key = %hex::encode(provider.public_key()), "Signature provider configured");
					Some(provider)
				},
				Err(error) => {
					warn!("Malformed signature provider {spec}: {error:#}");
					None
				},
			}
		})
		.collect();

	info!("{} signature provider(s) configured", providers.len());
	providers
}

fn decode_array<const N: usize>(value: &str) -> Result<[u8; N]> {
	let bytes = hex::decode(value.trim_start_matches("0x")).wrap_err("Invalid hex")?;
	let length = bytes.len();
	bytes
		.try_into()
		.map_err(|_| eyre!("Expected {N} bytes, found {length}"))
}
