//! Shared finality gadget structs and enums.
use codec::{Decode, Encode};
use derive_more::Display;
use sp_core::ed25519;
use std::{collections::BTreeSet, time::Duration};

pub use sp_core::H256;

/// Block identifier
pub type Hash = H256;
/// Block signing key of a validator, also used to sign votes
pub type PublicKey = ed25519::Public;
pub type Signature = ed25519::Signature;
/// Identifier of a peer session on the transport
pub type SessionId = u32;

/// Default round deadline, after which local votes are re-broadcast
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_millis(3000);
/// Default number of justifications kept for catch-up requests
pub const DEFAULT_RETAINED_PROOFS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct BlockRef {
	pub id: Hash,
	pub parent_id: Hash,
}

/// Contiguous run of new blocks extending `base`, inserted atomically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSegment {
	pub base: Hash,
	pub blocks: Vec<Hash>,
}

impl ChainSegment {
	pub fn new(base: Hash, blocks: Vec<Hash>) -> Self {
		ChainSegment { base, blocks }
	}

	/// Segment made of one block on top of its parent
	pub fn single(parent_id: Hash, id: Hash) -> Self {
		ChainSegment {
			base: parent_id,
			blocks: vec![id],
		}
	}

	/// Last block of the segment, or the base if the segment is empty
	pub fn head(&self) -> Hash {
		self.blocks.last().copied().unwrap_or(self.base)
	}
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub enum Stage {
	#[display("prevote")]
	Prevote,
	#[display("precommit")]
	Precommit,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RoundStage {
	#[display("prevoting")]
	Prevoting,
	#[display("precommitting")]
	Precommitting,
	#[display("finalized")]
	Finalized,
}

/// Active block signing keys at some block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatorSet(BTreeSet<PublicKey>);

impl ValidatorSet {
	pub fn new(keys: impl IntoIterator<Item = PublicKey>) -> Self {
		ValidatorSet(keys.into_iter().collect())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn contains(&self, key: &PublicKey) -> bool {
		self.0.contains(key)
	}

	pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
		self.0.iter()
	}

	/// Number of distinct validators needed for a quorum: `floor(2N/3) + 1`
	pub fn threshold(&self) -> usize {
		self.len() * 2 / 3 + 1
	}
}

impl FromIterator<PublicKey> for ValidatorSet {
	fn from_iter<T: IntoIterator<Item = PublicKey>>(iter: T) -> Self {
		ValidatorSet::new(iter)
	}
}

/// Finality engine configuration (see `RuntimeConfig` of the client for details)
#[derive(Clone, Debug)]
pub struct RandpaConfig {
	/// Node has a validator identity and may vote
	pub is_validator: bool,
	pub round_timeout: Duration,
	pub retained_proofs: usize,
}

impl Default for RandpaConfig {
	fn default() -> Self {
		RandpaConfig {
			is_validator: false,
			round_timeout: DEFAULT_ROUND_TIMEOUT,
			retained_proofs: DEFAULT_RETAINED_PROOFS,
		}
	}
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_millis_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(value))
	}
}

pub mod option_duration_millis_format {
	use super::duration_millis_format;
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match duration {
			Some(duration) => duration_millis_format::serialize(duration, serializer),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = Option::<u64>::deserialize(deserializer)?;
		Ok(value.map(Duration::from_millis))
	}
}
