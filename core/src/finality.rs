use std::collections::{BTreeSet, HashMap};

use codec::{Decode, Encode};
use itertools::{Either, Itertools};
use sp_core::ed25519;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	types::{BlockRef, Hash, PublicKey, Signature, Stage, ValidatorSet},
	utils::blake2_256,
};

/// Prefix of every signed vote, keeps vote signatures apart from other uses of the key
const VOTE_CONTEXT: &[u8; 6] = b"randpa";

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SignedPrecommit {
	/// Block the precommit was cast for, the justified block or one of its descendants
	pub target: Hash,
	pub signer: PublicKey,
	pub signature: Signature,
}

/// Portable proof that a quorum of validators precommitted to `block` in `round`.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Justification {
	pub block: Hash,
	pub round: u64,
	pub precommits: Vec<SignedPrecommit>,
	/// Links from precommit targets back to `block`, empty when every target is `block`
	pub ancestry: Vec<BlockRef>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
	#[error("No validators known for block {0:?}")]
	EmptyValidatorSet(Hash),
	#[error("Not signed by supermajority of validator set: {signed}/{required} signatures")]
	NotSignedBySupermajority { signed: usize, required: usize },
}

/// Digest signed by validators when voting for `block` in the given round and stage.
pub fn vote_digest(stage: Stage, round: u64, block: &Hash) -> [u8; 32] {
	blake2_256(&(VOTE_CONTEXT, stage, round, block).encode())
}

pub fn verify_vote(
	stage: Stage,
	round: u64,
	block: &Hash,
	signer: &PublicKey,
	signature: &Signature,
) -> bool {
	let digest = vote_digest(stage, round, block);
	<ed25519::Pair as sp_core::Pair>::verify(signature, digest, signer)
}

/// Verifies that the justification carries valid precommits from a supermajority of the given
/// validator set. Invalid or duplicated precommits are not counted.
pub fn verify_justification(
	validator_set: &ValidatorSet,
	justification: &Justification,
) -> Result<(), ProofError> {
	if validator_set.is_empty() {
		return Err(ProofError::EmptyValidatorSet(justification.block));
	}

	// Make sure every signer is counted only once
	let mut seen = BTreeSet::new();
	let precommits = justification
		.precommits
		.iter()
		.filter(|precommit| seen.insert(precommit.signer));

	let ancestry_map: HashMap<Hash, Hash> = justification
		.ancestry
		.iter()
		.map(|link| (link.id, link.parent_id))
		.collect();

	let (failed_verifications, signers): (Vec<_>, Vec<_>) =
		precommits.partition_map(|precommit| {
			let is_ok = verify_vote(
				Stage::Precommit,
				justification.round,
				&precommit.target,
				&precommit.signer,
				&precommit.signature,
			);
			let ancestry =
				confirm_ancestry(&precommit.target, &justification.block, &ancestry_map);

			if is_ok && ancestry {
				Either::Right(precommit.signer)
			} else {
				Either::Left(precommit)
			}
		});

	for precommit in failed_verifications {
		warn!(
			target_block = ?precommit.target,
			block = ?justification.block,
			signer = ?precommit.signer,
			round = justification.round,
			"Failed precommit verification"
		);
	}

	let num_matched_signers = signers
		.iter()
		.filter(|signer| validator_set.contains(signer))
		.count();

	debug!(
		block = ?justification.block,
		round = justification.round,
		"Number of matching signatures: {num_matched_signers}/{}",
		validator_set.len()
	);

	is_signed_by_supermajority(num_matched_signers, validator_set.len())
		.then_some(())
		.ok_or(ProofError::NotSignedBySupermajority {
			signed: num_matched_signers,
			required: validator_set.threshold(),
		})
}

pub fn is_signed_by_supermajority(num_signatures: usize, validator_set_size: usize) -> bool {
	let supermajority = (validator_set_size * 2 / 3) + 1;
	num_signatures >= supermajority
}

fn confirm_ancestry(child_hash: &Hash, root_hash: &Hash, ancestry_map: &HashMap<Hash, Hash>) -> bool {
	if child_hash == root_hash {
		return true;
	}

	let mut curr_hash = child_hash;

	// We should be able to test it in at most ancestry_map.len() passes
	for _ in 0..ancestry_map.len() {
		if let Some(parent_hash) = ancestry_map.get(curr_hash) {
			if parent_hash == root_hash {
				return true;
			}
			curr_hash = parent_hash;
		} else {
			return false;
		}
	}

	false
}
