//! Vote collection and quorum detection for a single round.
//!
//! One vote per validator and stage is counted, the first one seen. A later vote for another
//! block is kept as equivocation evidence and never replaces the counted one.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	chain_tree::ChainTree,
	finality::SignedPrecommit,
	types::{Hash, PublicKey, Signature, Stage, ValidatorSet},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedVote {
	pub block: Hash,
	pub signature: Signature,
}

/// Two conflicting votes of the same validator in the same round and stage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Equivocation {
	pub stage: Stage,
	pub validator: PublicKey,
	pub first: SignedVote,
	pub second: SignedVote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
	Accepted,
	DuplicateIgnored,
	Equivocation,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TallyError {
	#[error("Vote from unknown validator {0:?}")]
	UnknownValidator(PublicKey),
}

#[derive(Debug)]
pub struct VoteTally {
	validators: ValidatorSet,
	prevotes: BTreeMap<PublicKey, SignedVote>,
	precommits: BTreeMap<PublicKey, SignedVote>,
	equivocations: Vec<Equivocation>,
}

impl VoteTally {
	pub fn new(validators: ValidatorSet) -> Self {
		VoteTally {
			validators,
			prevotes: BTreeMap::new(),
			precommits: BTreeMap::new(),
			equivocations: vec![],
		}
	}

	pub fn validators(&self) -> &ValidatorSet {
		&self.validators
	}

	fn stage_votes(&self, stage: Stage) -> &BTreeMap<PublicKey, SignedVote> {
		match stage {
			Stage::Prevote => &self.prevotes,
			Stage::Precommit => &self.precommits,
		}
	}

	/// Counted votes of the given stage, ordered by validator key.
	pub fn votes(&self, stage: Stage) -> impl Iterator<Item = (&PublicKey, &SignedVote)> {
		self.stage_votes(stage).iter()
	}

	pub fn vote_of(&self, stage: Stage, validator: &PublicKey) -> Option<&SignedVote> {
		self.stage_votes(stage).get(validator)
	}

	pub fn vote_count(&self, stage: Stage) -> usize {
		self.stage_votes(stage).len()
	}

	pub fn equivocations(&self) -> &[Equivocation] {
		&self.equivocations
	}

	/// Records the vote of `validator`. Signature checks are the caller's responsibility.
	pub fn record_vote(
		&mut self,
		stage: Stage,
		validator: PublicKey,
		block: Hash,
		signature: Signature,
	) -> Result<VoteOutcome, TallyError> {
		if !self.validators.contains(&validator) {
			return Err(TallyError::UnknownValidator(validator));
		}

		let votes = match stage {
			Stage::Prevote => &mut self.prevotes,
			Stage::Precommit => &mut self.precommits,
		};

		let Some(first) = votes.get(&validator) else {
			votes.insert(validator, SignedVote { block, signature });
			return Ok(VoteOutcome::Accepted);
		};

		if first.block == block {
			return Ok(VoteOutcome::DuplicateIgnored);
		}

		let known = self.equivocations.iter().any(|evidence| {
			evidence.stage == stage && evidence.validator == validator && evidence.second.block == block
		});
		if known {
			return Ok(VoteOutcome::DuplicateIgnored);
		}

		warn!(
			%stage,
			validator = ?validator,
			first = ?first.block,
			second = ?block,
			"Equivocation detected"
		);
		self.equivocations.push(Equivocation {
			stage,
			validator,
			first: first.clone(),
			second: SignedVote { block, signature },
		});
		Ok(VoteOutcome::Equivocation)
	}

	/// Deepest block whose own votes plus the votes of its descendants reach the quorum
	/// threshold. The tree root is already final and is never returned.
	///
	/// Votes for blocks that are not in the tree are not counted.
	pub fn quorum_target(&self, stage: Stage, tree: &ChainTree) -> Option<Hash> {
		let threshold = self.validators.threshold();
		let mut weights: HashMap<Hash, usize> = HashMap::new();
		for vote in self.stage_votes(stage).values() {
			for id in tree.path_to_root(&vote.block) {
				*weights.entry(id).or_default() += 1;
			}
		}

		let weight = |id: &Hash| weights.get(id).copied().unwrap_or_default();
		let root = tree.root();
		if weight(&root) < threshold {
			return None;
		}

		// More than half of the validators back a quorum, so at most one child can reach it
		let mut current = root;
		while let Some(child) = tree
			.children(&current)
			.iter()
			.find(|child| weight(child) >= threshold)
		{
			current = *child;
		}

		debug!(%stage, target = ?current, threshold, "Quorum target computed");
		(current != root).then_some(current)
	}

	/// Precommits cast for `block` or one of its descendants.
	pub fn precommits_for(&self, block: &Hash, tree: &ChainTree) -> Vec<SignedPrecommit> {
		self.precommits
			.iter()
			.filter(|(_, vote)| tree.ancestor_of(block, &vote.block))
			.map(|(signer, vote)| SignedPrecommit {
				target: vote.block,
				signer: *signer,
				signature: vote.signature.clone(),
			})
			.collect()
	}
}
