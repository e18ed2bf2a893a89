//! Round state machine of the finality gadget.
//!
//! The engine is synchronous and owns all mutable gadget state. Every input is an [`Event`] and
//! every side effect the engine wants performed is returned as an [`Effect`], which the caller
//! dispatches on its own executor. Signing is one of those effects: the signature comes back later
//! as [`Event::VoteSigned`], so a slow signing backend never holds up other events.
//!
//! A round moves from prevoting to precommitting once a quorum of prevotes is observed, and
//! finalizes the GHOST target of the precommits once those reach a quorum. A round that never
//! reaches quorum waits indefinitely; round ticks only re-broadcast local votes.

use std::{
	collections::{BTreeSet, HashSet},
	sync::Arc,
};

use tracing::{debug, info, trace, warn};

use crate::{
	catch_up::CatchUpResponder,
	chain_tree::{ChainTree, TreeError},
	finality::{verify_justification, verify_vote, Justification},
	messages::{FinalityNotice, FinalityReqProof, Handshake, Message, VoteMessage},
	signer::SignatureProvider,
	tally::{VoteOutcome, VoteTally},
	types::{
		ChainSegment, Hash, PublicKey, RandpaConfig, RoundStage, SessionId, Signature, Stage,
		ValidatorSet,
	},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
	/// Host chain accepted a block
	BlockAccepted {
		id: Hash,
		parent_id: Hash,
		number: u32,
		signer: PublicKey,
		/// Active validator set at the block
		validators: ValidatorSet,
		/// Host is still syncing, no local votes on this block
		is_syncing: bool,
	},
	/// Host chain considers the block irreversible by its own rules
	BlockIrreversible { id: Hash, number: u32 },
	NewPeer { session: SessionId },
	Message { session: SessionId, message: Message },
	RoundTick,
	/// Outcome of an [`Effect::Sign`], `None` when the provider failed
	VoteSigned {
		stage: Stage,
		round: u64,
		block: Hash,
		signer: PublicKey,
		signature: Option<Signature>,
	},
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
	Send { session: SessionId, message: Message },
	Broadcast(Message),
	Finalize(Hash),
	/// Sign the local vote with the provider of `signer` and report back with
	/// [`Event::VoteSigned`]
	Sign {
		stage: Stage,
		round: u64,
		block: Hash,
		signer: PublicKey,
	},
}

#[derive(Debug)]
struct Round {
	number: u64,
	stage: RoundStage,
	tally: VoteTally,
	/// Local votes handed to the signer and not reported back yet
	signing: BTreeSet<Stage>,
}

impl Round {
	fn new(number: u64, validators: ValidatorSet) -> Self {
		Round {
			number,
			stage: RoundStage::Prevoting,
			tally: VoteTally::new(validators),
			signing: BTreeSet::new(),
		}
	}
}

fn vote_message(stage: Stage, vote: VoteMessage) -> Message {
	match stage {
		Stage::Prevote => Message::Prevote(vote),
		Stage::Precommit => Message::Precommit(vote),
	}
}

pub struct RoundEngine {
	signers: Vec<Arc<dyn SignatureProvider>>,
	tree: ChainTree,
	round: Round,
	last_finalized_round: u64,
	/// Validator set reported with the latest accepted block
	active_validators: ValidatorSet,
	catch_up: CatchUpResponder,
	is_syncing: bool,
}

impl RoundEngine {
	/// Creates an engine anchored at `root`. Signature providers are only used when the node is
	/// configured as a validator.
	pub fn new(
		config: &RandpaConfig,
		root: Hash,
		validators: ValidatorSet,
		signers: Vec<Arc<dyn SignatureProvider>>,
	) -> Self {
		Self::with_tree(config, ChainTree::new(root, validators), signers)
	}

	/// Creates an engine on top of a tree restored from the host chain, see
	/// [`ChainTree::from_snapshot`]. The active validator set is the one of the best block.
	pub fn with_tree(
		config: &RandpaConfig,
		tree: ChainTree,
		signers: Vec<Arc<dyn SignatureProvider>>,
	) -> Self {
		let root = tree.root();
		let head = tree.best_descendant(&root).unwrap_or(root);
		let validators = tree
			.validators(&head)
			.or_else(|| tree.validators(&root))
			.cloned()
			.unwrap_or_default();

		let signers = if config.is_validator {
			signers
		} else {
			if !signers.is_empty() {
				info!("No validator identity, ignoring {} signature provider(s)", signers.len());
			}
			vec![]
		};

		RoundEngine {
			signers,
			tree,
			round: Round::new(1, validators.clone()),
			last_finalized_round: 0,
			active_validators: validators,
			catch_up: CatchUpResponder::new(config.retained_proofs),
			is_syncing: false,
		}
	}

	/// Resumes numbering after `round`, for a root that was finalized before startup.
	pub fn with_last_finalized_round(mut self, round: u64) -> Self {
		self.last_finalized_round = round;
		self.round = Round::new(round + 1, self.active_validators.clone());
		self
	}

	pub fn root(&self) -> Hash {
		self.tree.root()
	}

	pub fn round(&self) -> u64 {
		self.round.number
	}

	pub fn stage(&self) -> RoundStage {
		self.round.stage
	}

	pub fn last_finalized_round(&self) -> u64 {
		self.last_finalized_round
	}

	pub fn tree(&self) -> &ChainTree {
		&self.tree
	}

	pub fn tally(&self) -> &VoteTally {
		&self.round.tally
	}

	pub fn latest_justification(&self) -> Option<&Justification> {
		self.catch_up.latest()
	}

	/// Provider holding the key of `public_key`, for [`Effect::Sign`]
	pub fn signer(&self, public_key: &PublicKey) -> Option<Arc<dyn SignatureProvider>> {
		self.signers
			.iter()
			.find(|signer| signer.public_key() == *public_key)
			.cloned()
	}

	/// Processes a single event and returns the effects to perform, in order.
	pub fn handle(&mut self, event: Event) -> Vec<Effect> {
		let mut effects = vec![];
		match event {
			Event::BlockAccepted {
				id,
				parent_id,
				number,
				signer,
				validators,
				is_syncing,
			} => {
				self.is_syncing = is_syncing;
				self.active_validators = validators.clone();
				self.on_block_accepted(id, parent_id, number, signer, validators);
				self.progress(&mut effects);
			},
			Event::BlockIrreversible { id, number } => {
				debug!(block = ?id, number, "Block irreversible on host chain");
			},
			Event::NewPeer { session } => {
				effects.push(Effect::Send {
					session,
					message: Message::Handshake(Handshake {
						root: self.tree.root(),
					}),
				});
			},
			Event::Message { session, message } => self.on_message(session, message, &mut effects),
			Event::RoundTick => self.on_round_tick(&mut effects),
			Event::VoteSigned {
				stage,
				round,
				block,
				signer,
				signature,
			} => self.on_vote_signed(stage, round, block, signer, signature, &mut effects),
		}
		effects
	}

	fn on_block_accepted(
		&mut self,
		id: Hash,
		parent_id: Hash,
		number: u32,
		signer: PublicKey,
		validators: ValidatorSet,
	) {
		if id == self.tree.root() {
			trace!(block = ?id, number, "Block is the finalized root");
			return;
		}

		match self
			.tree
			.insert(&ChainSegment::single(parent_id, id), signer, validators)
		{
			Ok(()) => trace!(block = ?id, number, "Block added to the tree"),
			Err(TreeError::UnknownBase(_)) => {
				debug!(block = ?id, parent = ?parent_id, number, "Block does not extend the finalized root")
			},
			Err(error) => warn!(block = ?id, number, "Cannot add block: {error}"),
		}
	}

	fn on_message(&mut self, session: SessionId, message: Message, effects: &mut Vec<Effect>) {
		match message {
			Message::Prevote(vote) => self.on_vote(Stage::Prevote, vote, effects),
			Message::Precommit(vote) => self.on_vote(Stage::Precommit, vote, effects),
			Message::Proof(justification) => self.on_proof(session, justification, effects),
			Message::Handshake(Handshake { root }) => {
				effects.push(Effect::Send {
					session,
					message: Message::HandshakeAns(Handshake {
						root: self.tree.root(),
					}),
				});
				self.compare_roots(session, root, effects);
			},
			Message::HandshakeAns(Handshake { root }) => self.compare_roots(session, root, effects),
			Message::FinalityNotice(notice) => self.on_finality_notice(session, notice, effects),
			Message::FinalityReqProof(FinalityReqProof { block }) => {
				match self.catch_up.on_request(&block) {
					Ok(justification) => effects.push(Effect::Send {
						session,
						message: Message::Proof(justification.clone()),
					}),
					Err(error) => debug!(session, block = ?block, "Proof request not answered: {error}"),
				}
			},
		}
	}

	fn on_vote(&mut self, stage: Stage, vote: VoteMessage, effects: &mut Vec<Effect>) {
		let round = self.round.number;
		if vote.round != round {
			trace!(%stage, round, vote_round = vote.round, "Vote for another round dropped");
			return;
		}
		if !self.round.tally.validators().contains(&vote.signer) {
			debug!(%stage, round, signer = ?vote.signer, "Vote from non-validator dropped");
			return;
		}
		if !vote.verify(stage) {
			warn!(%stage, round, signer = ?vote.signer, "Vote with invalid signature dropped");
			return;
		}
		if !self.tree.contains(&vote.block) {
			debug!(%stage, round, block = ?vote.block, "Vote for unknown block dropped");
			return;
		}

		match self
			.round
			.tally
			.record_vote(stage, vote.signer, vote.block, vote.signature)
		{
			Ok(VoteOutcome::Accepted) => self.progress(effects),
			Ok(VoteOutcome::DuplicateIgnored) => trace!(%stage, round, "Duplicate vote ignored"),
			Ok(VoteOutcome::Equivocation) => {},
			Err(error) => debug!(%stage, round, "Vote dropped: {error}"),
		}
	}

	fn on_round_tick(&mut self, effects: &mut Vec<Effect>) {
		let round = self.round.number;
		for signer in &self.signers {
			let public_key = signer.public_key();
			for stage in [Stage::Prevote, Stage::Precommit] {
				if let Some(vote) = self.round.tally.vote_of(stage, &public_key) {
					effects.push(Effect::Broadcast(vote_message(
						stage,
						VoteMessage {
							round,
							block: vote.block,
							signer: public_key,
							signature: vote.signature.clone(),
						},
					)));
				}
			}
		}

		if self.round.stage == RoundStage::Precommitting {
			if let Some(target) = self.round.tally.quorum_target(Stage::Prevote, &self.tree) {
				self.cast_vote(Stage::Precommit, target, effects);
			}
		}
		self.progress(effects);
	}

	fn compare_roots(&mut self, session: SessionId, peer_root: Hash, effects: &mut Vec<Effect>) {
		let root = self.tree.root();
		if peer_root == root {
			return;
		}

		if self.tree.contains(&peer_root) {
			debug!(session, peer_root = ?peer_root, "Peer finality is ahead, requesting proof");
			effects.push(Effect::Send {
				session,
				message: Message::FinalityReqProof(FinalityReqProof { block: peer_root }),
			});
		} else if let Some(notice) = self.catch_up.notice() {
			debug!(session, peer_root = ?peer_root, "Peer finality is behind, sending notice");
			effects.push(Effect::Send {
				session,
				message: Message::FinalityNotice(notice),
			});
		}
	}

	fn on_finality_notice(
		&mut self,
		session: SessionId,
		notice: FinalityNotice,
		effects: &mut Vec<Effect>,
	) {
		if notice.round <= self.last_finalized_round {
			trace!(session, round = notice.round, "Stale finality notice ignored");
			return;
		}

		debug!(session, block = ?notice.block, round = notice.round, "Requesting finality proof");
		effects.push(Effect::Send {
			session,
			message: Message::FinalityReqProof(FinalityReqProof {
				block: notice.block,
			}),
		});
	}

	fn on_proof(&mut self, session: SessionId, justification: Justification, effects: &mut Vec<Effect>) {
		if justification.round <= self.last_finalized_round {
			trace!(session, round = justification.round, "Stale proof ignored");
			return;
		}

		let block = justification.block;
		let validators = self
			.tree
			.validators(&block)
			.cloned()
			.unwrap_or_else(|| self.active_validators.clone());
		if let Err(error) = verify_justification(&validators, &justification) {
			warn!(session, block = ?block, round = justification.round, "Invalid proof: {error}");
			return;
		}

		let finalized = self.newly_finalized(&block);
		if self.tree.contains(&block) {
			if let Err(error) = self.tree.prune(&block) {
				warn!(block = ?block, "Cannot prune to proven block: {error}");
			}
		} else {
			self.tree.reset(block, validators);
		}

		info!(block = ?block, round = justification.round, "Finality caught up from proof");
		self.last_finalized_round = justification.round;
		effects.push(Effect::Finalize(block));
		self.catch_up.retain(justification, finalized);
		self.start_round(self.last_finalized_round + 1);
		self.progress(effects);
	}

	/// Key of the first signer allowed to vote in the current round
	fn voter(&self) -> Option<PublicKey> {
		if self.is_syncing {
			return None;
		}
		self.signers
			.iter()
			.map(|signer| signer.public_key())
			.find(|public_key| self.round.tally.validators().contains(public_key))
	}

	/// Requests a signature for the local vote, unless one was already cast or is being signed.
	fn cast_vote(&mut self, stage: Stage, block: Hash, effects: &mut Vec<Effect>) {
		let Some(signer) = self.voter() else {
			return;
		};
		if self.round.tally.vote_of(stage, &signer).is_some() || self.round.signing.contains(&stage) {
			return;
		}

		let round = self.round.number;
		debug!(%stage, round, block = ?block, "Signing vote");
		self.round.signing.insert(stage);
		effects.push(Effect::Sign {
			stage,
			round,
			block,
			signer,
		});
	}

	/// Records and broadcasts a signed local vote.
	fn on_vote_signed(
		&mut self,
		stage: Stage,
		round: u64,
		block: Hash,
		public_key: PublicKey,
		signature: Option<Signature>,
		effects: &mut Vec<Effect>,
	) {
		if round != self.round.number {
			trace!(%stage, round, "Signature for a past round dropped");
			return;
		}
		self.round.signing.remove(&stage);

		let Some(signature) = signature else {
			debug!(%stage, round, "Vote not signed, retrying on the next tick");
			return;
		};
		if !verify_vote(stage, round, &block, &public_key, &signature) {
			warn!(%stage, round, "Signer returned an invalid signature");
			return;
		}

		debug!(%stage, round, block = ?block, "Casting vote");
		if let Err(error) =
			self.round
				.tally
				.record_vote(stage, public_key, block, signature.clone())
		{
			warn!(%stage, round, "Local vote not recorded: {error}");
			return;
		}
		effects.push(Effect::Broadcast(vote_message(
			stage,
			VoteMessage {
				round,
				block,
				signer: public_key,
				signature,
			},
		)));
		self.progress(effects);
	}

	/// Casts due local votes and advances the round for as long as quorums allow.
	fn progress(&mut self, effects: &mut Vec<Effect>) {
		loop {
			let round = self.round.number;

			if self.round.stage == RoundStage::Prevoting {
				let root = self.tree.root();
				if let Some(best) = self.tree.best_descendant(&root).filter(|best| *best != root) {
					self.cast_vote(Stage::Prevote, best, effects);
				}

				if let Some(target) = self.round.tally.quorum_target(Stage::Prevote, &self.tree) {
					debug!(round, target = ?target, "Prevote quorum reached");
					self.cast_vote(Stage::Precommit, target, effects);
					self.round.stage = RoundStage::Precommitting;
				}
			}

			if let Some(target) = self.round.tally.quorum_target(Stage::Precommit, &self.tree) {
				self.finalize(target, effects);
			}

			if self.round.number == round {
				break;
			}
		}
	}

	fn finalize(&mut self, block: Hash, effects: &mut Vec<Effect>) {
		let round = self.round.number;
		let justification = self.justification(block);
		info!(
			block = ?block,
			round,
			precommits = justification.precommits.len(),
			"Block finalized"
		);
		self.round.stage = RoundStage::Finalized;

		effects.push(Effect::Finalize(block));
		effects.push(Effect::Broadcast(Message::FinalityNotice(FinalityNotice {
			block,
			round,
		})));

		let finalized = self.newly_finalized(&block);
		if let Err(error) = self.tree.prune(&block) {
			warn!(block = ?block, "Cannot prune to finalized block: {error}");
		}
		self.catch_up.retain(justification, finalized);
		self.last_finalized_round = round;
		self.start_round(round + 1);
	}

	fn justification(&self, block: Hash) -> Justification {
		let precommits = self.round.tally.precommits_for(&block, &self.tree);

		let mut seen = HashSet::new();
		let ancestry = precommits
			.iter()
			.flat_map(|precommit| {
				self.tree
					.route(&precommit.target, &block)
					.unwrap_or_default()
			})
			.filter(|link| seen.insert(link.id))
			.collect();

		Justification {
			block,
			round: self.round.number,
			precommits,
			ancestry,
		}
	}

	/// Blocks between the root (exclusive) and `block`, or just `block` when it is not in the tree
	fn newly_finalized(&self, block: &Hash) -> Vec<Hash> {
		self.tree
			.route(block, &self.tree.root())
			.map(|links| links.into_iter().map(|link| link.id).collect())
			.unwrap_or_else(|| vec![*block])
	}

	fn start_round(&mut self, number: u64) {
		self.round = Round::new(number, self.active_validators.clone());
		debug!(
			round = number,
			validators = self.active_validators.len(),
			"Round started"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		chain_tree::SnapshotBlock,
		finality::vote_digest,
		signer::LocalKeySigner,
		test_utils::{hash, keys, outsider, validator_set},
		types::BlockRef,
	};
	use color_eyre::{eyre::eyre, Result};
	use sp_core::{ed25519::Pair, Pair as _};
	use std::{
		collections::{HashMap, VecDeque},
		sync::atomic::{AtomicBool, Ordering},
	};

	fn validators_of(pairs: &[Pair]) -> ValidatorSet {
		validator_set(&pairs.iter().map(|pair| pair.public()).collect::<Vec<_>>())
	}

	fn validator_config() -> RandpaConfig {
		RandpaConfig {
			is_validator: true,
			..Default::default()
		}
	}

	fn validator(pair: &Pair, validators: &ValidatorSet) -> RoundEngine {
		RoundEngine::new(
			&validator_config(),
			hash(0),
			validators.clone(),
			vec![Arc::new(LocalKeySigner::new(pair.clone()))],
		)
	}

	fn observer(validators: &ValidatorSet) -> RoundEngine {
		RoundEngine::new(&RandpaConfig::default(), hash(0), validators.clone(), vec![])
	}

	fn accepted(id: u64, parent: u64, signer: &Pair, validators: &ValidatorSet) -> Event {
		Event::BlockAccepted {
			id: hash(id),
			parent_id: hash(parent),
			number: id as u32,
			signer: signer.public(),
			validators: validators.clone(),
			is_syncing: false,
		}
	}

	fn vote(pair: &Pair, stage: Stage, round: u64, block: Hash) -> Message {
		vote_message(
			stage,
			VoteMessage {
				round,
				block,
				signer: pair.public(),
				signature: pair.sign(&vote_digest(stage, round, &block)),
			},
		)
	}

	/// Handles `event` and signs requested votes in place, the way the service reports them back
	fn run(engine: &mut RoundEngine, event: Event) -> Vec<Effect> {
		let mut events = VecDeque::from([event]);
		let mut effects = vec![];
		while let Some(event) = events.pop_front() {
			for effect in engine.handle(event) {
				match effect {
					Effect::Sign {
						stage,
						round,
						block,
						signer,
					} => {
						let signature = engine
							.signer(&signer)
							.and_then(|provider| provider.sign(&vote_digest(stage, round, &block)).ok());
						events.push_back(Event::VoteSigned {
							stage,
							round,
							block,
							signer,
							signature,
						});
					},
					effect => effects.push(effect),
				}
			}
		}
		effects
	}

	fn deliver(engine: &mut RoundEngine, message: Message) -> Vec<Effect> {
		run(engine, Event::Message {
			session: 1,
			message,
		})
	}

	/// Feeds prevotes and then precommits for `block` from each of `voters`
	fn vote_round(engine: &mut RoundEngine, voters: &[Pair], block: Hash) -> Vec<Effect> {
		let round = engine.round();
		let mut effects = vec![];
		for stage in [Stage::Prevote, Stage::Precommit] {
			for pair in voters {
				effects.extend(deliver(engine, vote(pair, stage, round, block)));
			}
		}
		effects
	}

	#[test]
	fn quorum_of_four_finalizes_in_round_five() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators).with_last_finalized_round(4);
		assert_eq!(engine.round(), 5);

		let effects = run(&mut engine, accepted(1, 0, &pairs[1], &validators));
		assert_eq!(
			effects,
			vec![Effect::Broadcast(vote(&pairs[0], Stage::Prevote, 5, hash(1)))]
		);

		assert!(deliver(&mut engine, vote(&pairs[1], Stage::Prevote, 5, hash(1))).is_empty());
		assert_eq!(
			engine.tally().quorum_target(Stage::Prevote, engine.tree()),
			None
		);
		let effects = deliver(&mut engine, vote(&pairs[2], Stage::Prevote, 5, hash(1)));
		assert_eq!(
			effects,
			vec![Effect::Broadcast(vote(&pairs[0], Stage::Precommit, 5, hash(1)))]
		);
		assert_eq!(engine.stage(), RoundStage::Precommitting);

		assert!(deliver(&mut engine, vote(&pairs[1], Stage::Precommit, 5, hash(1))).is_empty());
		let effects = deliver(&mut engine, vote(&pairs[2], Stage::Precommit, 5, hash(1)));
		assert_eq!(
			effects,
			vec![
				Effect::Finalize(hash(1)),
				Effect::Broadcast(Message::FinalityNotice(FinalityNotice {
					block: hash(1),
					round: 5
				})),
			]
		);
		assert_eq!(engine.root(), hash(1));
		assert_eq!(engine.round(), 6);
		assert_eq!(engine.last_finalized_round(), 5);
		assert_eq!(engine.stage(), RoundStage::Prevoting);
	}

	fn requested_proof(engine: &mut RoundEngine, block: Hash) -> Justification {
		let effects = deliver(engine, Message::FinalityReqProof(FinalityReqProof { block }));
		let [Effect::Send {
			session: 1,
			message: Message::Proof(proof),
		}] = effects.as_slice()
		else {
			panic!("Expected a proof, got {effects:?}");
		};
		proof.clone()
	}

	#[test]
	fn finalized_blocks_are_answered_with_their_proof() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		run(&mut engine, accepted(1, 0, &pairs[1], &validators));
		let effects = vote_round(&mut engine, &pairs[1..3], hash(1));
		assert!(effects.contains(&Effect::Finalize(hash(1))));

		run(&mut engine, accepted(2, 1, &pairs[2], &validators));
		let effects = vote_round(&mut engine, &pairs[1..3], hash(2));
		assert!(effects.contains(&Effect::Finalize(hash(2))));
		assert_eq!(engine.root(), hash(2));

		let proof = requested_proof(&mut engine, hash(1));
		assert_eq!((proof.block, proof.round), (hash(1), 1));
		assert!(proof.precommits.len() >= 3);
		assert_eq!(verify_justification(&validators, &proof), Ok(()));

		let proof = requested_proof(&mut engine, hash(2));
		assert_eq!((proof.block, proof.round), (hash(2), 2));
		assert_eq!(verify_justification(&validators, &proof), Ok(()));

		// Starting root was never finalized by a proof
		let effects = deliver(
			&mut engine,
			Message::FinalityReqProof(FinalityReqProof { block: hash(0) }),
		);
		assert!(effects.is_empty());
	}

	#[test]
	fn finalized_ancestor_is_answered_with_covering_proof() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let block = |id: u64, parent: u64| SnapshotBlock {
			block: BlockRef {
				id: hash(id),
				parent_id: hash(parent),
			},
			signer: pairs[1].public(),
			validators: validators.clone(),
		};
		let tree =
			ChainTree::from_snapshot(hash(0), validators.clone(), [block(1, 0), block(2, 1)]).unwrap();
		let mut engine = RoundEngine::with_tree(
			&validator_config(),
			tree,
			vec![Arc::new(LocalKeySigner::new(pairs[0].clone()))],
		);
		let effects = vote_round(&mut engine, &pairs[1..3], hash(2));
		assert!(effects.contains(&Effect::Finalize(hash(2))));

		// Finalized by the proof for its descendant
		let proof = requested_proof(&mut engine, hash(1));
		assert_eq!((proof.block, proof.round), (hash(2), 1));
		assert_eq!(verify_justification(&validators, &proof), Ok(()));
	}

	#[test]
	fn proof_requests_off_the_finalized_chain_are_not_answered() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		run(&mut engine, accepted(1, 0, &pairs[1], &validators));
		run(&mut engine, accepted(2, 0, &pairs[2], &validators));
		let effects = vote_round(&mut engine, &pairs[1..3], hash(1));
		assert!(effects.contains(&Effect::Finalize(hash(1))));
		assert!(!engine.tree().contains(&hash(2)));

		// Pruned fork sibling and a never seen block
		for block in [hash(2), hash(999)] {
			let effects = deliver(
				&mut engine,
				Message::FinalityReqProof(FinalityReqProof { block }),
			);
			assert!(effects.is_empty());
		}
	}

	#[test]
	fn votes_are_signed_through_effects() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		let sign = Effect::Sign {
			stage: Stage::Prevote,
			round: 1,
			block: hash(1),
			signer: pairs[0].public(),
		};

		assert_eq!(engine.handle(accepted(1, 0, &pairs[1], &validators)), vec![sign]);
		// Still being signed, nothing to request again
		assert!(engine.handle(Event::RoundTick).is_empty());

		// Provider failed, the next tick asks again
		let failed = Event::VoteSigned {
			stage: Stage::Prevote,
			round: 1,
			block: hash(1),
			signer: pairs[0].public(),
			signature: None,
		};
		assert!(engine.handle(failed).is_empty());
		assert_eq!(engine.tally().vote_count(Stage::Prevote), 0);
		assert_eq!(engine.handle(Event::RoundTick).len(), 1);

		let prevote = vote(&pairs[0], Stage::Prevote, 1, hash(1));
		let Message::Prevote(signed) = &prevote else {
			unreachable!()
		};
		let effects = engine.handle(Event::VoteSigned {
			stage: Stage::Prevote,
			round: 1,
			block: hash(1),
			signer: pairs[0].public(),
			signature: Some(signed.signature.clone()),
		});
		assert_eq!(effects, vec![Effect::Broadcast(prevote)]);
		assert_eq!(engine.tally().vote_count(Stage::Prevote), 1);
	}

	#[test]
	fn signature_for_another_block_is_rejected() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		engine.handle(accepted(1, 0, &pairs[1], &validators));

		let effects = engine.handle(Event::VoteSigned {
			stage: Stage::Prevote,
			round: 1,
			block: hash(1),
			signer: pairs[0].public(),
			signature: Some(pairs[0].sign(&vote_digest(Stage::Prevote, 1, &hash(7)))),
		});
		assert!(effects.is_empty());
		assert_eq!(engine.tally().vote_count(Stage::Prevote), 0);
	}

	#[test]
	fn engine_starts_from_host_snapshot() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let block = |id: u64, parent: u64, author: usize| SnapshotBlock {
			block: BlockRef {
				id: hash(id),
				parent_id: hash(parent),
			},
			signer: pairs[author].public(),
			validators: validators.clone(),
		};
		let tree = ChainTree::from_snapshot(
			hash(0),
			validators.clone(),
			[block(1, 0, 1), block(2, 1, 2), block(3, 0, 3)],
		)
		.unwrap();

		let mut engine = RoundEngine::with_tree(
			&validator_config(),
			tree,
			vec![Arc::new(LocalKeySigner::new(pairs[0].clone()))],
		);
		assert_eq!(engine.root(), hash(0));
		assert_eq!(engine.tree().len(), 4);

		// First prevote goes to the best block of the snapshot
		assert_eq!(
			run(&mut engine, Event::RoundTick),
			vec![Effect::Broadcast(vote(&pairs[0], Stage::Prevote, 1, hash(2)))]
		);
	}

	#[test]
	fn proof_request_ahead_of_root_is_not_answered() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		run(&mut engine, accepted(1, 0, &pairs[1], &validators));
		vote_round(&mut engine, &pairs[1..3], hash(1));
		run(&mut engine, accepted(2, 1, &pairs[1], &validators));

		let effects = deliver(
			&mut engine,
			Message::FinalityReqProof(FinalityReqProof { block: hash(2) }),
		);
		assert!(effects.is_empty());
	}

	#[test]
	fn observer_finalizes_without_voting() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = observer(&validators);

		assert!(run(&mut engine, accepted(1, 0, &pairs[0], &validators)).is_empty());
		let effects = vote_round(&mut engine, &pairs[..3], hash(1));

		assert_eq!(
			effects,
			vec![
				Effect::Finalize(hash(1)),
				Effect::Broadcast(Message::FinalityNotice(FinalityNotice {
					block: hash(1),
					round: 1
				})),
			]
		);
		assert!(run(&mut engine, Event::RoundTick).is_empty());
	}

	#[test]
	fn syncing_validator_does_not_vote() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);

		let effects = run(&mut engine, Event::BlockAccepted {
			id: hash(1),
			parent_id: hash(0),
			number: 1,
			signer: pairs[1].public(),
			validators: validators.clone(),
			is_syncing: true,
		});
		assert!(effects.is_empty());

		let effects = run(&mut engine, accepted(2, 1, &pairs[1], &validators));
		assert_eq!(
			effects,
			vec![Effect::Broadcast(vote(&pairs[0], Stage::Prevote, 1, hash(2)))]
		);
	}

	#[test]
	fn invalid_votes_are_dropped() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		run(&mut engine, accepted(1, 0, &pairs[1], &validators));

		let mut forged = VoteMessage {
			round: 1,
			block: hash(1),
			signer: pairs[1].public(),
			signature: pairs[1].sign(&vote_digest(Stage::Prevote, 1, &hash(0))),
		};
		deliver(&mut engine, Message::Prevote(forged.clone()));
		forged.signer = pairs[2].public();
		deliver(&mut engine, Message::Prevote(forged));
		deliver(&mut engine, vote(&pairs[1], Stage::Prevote, 2, hash(1)));
		deliver(&mut engine, vote(&outsider(), Stage::Prevote, 1, hash(1)));
		deliver(&mut engine, vote(&pairs[2], Stage::Prevote, 1, hash(99)));

		// Only the local prevote was recorded
		assert_eq!(engine.tally().vote_count(Stage::Prevote), 1);
		assert_eq!(engine.stage(), RoundStage::Prevoting);
	}

	#[test]
	fn equivocating_votes_are_kept_as_evidence() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		run(&mut engine, accepted(1, 0, &pairs[1], &validators));
		run(&mut engine, accepted(2, 0, &pairs[2], &validators));

		deliver(&mut engine, vote(&pairs[3], Stage::Prevote, 1, hash(1)));
		deliver(&mut engine, vote(&pairs[3], Stage::Prevote, 1, hash(2)));

		assert_eq!(engine.tally().equivocations().len(), 1);
		assert_eq!(
			engine
				.tally()
				.vote_of(Stage::Prevote, &pairs[3].public())
				.map(|vote| vote.block),
			Some(hash(1))
		);
	}

	#[test]
	fn handshake_exchanges_roots() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = validator(&pairs[0], &validators);
		run(&mut engine, accepted(1, 0, &pairs[1], &validators));
		run(&mut engine, accepted(2, 1, &pairs[1], &validators));

		assert_eq!(
			run(&mut engine, Event::NewPeer { session: 7 }),
			vec![Effect::Send {
				session: 7,
				message: Message::Handshake(Handshake { root: hash(0) })
			}]
		);

		// Peer finalized a block we know about
		let effects = deliver(&mut engine, Message::Handshake(Handshake { root: hash(2) }));
		assert_eq!(
			effects,
			vec![
				Effect::Send {
					session: 1,
					message: Message::HandshakeAns(Handshake { root: hash(0) })
				},
				Effect::Send {
					session: 1,
					message: Message::FinalityReqProof(FinalityReqProof { block: hash(2) })
				},
			]
		);

		// Same root, nothing to do
		assert!(deliver(&mut engine, Message::HandshakeAns(Handshake { root: hash(0) })).is_empty());

		// Unknown root and nothing finalized yet
		assert!(deliver(&mut engine, Message::HandshakeAns(Handshake { root: hash(50) })).is_empty());

		vote_round(&mut engine, &pairs[1..3], hash(1));
		let effects = deliver(&mut engine, Message::HandshakeAns(Handshake { root: hash(50) }));
		assert_eq!(
			effects,
			vec![Effect::Send {
				session: 1,
				message: Message::FinalityNotice(FinalityNotice {
					block: hash(1),
					round: 1
				})
			}]
		);
	}

	#[test]
	fn lagging_node_catches_up_through_notice() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut leader = validator(&pairs[0], &validators);
		let mut lagging = validator(&pairs[3], &validators);
		run(&mut leader, accepted(1, 0, &pairs[1], &validators));

		let effects = vote_round(&mut leader, &pairs[1..3], hash(1));
		let Some(Effect::Broadcast(notice @ Message::FinalityNotice(_))) = effects.last() else {
			panic!("Expected finality notice, got {effects:?}");
		};

		let effects = deliver(&mut lagging, notice.clone());
		let [Effect::Send { message: request, .. }] = effects.as_slice() else {
			panic!("Expected proof request, got {effects:?}");
		};
		let effects = deliver(&mut leader, request.clone());
		let [Effect::Send { message: proof, .. }] = effects.as_slice() else {
			panic!("Expected proof, got {effects:?}");
		};

		// Proven block is not in the lagging tree
		let effects = deliver(&mut lagging, proof.clone());
		assert_eq!(effects, vec![Effect::Finalize(hash(1))]);
		assert_eq!(lagging.root(), hash(1));
		assert_eq!(lagging.round(), 2);
		assert_eq!(lagging.latest_justification(), leader.latest_justification());

		// Replayed notices and proofs are stale now
		assert!(deliver(&mut lagging, notice.clone()).is_empty());
		assert!(deliver(&mut lagging, proof.clone()).is_empty());
	}

	#[test]
	fn proof_without_quorum_is_rejected() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let mut engine = observer(&validators);
		run(&mut engine, accepted(1, 0, &pairs[0], &validators));

		let precommits = pairs[..2]
			.iter()
			.map(|pair| crate::finality::SignedPrecommit {
				target: hash(1),
				signer: pair.public(),
				signature: pair.sign(&vote_digest(Stage::Precommit, 3, &hash(1))),
			})
			.collect();
		let proof = Message::Proof(Justification {
			block: hash(1),
			round: 3,
			precommits,
			ancestry: vec![],
		});

		assert!(deliver(&mut engine, proof).is_empty());
		assert_eq!(engine.root(), hash(0));
		assert_eq!(engine.last_finalized_round(), 0);
	}

	struct FlakySigner {
		pair: Pair,
		failing: AtomicBool,
	}

	impl SignatureProvider for FlakySigner {
		fn public_key(&self) -> PublicKey {
			self.pair.public()
		}

		fn sign(&self, digest: &[u8; 32]) -> Result<crate::types::Signature> {
			if self.failing.load(Ordering::SeqCst) {
				return Err(eyre!("Signer unavailable"));
			}
			Ok(self.pair.sign(digest))
		}
	}

	#[test]
	fn round_tick_retries_and_rebroadcasts_votes() {
		let pairs = keys(4);
		let validators = validators_of(&pairs);
		let signer = Arc::new(FlakySigner {
			pair: pairs[0].clone(),
			failing: AtomicBool::new(true),
		});
		let mut engine = RoundEngine::new(
			&validator_config(),
			hash(0),
			validators.clone(),
			vec![signer.clone()],
		);

		assert!(run(&mut engine, accepted(1, 0, &pairs[1], &validators)).is_empty());
		assert!(run(&mut engine, Event::RoundTick).is_empty());

		signer.failing.store(false, Ordering::SeqCst);
		let prevote = vote(&pairs[0], Stage::Prevote, 1, hash(1));
		assert_eq!(
			run(&mut engine, Event::RoundTick),
			vec![Effect::Broadcast(prevote.clone())]
		);
		assert_eq!(
			run(&mut engine, Event::RoundTick),
			vec![Effect::Broadcast(prevote.clone())]
		);

		// Signer fails again when the prevote quorum is reached
		signer.failing.store(true, Ordering::SeqCst);
		for pair in &pairs[1..3] {
			deliver(&mut engine, vote(pair, Stage::Prevote, 1, hash(1)));
		}
		assert_eq!(engine.stage(), RoundStage::Precommitting);
		assert_eq!(engine.tally().vote_count(Stage::Precommit), 0);

		signer.failing.store(false, Ordering::SeqCst);
		let precommit = vote(&pairs[0], Stage::Precommit, 1, hash(1));
		assert_eq!(
			run(&mut engine, Event::RoundTick),
			vec![
				Effect::Broadcast(prevote),
				Effect::Broadcast(precommit)
			]
		);
	}

	/// Fully connected validators with pseudo-random message delivery order
	struct Network {
		pairs: Vec<Pair>,
		validators: ValidatorSet,
		engines: Vec<RoundEngine>,
		finalized: Vec<Vec<Hash>>,
		parents: HashMap<Hash, Hash>,
		queue: VecDeque<(usize, SessionId, Message)>,
		seed: u64,
	}

	impl Network {
		/// Runs engines for the first `honest` of `size` validators
		fn new(size: usize, honest: usize, seed: u64) -> Self {
			let pairs = keys(size);
			let validators = validators_of(&pairs);
			let engines = pairs[..honest]
				.iter()
				.map(|pair| validator(pair, &validators))
				.collect();
			Network {
				engines,
				finalized: vec![vec![]; honest],
				parents: HashMap::new(),
				queue: VecDeque::new(),
				seed,
				pairs,
				validators,
			}
		}

		fn apply(&mut self, from: usize, effects: Vec<Effect>) {
			for effect in effects {
				match effect {
					Effect::Finalize(block) => self.finalized[from].push(block),
					Effect::Broadcast(message) => {
						for to in (0..self.engines.len()).filter(|to| *to != from) {
							self.queue.push_back((to, from as SessionId, message.clone()));
						}
					},
					Effect::Send { session, message } => {
						if (session as usize) < self.engines.len() {
							self.queue.push_back((session as usize, from as SessionId, message));
						}
					},
					Effect::Sign { .. } => unreachable!("signed by run"),
				}
			}
		}

		fn accept(&mut self, to: usize, id: u64, parent: u64, author: usize) {
			self.parents.insert(hash(id), hash(parent));
			let event = accepted(id, parent, &self.pairs[author], &self.validators);
			let effects = run(&mut self.engines[to], event);
			self.apply(to, effects);
		}

		fn produce(&mut self, id: u64, parent: u64, author: usize) {
			for to in 0..self.engines.len() {
				self.accept(to, id, parent, author);
			}
		}

		fn deliver_all(&mut self) {
			while !self.queue.is_empty() {
				self.seed = self
					.seed
					.wrapping_mul(6364136223846793005)
					.wrapping_add(1442695040888963407);
				let index = (self.seed >> 33) as usize % self.queue.len();
				let Some((to, session, message)) = self.queue.remove(index) else {
					break;
				};
				let effects = run(&mut self.engines[to], Event::Message { session, message });
				self.apply(to, effects);
			}
		}

		fn tick(&mut self) {
			for from in 0..self.engines.len() {
				let effects = run(&mut self.engines[from], Event::RoundTick);
				self.apply(from, effects);
			}
			self.deliver_all();
		}

		fn is_ancestor(&self, ancestor: &Hash, block: &Hash) -> bool {
			let mut current = *block;
			loop {
				if current == *ancestor {
					return true;
				}
				match self.parents.get(&current) {
					Some(parent) => current = *parent,
					None => return false,
				}
			}
		}

		fn assert_single_chain(&self) {
			let all: Vec<_> = self.finalized.iter().flatten().collect();
			for a in &all {
				for b in &all {
					assert!(
						self.is_ancestor(a, b) || self.is_ancestor(b, a),
						"Conflicting finalized blocks {a:?} and {b:?}"
					);
				}
			}
			for finalized in &self.finalized {
				for pair in finalized.windows(2) {
					assert!(self.is_ancestor(&pair[0], &pair[1]));
				}
			}
		}
	}

	#[test]
	fn honest_validators_finalize_one_chain() {
		for seed in 0..8 {
			let mut network = Network::new(4, 4, seed);
			network.produce(1, 0, 0);
			network.deliver_all();
			network.produce(2, 1, 1);
			network.produce(3, 2, 2);
			network.deliver_all();
			network.produce(4, 3, 3);
			network.deliver_all();
			for _ in 0..6 {
				network.tick();
			}

			network.assert_single_chain();
			for engine in &network.engines {
				assert_eq!(engine.root(), hash(4), "seed {seed}");
			}
		}
	}

	#[test]
	fn equivocating_validator_cannot_split_finality() {
		let mut network = Network::new(4, 3, 42);
		let byzantine = network.pairs[3].clone();

		// First two validators see fork 1 first, the third sees fork 2 first
		for (to, order) in [(0, [1, 2]), (1, [1, 2]), (2, [2, 1])] {
			for id in order {
				network.accept(to, id, 0, id as usize - 1);
			}
		}

		for stage in [Stage::Prevote, Stage::Precommit] {
			for (to, block) in [(0, 1), (1, 1), (2, 2)] {
				let message = vote(&byzantine, stage, 1, hash(block));
				network.queue.push_back((to, 3, message));
			}
			network.deliver_all();
		}
		for _ in 0..3 {
			network.tick();
		}

		network.assert_single_chain();
		// The third validator never sees a precommit quorum and catches up from a proof instead
		assert_eq!(network.engines[2].last_finalized_round(), 1);
		for finalized in &network.finalized {
			assert_eq!(finalized, &vec![hash(1)]);
		}
	}
}
