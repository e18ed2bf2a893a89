//! Justifications kept for lagging peers.
//!
//! Each retained justification remembers the blocks it finalized, so the responder knows the
//! recent finalized chain. A justification for block `B` also proves finality of every ancestor
//! of `B`: requests for a block on that chain are answered with the justification that finalized
//! it. Anything else (blocks ahead of finality, blocks of pruned forks, unknown ids) is refused.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::trace;

use crate::{finality::Justification, messages::FinalityNotice, types::Hash};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatchUpError {
	#[error("Block {0:?} is not on the retained finalized chain")]
	Unknown(Hash),
	#[error("No justification retained yet")]
	NoProof,
}

#[derive(Debug)]
struct Retained {
	justification: Justification,
	/// Blocks this justification finalized, its own block included
	finalized: Vec<Hash>,
}

#[derive(Debug)]
pub struct CatchUpResponder {
	proofs: VecDeque<Retained>,
	/// Finalized block to the block of the justification covering it
	covered: HashMap<Hash, Hash>,
	capacity: usize,
}

impl CatchUpResponder {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		CatchUpResponder {
			proofs: VecDeque::with_capacity(capacity),
			covered: HashMap::new(),
			capacity,
		}
	}

	pub fn len(&self) -> usize {
		self.proofs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.proofs.is_empty()
	}

	/// Keeps the justification as the newest one, together with the blocks it finalized, and
	/// drops the oldest past capacity.
	pub fn retain(&mut self, justification: Justification, mut finalized: Vec<Hash>) {
		if self
			.latest()
			.is_some_and(|latest| latest.block == justification.block)
		{
			trace!(block = ?justification.block, "Justification already retained");
			return;
		}

		let block = justification.block;
		if !finalized.contains(&block) {
			finalized.push(block);
		}
		for id in &finalized {
			self.covered.entry(*id).or_insert(block);
		}
		self.proofs.push_back(Retained {
			justification,
			finalized,
		});

		while self.proofs.len() > self.capacity {
			let Some(dropped) = self.proofs.pop_front() else {
				break;
			};
			let dropped_block = dropped.justification.block;
			for id in dropped.finalized {
				if self.covered.get(&id) == Some(&dropped_block) {
					self.covered.remove(&id);
				}
			}
			trace!(block = ?dropped_block, round = dropped.justification.round, "Justification dropped");
		}
	}

	pub fn latest(&self) -> Option<&Justification> {
		self.proofs.back().map(|retained| &retained.justification)
	}

	/// Notice announcing the latest finalized block
	pub fn notice(&self) -> Option<FinalityNotice> {
		self.latest().map(|latest| FinalityNotice {
			block: latest.block,
			round: latest.round,
		})
	}

	/// Picks the justification answering a `finality_req_proof` for `block`.
	pub fn on_request(&self, block: &Hash) -> Result<&Justification, CatchUpError> {
		if self.is_empty() {
			return Err(CatchUpError::NoProof);
		}

		let proof_block = self.covered.get(block).ok_or(CatchUpError::Unknown(*block))?;
		self.proofs
			.iter()
			.rev()
			.map(|retained| &retained.justification)
			.find(|justification| justification.block == *proof_block)
			.ok_or(CatchUpError::Unknown(*block))
	}
}
