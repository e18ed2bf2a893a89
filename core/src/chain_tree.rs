//! Tree of candidate blocks, anchored at the last block the gadget considers final.
//!
//! The root of the tree is the last finalized block. Every other node descends from it. Nodes live
//! in an index keyed by block id and refer to their parent and children by id, so dropping a
//! branch is just removing entries from the index.
//!
//! Each node remembers which distinct block signing keys have built on it (the node itself or any
//! of its descendants). The size of that set is the node's confirmation weight and drives the
//! chain level fork choice.

use std::{
	collections::{BTreeSet, HashMap, HashSet},
	iter,
	sync::Arc,
};
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{BlockRef, ChainSegment, Hash, PublicKey, ValidatorSet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
	#[error("Segment base {0:?} is not in the tree")]
	UnknownBase(Hash),
	#[error("Signer {0:?} is not in the active validator set")]
	InvalidSigner(PublicKey),
	#[error("Block {0:?} is not a descendant of the tree root")]
	NotAncestor(Hash),
	#[error("Block {block:?} is already known with a parent other than {expected:?}")]
	ParentMismatch { block: Hash, expected: Hash },
}

#[derive(Debug)]
struct TreeNode {
	parent: Option<Hash>,
	/// Ordered by insertion
	children: Vec<Hash>,
	signers: BTreeSet<PublicKey>,
	/// Validator set active when the block was accepted
	validators: Arc<ValidatorSet>,
}

impl TreeNode {
	fn new(parent: Option<Hash>, validators: Arc<ValidatorSet>) -> Self {
		TreeNode {
			parent,
			children: vec![],
			signers: BTreeSet::new(),
			validators,
		}
	}
}

/// Block of the host's chain above its last irreversible block, with the signer and validator
/// set the host reports for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotBlock {
	pub block: BlockRef,
	pub signer: PublicKey,
	pub validators: ValidatorSet,
}

#[derive(Debug)]
pub struct ChainTree {
	root: Hash,
	nodes: HashMap<Hash, TreeNode>,
}

impl ChainTree {
	/// Creates a tree containing only the given root.
	pub fn new(root: Hash, validators: ValidatorSet) -> Self {
		let mut nodes = HashMap::new();
		nodes.insert(root, TreeNode::new(None, Arc::new(validators)));
		ChainTree { root, nodes }
	}

	/// Rebuilds the tree the host chain had at startup: `root` is its last irreversible block and
	/// `blocks` its chain above it, parents before children.
	pub fn from_snapshot(
		root: Hash,
		validators: ValidatorSet,
		blocks: impl IntoIterator<Item = SnapshotBlock>,
	) -> Result<Self, TreeError> {
		let mut tree = ChainTree::new(root, validators);
		for SnapshotBlock {
			block,
			signer,
			validators,
		} in blocks
		{
			if block.id == root {
				continue;
			}
			tree.insert(
				&ChainSegment::single(block.parent_id, block.id),
				signer,
				validators,
			)?;
		}
		debug!(root = ?root, blocks = tree.len() - 1, "Chain tree restored from snapshot");
		Ok(tree)
	}

	pub fn root(&self) -> Hash {
		self.root
	}

	/// Number of nodes, root included.
	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn contains(&self, id: &Hash) -> bool {
		self.nodes.contains_key(id)
	}

	/// Confirmation weight of the node, if known.
	pub fn weight(&self, id: &Hash) -> Option<usize> {
		self.nodes.get(id).map(|node| node.signers.len())
	}

	/// Validator set recorded when the block was inserted.
	pub fn validators(&self, id: &Hash) -> Option<&ValidatorSet> {
		self.nodes.get(id).map(|node| node.validators.as_ref())
	}

	pub fn parent(&self, id: &Hash) -> Option<Hash> {
		self.nodes.get(id).and_then(|node| node.parent)
	}

	pub fn children(&self, id: &Hash) -> &[Hash] {
		self.nodes
			.get(id)
			.map(|node| node.children.as_slice())
			.unwrap_or_default()
	}

	/// Inserts the segment on top of its base and records `signer` on the new head and every
	/// ancestor of it up to the root.
	///
	/// Fails without modifying the tree when the signer is not part of `validators`, when the base
	/// is unknown, or when one of the blocks is already known under another parent.
	pub fn insert(
		&mut self,
		segment: &ChainSegment,
		signer: PublicKey,
		validators: ValidatorSet,
	) -> Result<(), TreeError> {
		if !validators.contains(&signer) {
			return Err(TreeError::InvalidSigner(signer));
		}
		if !self.contains(&segment.base) {
			return Err(TreeError::UnknownBase(segment.base));
		}

		let mut seen = HashSet::new();
		let mut parent = segment.base;
		for &id in &segment.blocks {
			let linked_elsewhere = self
				.nodes
				.get(&id)
				.is_some_and(|node| node.parent != Some(parent));
			if linked_elsewhere || !seen.insert(id) {
				return Err(TreeError::ParentMismatch {
					block: id,
					expected: parent,
				});
			}
			parent = id;
		}

		let validators = Arc::new(validators);
		let mut parent = segment.base;
		for &id in &segment.blocks {
			if !self.nodes.contains_key(&id) {
				self.nodes
					.insert(id, TreeNode::new(Some(parent), validators.clone()));
				if let Some(parent_node) = self.nodes.get_mut(&parent) {
					parent_node.children.push(id);
				}
				trace!(block = ?id, parent = ?parent, "Block added to chain tree");
			}
			parent = id;
		}

		let root = self.root;
		let mut current = Some(segment.head());
		while let Some(id) = current.filter(|id| *id != root) {
			let Some(node) = self.nodes.get_mut(&id) else {
				break;
			};
			node.signers.insert(signer);
			current = node.parent;
		}

		Ok(())
	}

	/// Follows the heaviest child from `of` down to a leaf. Ties are broken by the smallest id.
	///
	/// Returns `of` itself when it has no children, and `None` when it is not in the tree.
	pub fn best_descendant(&self, of: &Hash) -> Option<Hash> {
		let mut best = *of;
		let mut node = self.nodes.get(of)?;

		while let Some((id, child)) = node
			.children
			.iter()
			.filter_map(|id| self.nodes.get(id).map(|child| (id, child)))
			.max_by(|(a_id, a), (b_id, b)| {
				a.signers
					.len()
					.cmp(&b.signers.len())
					.then_with(|| b_id.cmp(a_id))
			}) {
			best = *id;
			node = child;
		}

		Some(best)
	}

	/// Makes `new_root` the root of the tree, discarding everything outside of its subtree.
	pub fn prune(&mut self, new_root: &Hash) -> Result<(), TreeError> {
		if !self.contains(new_root) {
			return Err(TreeError::NotAncestor(*new_root));
		}

		let keep = self.subtree(new_root);
		let before = self.nodes.len();
		self.nodes.retain(|id, _| keep.contains(id));
		if let Some(node) = self.nodes.get_mut(new_root) {
			node.parent = None;
		}
		self.root = *new_root;

		debug!(
			root = ?new_root,
			pruned = before - self.nodes.len(),
			remaining = self.nodes.len(),
			"Chain tree pruned"
		);
		Ok(())
	}

	/// Drops the whole tree and starts over from `root`.
	pub fn reset(&mut self, root: Hash, validators: ValidatorSet) {
		debug!(root = ?root, dropped = self.nodes.len(), "Chain tree reset");
		*self = ChainTree::new(root, validators);
	}

	/// Returns true if `ancestor` is on the path from `descendant` to the root. A block is its own
	/// ancestor.
	pub fn ancestor_of(&self, ancestor: &Hash, descendant: &Hash) -> bool {
		self.path_to_root(descendant).any(|id| id == *ancestor)
	}

	/// Enumerates `id`, its parent and so on up to the root. Empty when `id` is not in the tree.
	pub fn path_to_root<'a>(&'a self, id: &Hash) -> impl Iterator<Item = Hash> + 'a {
		let start = self.contains(id).then_some(*id);
		iter::successors(start, move |id| self.parent(id))
	}

	/// Links from `descendant` back to `ancestor` (exclusive), or `None` if `ancestor` is not on
	/// the path to the root.
	pub fn route(&self, descendant: &Hash, ancestor: &Hash) -> Option<Vec<BlockRef>> {
		let mut links = vec![];
		let mut current = *descendant;
		while current != *ancestor {
			let parent_id = self.parent(&current)?;
			links.push(BlockRef {
				id: current,
				parent_id,
			});
			current = parent_id;
		}
		Some(links)
	}

	fn subtree(&self, id: &Hash) -> HashSet<Hash> {
		let mut subtree = HashSet::new();
		let mut stack = vec![*id];
		while let Some(id) = stack.pop() {
			if subtree.insert(id) {
				stack.extend_from_slice(self.children(&id));
			}
		}
		subtree
	}
}
