//! In-process devnet: a simulated host chain and an in-memory transport connecting one
//! configured node with N simulated validators, all running the real finality service.
//!
//! Node `0` is the configured node. Nodes `1..=N` are simulated validators with deterministic
//! keys. Session ids on the router are node indexes. The host chain may already hold some blocks
//! above genesis when the nodes start; every node then restores its chain tree from that snapshot.

use std::{
	collections::VecDeque,
	sync::{Arc, Mutex, OnceLock},
	time::Duration,
};

use async_trait::async_trait;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use randpa_core::{
	chain_tree::{ChainTree, SnapshotBlock},
	engine::{Event, RoundEngine},
	service::{metrics_flusher, round_ticker, HostChain, Service, ServiceHandle, Transport},
	signer::{LocalKeySigner, SignatureProvider},
	telemetry::{InProcessMetrics, Metrics},
	types::{BlockRef, Hash, PublicKey, RandpaConfig, SessionId, ValidatorSet},
	utils::{blake2_256, spawn_in_span},
};
use sp_core::{ed25519, Pair as _};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

const LOCAL_NODE: usize = 0;

#[derive(Clone, Debug)]
pub struct DevnetConfig {
	pub validators: usize,
	pub block_interval: Duration,
	pub block_limit: Option<u32>,
	/// Blocks on the host chain before the nodes start
	pub history: u32,
	pub metrics_flush_interval: Duration,
	/// Configuration of the local node, simulated validators always vote
	pub randpa: RandpaConfig,
}

/// Last finalized block of every node, local node first
#[derive(Debug)]
pub struct DevnetSummary {
	pub produced: u32,
	pub head: Hash,
	pub finalized: Vec<Option<Hash>>,
}

pub fn validator_pairs(count: usize) -> Vec<ed25519::Pair> {
	(0..count)
		.map(|i| ed25519::Pair::from_seed(&blake2_256(format!("devnet-validator-{i}").as_bytes())))
		.collect()
}

pub fn genesis() -> Hash {
	Hash::from(blake2_256(b"randpa-devnet-genesis"))
}

pub fn block_id(parent: &Hash, number: u32) -> Hash {
	let preimage = [parent.as_bytes(), &number.to_be_bytes()[..]].concat();
	Hash::from(blake2_256(&preimage))
}

fn author_of(authors: &[PublicKey], number: u32) -> PublicKey {
	authors[number as usize % authors.len()]
}

/// Host chain produced before the devnet starts, oldest block first.
fn history(count: u32, authors: &[PublicKey], validators: &ValidatorSet) -> Vec<SnapshotBlock> {
	let mut parent_id = genesis();
	(1..=count)
		.map(|number| {
			let id = block_id(&parent_id, number);
			let block = SnapshotBlock {
				block: BlockRef { id, parent_id },
				signer: author_of(authors, number),
				validators: validators.clone(),
			};
			parent_id = id;
			block
		})
		.collect()
}

struct Router {
	size: usize,
	handles: OnceLock<Vec<ServiceHandle>>,
}

impl Router {
	fn new(size: usize) -> Self {
		Router {
			size,
			handles: OnceLock::new(),
		}
	}

	fn connect(&self, handles: Vec<ServiceHandle>) -> Result<()> {
		self.handles
			.set(handles)
			.map_err(|_| eyre!("Router is already connected"))
	}

	fn deliver(&self, from: usize, to: SessionId, type_id: u32, payload: &[u8]) -> Result<()> {
		let handles = self.handles.get().ok_or_else(|| eyre!("Router is not connected"))?;
		let handle = handles
			.get(to as usize)
			.ok_or_else(|| eyre!("Unknown session {to}"))?;
		handle.post_frame(from as SessionId, type_id, payload)
	}
}

/// Transport endpoint of a single node
struct RouterTransport {
	router: Arc<Router>,
	node: usize,
}

#[async_trait]
impl Transport for RouterTransport {
	async fn send(&self, session: SessionId, type_id: u32, payload: Vec<u8>) -> Result<()> {
		self.router.deliver(self.node, session, type_id, &payload)
	}

	fn sessions(&self) -> Vec<SessionId> {
		(0..self.router.size)
			.filter(|node| *node != self.node)
			.map(|node| node as SessionId)
			.collect()
	}
}

/// Simulated host chain of a single node, remembers what it was asked to finalize.
struct DevnetHost {
	node: usize,
	finalized: Mutex<Vec<Hash>>,
}

impl DevnetHost {
	fn new(node: usize) -> Self {
		DevnetHost {
			node,
			finalized: Mutex::new(vec![]),
		}
	}

	fn last_finalized(&self) -> Option<Hash> {
		self.finalized
			.lock()
			.ok()
			.and_then(|finalized| finalized.last().copied())
	}
}

#[async_trait]
impl HostChain for DevnetHost {
	async fn finalize(&self, block: Hash) -> Result<()> {
		if self.node == LOCAL_NODE {
			info!(?block, "Block finalized");
		} else {
			debug!(node = self.node, ?block, "Block finalized");
		}
		self.finalized
			.lock()
			.map_err(|_| eyre!("Finalized blocks lock poisoned"))?
			.push(block);
		Ok(())
	}
}

struct BlockAuthor {
	handles: Vec<ServiceHandle>,
	authors: Vec<PublicKey>,
	validators: ValidatorSet,
	/// Blocks become irreversible on the host chain at this depth
	irreversible_depth: usize,
}

impl BlockAuthor {
	/// Produces blocks on top of `head` until the limit is reached or shutdown is triggered.
	/// Returns the number and id of the last block.
	async fn run(
		self,
		mut head: (u32, Hash),
		interval: Duration,
		limit: Option<u32>,
		shutdown: CancellationToken,
	) -> Result<(u32, Hash)> {
		let mut interval = time::interval(interval);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		interval.tick().await;

		let mut recent = VecDeque::from([head]);

		while !limit.is_some_and(|limit| head.0 >= limit) {
			tokio::select! {
				_ = shutdown.cancelled() => break,
				_ = interval.tick() => {},
			}

			let (parent_number, parent_id) = head;
			let number = parent_number + 1;
			let id = block_id(&parent_id, number);
			let signer = author_of(&self.authors, number);

			let mut events = vec![Event::BlockAccepted {
				id,
				parent_id,
				number,
				signer,
				validators: self.validators.clone(),
				is_syncing: false,
			}];
			debug!(number, block = ?id, "Block produced");

			head = (number, id);
			recent.push_back(head);
			if recent.len() > self.irreversible_depth {
				if let Some((number, id)) = recent.pop_front() {
					events.push(Event::BlockIrreversible { id, number });
				}
			}

			for event in events {
				if let Err(error) = self.broadcast(event) {
					// Services stop on shutdown before the author notices it
					if shutdown.is_cancelled() {
						return Ok(head);
					}
					return Err(error);
				}
			}
		}

		Ok(head)
	}

	fn broadcast(&self, event: Event) -> Result<()> {
		for handle in &self.handles {
			handle.post(event.clone())?;
		}
		Ok(())
	}
}

/// Runs the devnet until shutdown, or until the block limit is reached and the network had a
/// few rounds to settle.
pub async fn run(
	config: DevnetConfig,
	signers: Vec<Arc<dyn SignatureProvider>>,
	shutdown: CancellationToken,
) -> Result<DevnetSummary> {
	if config.validators == 0 {
		return Err(eyre!("Devnet needs at least one simulated validator"));
	}

	let pairs = validator_pairs(config.validators);
	let authors: Vec<PublicKey> = pairs.iter().map(|pair| pair.public()).collect();
	let validators: ValidatorSet = authors
		.iter()
		.copied()
		.chain(signers.iter().map(|signer| signer.public_key()))
		.collect();
	info!(
		validators = validators.len(),
		threshold = validators.threshold(),
		genesis = ?genesis(),
		"Starting devnet"
	);

	let snapshot = history(config.history, &authors, &validators);
	let start = snapshot
		.last()
		.map_or((0, genesis()), |last| (config.history, last.block.id));
	if !snapshot.is_empty() {
		info!(blocks = snapshot.len(), head = ?start.1, "Restoring nodes from host chain");
	}

	let round_timeout = config.randpa.round_timeout;
	let router = Arc::new(Router::new(config.validators + 1));
	let local_metrics = Arc::new(InProcessMetrics::default());

	let mut handles = Vec::with_capacity(config.validators + 1);
	let mut hosts = Vec::with_capacity(config.validators + 1);
	let mut services = Vec::with_capacity(config.validators + 1);

	for node in 0..=config.validators {
		let metrics: Arc<dyn Metrics> = if node == LOCAL_NODE {
			local_metrics.clone()
		} else {
			Arc::new(InProcessMetrics::default())
		};
		let (randpa, node_signers) = if node == LOCAL_NODE {
			(config.randpa.clone(), signers.clone())
		} else {
			let signer: Arc<dyn SignatureProvider> =
				Arc::new(LocalKeySigner::new(pairs[node - 1].clone()));
			let randpa = RandpaConfig {
				is_validator: true,
				..config.randpa.clone()
			};
			(randpa, vec![signer])
		};

		let tree = ChainTree::from_snapshot(genesis(), validators.clone(), snapshot.clone())
			.wrap_err("Invalid host chain snapshot")?;
		let engine = RoundEngine::with_tree(&randpa, tree, node_signers);
		let transport = Arc::new(RouterTransport {
			router: router.clone(),
			node,
		});
		let host = Arc::new(DevnetHost::new(node));
		let (service, handle) =
			Service::new(engine, transport, host.clone(), metrics, shutdown.clone());

		let span = info_span!("node", node);
		services.push(tokio::task::spawn_blocking(move || span.in_scope(|| service.run())));
		spawn_in_span(round_ticker(handle.clone(), round_timeout, shutdown.clone()));

		handles.push(handle);
		hosts.push(host);
	}

	router.connect(handles.clone())?;
	for (node, handle) in handles.iter().enumerate() {
		for peer in (0..handles.len()).filter(|peer| *peer != node) {
			let session = peer as SessionId;
			if let Err(error) = handle.post(Event::NewPeer { session }) {
				warn!(node, session, "Peer not announced: {error:#}");
			}
		}
	}

	spawn_in_span(metrics_flusher(
		local_metrics.clone(),
		config.metrics_flush_interval,
		shutdown.clone(),
	));

	let author = BlockAuthor {
		handles,
		authors,
		validators: validators.clone(),
		irreversible_depth: validators.threshold(),
	};
	let (produced, head) = author
		.run(start, config.block_interval, config.block_limit, shutdown.clone())
		.await
		.wrap_err("Block author failed")?;

	if !shutdown.is_cancelled() {
		info!(produced, "Block limit reached, waiting for the last rounds");
		tokio::select! {
			_ = shutdown.cancelled() => {},
			_ = time::sleep(round_timeout * 3) => shutdown.cancel(),
		}
	}

	for service in services {
		service.await.wrap_err("Finality service failed")?;
	}

	let finalized: Vec<_> = hosts.iter().map(|host| host.last_finalized()).collect();
	for (node, last_finalized) in finalized.iter().enumerate() {
		info!(node, ?last_finalized, "Devnet node finalized");
	}
	if let Err(error) = local_metrics.flush() {
		warn!("Unable to flush metrics: {error:#}");
	}

	Ok(DevnetSummary {
		produced,
		head,
		finalized,
	})
}
