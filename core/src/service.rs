//! Runtime driver around the synchronous [`RoundEngine`].
//!
//! Host chain events, inbound frames and round ticks are funneled onto one ordered queue. A single
//! blocking loop feeds them to the engine, and the returned effects are posted to the tokio
//! runtime as fire and forget tasks, so slow peers or a slow host never hold up the next event.
//! Votes are signed the same way: the provider runs on the blocking pool and the signature is
//! queued back as [`Event::VoteSigned`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
#[cfg(test)]
use mockall::automock;
use tokio::{
	sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
	time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
	engine::{Effect, Event, RoundEngine},
	finality::vote_digest,
	messages::Message,
	telemetry::{MetricCounter, MetricValue, Metrics},
	types::{Hash, SessionId},
	utils::spawn_in_span,
};

/// Peer to peer channel shared with other protocols
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, session: SessionId, type_id: u32, payload: Vec<u8>) -> Result<()>;

	/// Currently connected sessions
	fn sessions(&self) -> Vec<SessionId>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostChain: Send + Sync {
	/// Best effort, the host may not know the block yet.
	async fn finalize(&self, block: Hash) -> Result<()>;
}

enum Command {
	Handle(Event),
	Stop,
}

/// Cloneable entry point of the service queue.
#[derive(Clone)]
pub struct ServiceHandle {
	sender: UnboundedSender<Command>,
	metrics: Arc<dyn Metrics>,
}

impl ServiceHandle {
	pub fn post(&self, event: Event) -> Result<()> {
		self.sender
			.send(Command::Handle(event))
			.map_err(|_| eyre!("Finality service is not running"))
	}

	/// Decodes a transport frame and queues it. Malformed frames are dropped.
	pub fn post_frame(&self, session: SessionId, type_id: u32, payload: &[u8]) -> Result<()> {
		match Message::decode_frame(type_id, payload) {
			Ok(message) => self.post(Event::Message { session, message }),
			Err(error) => {
				warn!(session, type_id, "Dropping frame: {error}");
				self.metrics.count(MetricCounter::MalformedMessages);
				Ok(())
			},
		}
	}
}

pub struct Service<T: Transport, H: HostChain> {
	engine: RoundEngine,
	sender: UnboundedSender<Command>,
	receiver: UnboundedReceiver<Command>,
	transport: Arc<T>,
	host: Arc<H>,
	metrics: Arc<dyn Metrics>,
}

impl<T: Transport + 'static, H: HostChain + 'static> Service<T, H> {
	/// Must be called within a tokio runtime. The service stops once `shutdown` is cancelled.
	pub fn new(
		engine: RoundEngine,
		transport: Arc<T>,
		host: Arc<H>,
		metrics: Arc<dyn Metrics>,
		shutdown: CancellationToken,
	) -> (Self, ServiceHandle) {
		let (sender, receiver) = unbounded_channel();

		let stop = sender.clone();
		spawn_in_span(async move {
			shutdown.cancelled().await;
			let _ = stop.send(Command::Stop);
		});

		let handle = ServiceHandle {
			sender: sender.clone(),
			metrics: metrics.clone(),
		};
		let service = Service {
			engine,
			sender,
			receiver,
			transport,
			host,
			metrics,
		};
		(service, handle)
	}

	/// Processes queued events until shutdown. Blocks the current thread, use with
	/// `tokio::task::spawn_blocking`.
	pub fn run(mut self) {
		info!(root = ?self.engine.root(), round = self.engine.round(), "Finality service started");

		while let Some(Command::Handle(event)) = self.receiver.blocking_recv() {
			self.metrics
				.record(MetricValue::QueueSize(self.receiver.len()));
			match &event {
				Event::BlockAccepted { number, .. } => {
					self.metrics.record(MetricValue::HeadBlockNumber(*number))
				},
				Event::BlockIrreversible { number, .. } => {
					self.metrics.record(MetricValue::LibBlockNumber(*number))
				},
				Event::Message { message, .. } => {
					self.metrics.count(MetricCounter::MessagesIn(message.kind()))
				},
				Event::NewPeer { .. } | Event::RoundTick | Event::VoteSigned { .. } => {},
			}

			let effects = self.engine.handle(event);
			self.dispatch(effects);

			self.metrics
				.record(MetricValue::CurrentRound(self.engine.round()));
			self.metrics.record(MetricValue::LastFinalizedRound(
				self.engine.last_finalized_round(),
			));
		}

		info!(root = ?self.engine.root(), "Finality service stopped");
	}

	fn dispatch(&self, effects: Vec<Effect>) {
		for effect in effects {
			match effect {
				Effect::Send { session, message } => {
					self.metrics.count(MetricCounter::MessagesOut(message.kind()));
					self.send(vec![session], &message);
				},
				Effect::Broadcast(message) => {
					self.metrics.count(MetricCounter::MessagesOut(message.kind()));
					self.send(self.transport.sessions(), &message);
				},
				Effect::Sign {
					stage,
					round,
					block,
					signer,
				} => {
					let Some(provider) = self.engine.signer(&signer) else {
						warn!(%stage, round, signer = ?signer, "No signature provider for vote");
						continue;
					};
					let sender = self.sender.clone();
					spawn_in_span(async move {
						let digest = vote_digest(stage, round, &block);
						let signature =
							match tokio::task::spawn_blocking(move || provider.sign(&digest)).await {
								Ok(Ok(signature)) => Some(signature),
								Ok(Err(error)) => {
									warn!(%stage, round, "Failed to sign vote: {error:#}");
									None
								},
								Err(error) => {
									warn!(%stage, round, "Signing task failed: {error}");
									None
								},
							};
						// Service may be stopped already
						let _ = sender.send(Command::Handle(Event::VoteSigned {
							stage,
							round,
							block,
							signer,
							signature,
						}));
					});
				},
				Effect::Finalize(block) => {
					self.metrics.count(MetricCounter::Finalizations);
					let host = self.host.clone();
					spawn_in_span(async move {
						if let Err(error) = host.finalize(block).await {
							warn!(block = ?block, "Host chain did not finalize block: {error:#}");
						}
					});
				},
			}
		}
	}

	fn send(&self, sessions: Vec<SessionId>, message: &Message) {
		let kind = message.kind();
		let (type_id, payload) = message.encode_frame();
		trace!(%kind, sessions = sessions.len(), "Sending message");

		for session in sessions {
			let transport = self.transport.clone();
			let payload = payload.clone();
			spawn_in_span(async move {
				if let Err(error) = transport.send(session, type_id, payload).await {
					debug!(session, %kind, "Failed to send message: {error:#}");
				}
			});
		}
	}
}

/// Posts a round tick every `round_timeout`, starting one timeout from now.
pub async fn round_ticker(handle: ServiceHandle, round_timeout: Duration, shutdown: CancellationToken) {
	let mut interval = time::interval(round_timeout);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	interval.tick().await;

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			_ = interval.tick() => {
				if handle.post(Event::RoundTick).is_err() {
					break;
				}
			},
		}
	}
	trace!("Round ticker stopped");
}

/// Flushes metrics every `interval` until shutdown.
pub async fn metrics_flusher(metrics: Arc<dyn Metrics>, interval: Duration, shutdown: CancellationToken) {
	let mut interval = time::interval(interval);
	interval.tick().await;

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			_ = interval.tick() => {
				if let Err(error) = metrics.flush() {
					warn!("Unable to flush metrics: {error:#}");
				}
			},
		}
	}
}
