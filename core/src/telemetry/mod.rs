use std::{
	collections::{BTreeMap, HashMap},
	sync::Mutex,
};

use color_eyre::{eyre::eyre, Result};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::messages::MessageKind;

const PROJECT_NAME: &str = "randpa";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricCounter {
	MessagesIn(MessageKind),
	MessagesOut(MessageKind),
	MalformedMessages,
	Finalizations,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
	QueueSize(usize),
	HeadBlockNumber(u32),
	LibBlockNumber(u32),
	CurrentRound(u64),
	LastFinalizedRound(u64),
}

pub trait MetricName {
	fn name(&self) -> String;
}

impl MetricName for MetricCounter {
	fn name(&self) -> String {
		use MetricCounter::*;
		match self {
			MessagesIn(kind) => format!("{PROJECT_NAME}.messages_in.{kind}"),
			MessagesOut(kind) => format!("{PROJECT_NAME}.messages_out.{kind}"),
			MalformedMessages => format!("{PROJECT_NAME}.malformed_messages"),
			Finalizations => format!("{PROJECT_NAME}.finalizations"),
		}
	}
}

impl MetricName for MetricValue {
	fn name(&self) -> String {
		use MetricValue::*;
		match self {
			QueueSize(_) => format!("{PROJECT_NAME}.queue_size"),
			HeadBlockNumber(_) => format!("{PROJECT_NAME}.head_block_num"),
			LibBlockNumber(_) => format!("{PROJECT_NAME}.lib_block_num"),
			CurrentRound(_) => format!("{PROJECT_NAME}.current_round"),
			LastFinalizedRound(_) => format!("{PROJECT_NAME}.last_finalized_round"),
		}
	}
}

impl MetricValue {
	fn value(&self) -> u64 {
		use MetricValue::*;
		match *self {
			QueueSize(size) => size as u64,
			HeadBlockNumber(number) | LibBlockNumber(number) => number as u64,
			CurrentRound(round) | LastFinalizedRound(round) => round,
		}
	}
}

#[cfg_attr(test, automock)]
pub trait Metrics: Send + Sync {
	fn count(&self, counter: MetricCounter);
	fn record(&self, value: MetricValue);
	fn flush(&self) -> Result<()>;
}

/// Keeps counters and gauges in memory and logs them on flush.
#[derive(Default)]
pub struct InProcessMetrics {
	counters: Mutex<HashMap<MetricCounter, u64>>,
	gauges: Mutex<BTreeMap<String, u64>>,
}

impl InProcessMetrics {
	pub fn counter(&self, counter: MetricCounter) -> u64 {
		self.counters
			.lock()
			.map(|counters| counters.get(&counter).copied().unwrap_or_default())
			.unwrap_or_default()
	}

	pub fn gauge(&self, value: MetricValue) -> Option<u64> {
		self.gauges
			.lock()
			.ok()
			.and_then(|gauges| gauges.get(&value.name()).copied())
	}
}

impl Metrics for InProcessMetrics {
	fn count(&self, counter: MetricCounter) {
		if let Ok(mut counters) = self.counters.lock() {
			*counters.entry(counter).or_default() += 1;
		}
	}

	fn record(&self, value: MetricValue) {
		if let Ok(mut gauges) = self.gauges.lock() {
			gauges.insert(value.name(), value.value());
		}
	}

	fn flush(&self) -> Result<()> {
		let counters = self
			.counters
			.lock()
			.map_err(|_| eyre!("Metric counters lock poisoned"))?
			.iter()
			.map(|(counter, count)| (counter.name(), *count))
			.collect::<BTreeMap<_, _>>();
		let gauges = self
			.gauges
			.lock()
			.map_err(|_| eyre!("Metric gauges lock poisoned"))?
			.clone();

		info!(?counters, ?gauges, "Metrics");
		Ok(())
	}
}
