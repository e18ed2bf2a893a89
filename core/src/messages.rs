//! Wire messages exchanged between finality gadget peers.
//!
//! Every message travels as a `(type id, payload)` frame. Type ids live above
//! [`NET_MESSAGE_TYPES_BASE`] so the gadget can share a multiplexed channel with other protocols.
//! Payloads are SCALE encoded.

use codec::{Decode, DecodeAll, Encode};
use strum::{EnumDiscriminants, IntoEnumIterator};
use thiserror::Error;

use crate::{
	finality::{verify_vote, Justification},
	types::{Hash, PublicKey, Signature, Stage},
};

/// First transport type id used by the gadget
pub const NET_MESSAGE_TYPES_BASE: u32 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct VoteMessage {
	pub round: u64,
	pub block: Hash,
	pub signer: PublicKey,
	pub signature: Signature,
}

impl VoteMessage {
	pub fn verify(&self, stage: Stage) -> bool {
		verify_vote(stage, self.round, &self.block, &self.signer, &self.signature)
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Handshake {
	pub root: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct FinalityNotice {
	pub block: Hash,
	pub round: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct FinalityReqProof {
	pub block: Hash,
}

/// Closed set of gadget messages. Variant order defines the wire tag.
#[derive(Clone, Debug, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(MessageKind))]
#[strum_discriminants(derive(strum::Display, strum::EnumIter, strum::AsRefStr, Hash))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
pub enum Message {
	Prevote(VoteMessage),
	Precommit(VoteMessage),
	Proof(Justification),
	Handshake(Handshake),
	HandshakeAns(Handshake),
	FinalityNotice(FinalityNotice),
	FinalityReqProof(FinalityReqProof),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
	#[error("Unknown message type {0}")]
	UnknownType(u32),
	#[error("Malformed {kind} payload: {reason}")]
	Malformed { kind: MessageKind, reason: String },
}

impl MessageKind {
	pub fn type_id(self) -> u32 {
		NET_MESSAGE_TYPES_BASE + self as u32
	}

	pub fn from_type_id(type_id: u32) -> Option<Self> {
		let tag = type_id.checked_sub(NET_MESSAGE_TYPES_BASE)?;
		MessageKind::iter().nth(tag as usize)
	}
}

impl Message {
	pub fn kind(&self) -> MessageKind {
		self.into()
	}

	pub fn encode_frame(&self) -> (u32, Vec<u8>) {
		let payload = match self {
			Message::Prevote(vote) | Message::Precommit(vote) => vote.encode(),
			Message::Proof(justification) => justification.encode(),
			Message::Handshake(handshake) | Message::HandshakeAns(handshake) => handshake.encode(),
			Message::FinalityNotice(notice) => notice.encode(),
			Message::FinalityReqProof(request) => request.encode(),
		};
		(self.kind().type_id(), payload)
	}

	/// Decodes a frame. The payload must be consumed entirely.
	pub fn decode_frame(type_id: u32, payload: &[u8]) -> Result<Self, CodecError> {
		let kind = MessageKind::from_type_id(type_id).ok_or(CodecError::UnknownType(type_id))?;

		fn decode<T: DecodeAll>(kind: MessageKind, mut payload: &[u8]) -> Result<T, CodecError> {
			T::decode_all(&mut payload).map_err(|error| CodecError::Malformed {
				kind,
				reason: error.to_string(),
			})
		}

		Ok(match kind {
			MessageKind::Prevote => Message::Prevote(decode(kind, payload)?),
			MessageKind::Precommit => Message::Precommit(decode(kind, payload)?),
			MessageKind::Proof => Message::Proof(decode(kind, payload)?),
			MessageKind::Handshake => Message::Handshake(decode(kind, payload)?),
			MessageKind::HandshakeAns => Message::HandshakeAns(decode(kind, payload)?),
			MessageKind::FinalityNotice => Message::FinalityNotice(decode(kind, payload)?),
			MessageKind::FinalityReqProof => Message::FinalityReqProof(decode(kind, payload)?),
		})
	}
}
