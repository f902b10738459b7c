//! Wire envelope and payload codec.
//!
//! Every consensus message travels as an [`Envelope`]: a kind tag, the encoded
//! payload, the sender, an ed25519 signature over the envelope with the
//! signature field left out, and (for precommits) a committed seal. Payloads
//! use a signed round and a zero hash for nil so that other implementations
//! of the same format interoperate.
//!
//! Decoding happens in two stages. [`Codec::decode`] parses framing and the
//! inner payload without looking at signatures, which is enough to sort a
//! message into the current height or the future-height backlog.
//! [`Codec::authenticate`] then checks signature, membership and seal against
//! the committee of that height.

use {
    crate::{
        committee::Committee,
        config::BftConfig,
        error::MessageError,
        types::{CommittedSeal, ProposedBlock},
    },
    bincode::Options,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::fmt,
};

// ── Kinds and payloads ──────────────────────────────────────────────────────

/// Envelope tag. Encoded as a `u32`: Proposal = 0, Prevote = 1, Precommit = 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Proposal,
    Prevote,
    Precommit,
}

impl MessageKind {
    fn wire_tag(self) -> u32 {
        match self {
            MessageKind::Proposal => 0,
            MessageKind::Prevote => 1,
            MessageKind::Precommit => 2,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Proposal => write!(f, "proposal"),
            MessageKind::Prevote => write!(f, "prevote"),
            MessageKind::Precommit => write!(f, "precommit"),
        }
    }
}

/// A prevote or precommit. `block_hash == None` is a nil vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub height: u64,
    pub round: u32,
    pub block_hash: Option<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    /// Round in which the proposer saw a prevote quorum for `block`, if any.
    /// Always below `round`.
    pub valid_round: Option<u32>,
    pub block: ProposedBlock,
}

#[derive(Serialize, Deserialize)]
struct VoteWire {
    round: i64,
    height: u64,
    block_hash: Hash,
}

#[derive(Serialize, Deserialize)]
struct ProposalWire {
    round: i64,
    height: u64,
    valid_round: i64,
    block: ProposedBlock,
}

/// Decoded payload of an envelope, computed once and reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusPayload {
    Proposal(Proposal),
    Prevote(Vote),
    Precommit(Vote),
}

impl ConsensusPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConsensusPayload::Proposal(_) => MessageKind::Proposal,
            ConsensusPayload::Prevote(_) => MessageKind::Prevote,
            ConsensusPayload::Precommit(_) => MessageKind::Precommit,
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            ConsensusPayload::Proposal(proposal) => proposal.height,
            ConsensusPayload::Prevote(vote) | ConsensusPayload::Precommit(vote) => vote.height,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            ConsensusPayload::Proposal(proposal) => proposal.round,
            ConsensusPayload::Prevote(vote) | ConsensusPayload::Precommit(vote) => vote.round,
        }
    }

    pub fn vote(&self) -> Option<&Vote> {
        match self {
            ConsensusPayload::Proposal(_) => None,
            ConsensusPayload::Prevote(vote) | ConsensusPayload::Precommit(vote) => Some(vote),
        }
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        match self {
            ConsensusPayload::Proposal(proposal) => Some(proposal),
            _ => None,
        }
    }

    /// Encode the payload in its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let bytes = match self {
            ConsensusPayload::Proposal(proposal) => wire_options().serialize(&ProposalWire {
                round: i64::from(proposal.round),
                height: proposal.height,
                valid_round: proposal.valid_round.map_or(-1, i64::from),
                block: proposal.block.clone(),
            })?,
            ConsensusPayload::Prevote(vote) | ConsensusPayload::Precommit(vote) => {
                wire_options().serialize(&VoteWire {
                    round: i64::from(vote.round),
                    height: vote.height,
                    block_hash: vote.block_hash.unwrap_or_default(),
                })?
            }
        };
        Ok(bytes)
    }
}

/// Bytes a precommitter signs to produce its committed seal:
/// the fixint encoding of `(Precommit tag, round as i64, height, hash)`.
pub fn committed_seal_payload(height: u64, round: u32, block_hash: &Hash) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + 8 + 8 + 32);
    payload.extend_from_slice(&MessageKind::Precommit.wire_tag().to_le_bytes());
    payload.extend_from_slice(&i64::from(round).to_le_bytes());
    payload.extend_from_slice(&height.to_le_bytes());
    payload.extend_from_slice(block_hash.as_ref());
    payload
}

// ── Envelope ────────────────────────────────────────────────────────────────

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub sender: Pubkey,
    pub signature: Signature,
    pub committed_seal: Option<Signature>,
}

#[derive(Serialize)]
struct UnsignedEnvelope<'a> {
    kind: MessageKind,
    payload: &'a [u8],
    sender: &'a Pubkey,
    committed_seal: &'a Option<Signature>,
}

impl Envelope {
    /// Build an envelope for `payload` and sign it with `sign`.
    pub fn new_signed<F, E>(
        payload: &ConsensusPayload,
        sender: Pubkey,
        committed_seal: Option<Signature>,
        sign: F,
    ) -> Result<Self, E>
    where
        F: FnOnce(&[u8]) -> Result<Signature, E>,
        E: From<MessageError>,
    {
        let mut envelope = Self {
            kind: payload.kind(),
            payload: payload.encode()?,
            sender,
            signature: Signature::default(),
            committed_seal,
        };
        envelope.signature = sign(&envelope.unsigned_bytes()?)?;
        Ok(envelope)
    }

    /// Canonical encoding with the signature field omitted; this is what the
    /// sender signs.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(wire_options().serialize(&UnsignedEnvelope {
            kind: self.kind,
            payload: &self.payload,
            sender: &self.sender,
            committed_seal: &self.committed_seal,
        })?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(wire_options().serialize(self)?)
    }
}

/// An envelope whose signature, membership and seal have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedEnvelope {
    envelope: Envelope,
    payload: ConsensusPayload,
    power: u64,
}

impl AuthenticatedEnvelope {
    /// Wrap an envelope this node signed itself.
    pub(crate) fn local(envelope: Envelope, payload: ConsensusPayload, power: u64) -> Self {
        Self {
            envelope,
            payload,
            power,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &ConsensusPayload {
        &self.payload
    }

    pub fn sender(&self) -> &Pubkey {
        &self.envelope.sender
    }

    pub fn power(&self) -> u64 {
        self.power
    }

    pub fn kind(&self) -> MessageKind {
        self.envelope.kind
    }

    pub fn height(&self) -> u64 {
        self.payload.height()
    }

    pub fn round(&self) -> u32 {
        self.payload.round()
    }

    /// The committed seal of a non-nil precommit.
    pub fn committed_seal(&self) -> Option<CommittedSeal> {
        self.envelope
            .committed_seal
            .map(|signature| CommittedSeal {
                signer: self.envelope.sender,
                signature,
            })
    }
}

// ── Codec ───────────────────────────────────────────────────────────────────

/// Decoder bound to the configured size and round limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    max_message_size: usize,
    max_round: u32,
}

impl Codec {
    pub fn new(config: &BftConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            max_round: config.max_round,
        }
    }

    /// Parse envelope framing and its payload. No signature checks.
    pub fn decode(&self, bytes: &[u8]) -> Result<(Envelope, ConsensusPayload), MessageError> {
        if bytes.len() > self.max_message_size {
            return Err(MessageError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        let envelope: Envelope = wire_options()
            .with_limit(self.max_message_size as u64)
            .deserialize(bytes)?;
        let payload = self.decode_payload(&envelope)?;
        Ok((envelope, payload))
    }

    pub fn decode_payload(&self, envelope: &Envelope) -> Result<ConsensusPayload, MessageError> {
        let options = wire_options().with_limit(self.max_message_size as u64);
        match envelope.kind {
            MessageKind::Proposal => {
                let wire: ProposalWire = options.deserialize(&envelope.payload)?;
                let round = self.check_round(wire.round)?;
                let valid_round = match wire.valid_round {
                    -1 => None,
                    valid_round => {
                        let checked = self.check_round(valid_round)?;
                        if checked >= round {
                            return Err(MessageError::InvalidValidRound { valid_round, round });
                        }
                        Some(checked)
                    }
                };
                Ok(ConsensusPayload::Proposal(Proposal {
                    height: wire.height,
                    round,
                    valid_round,
                    block: wire.block,
                }))
            }
            MessageKind::Prevote | MessageKind::Precommit => {
                let wire: VoteWire = options.deserialize(&envelope.payload)?;
                let vote = Vote {
                    height: wire.height,
                    round: self.check_round(wire.round)?,
                    block_hash: (wire.block_hash != Hash::default()).then_some(wire.block_hash),
                };
                Ok(match envelope.kind {
                    MessageKind::Prevote => ConsensusPayload::Prevote(vote),
                    _ => ConsensusPayload::Precommit(vote),
                })
            }
        }
    }

    /// Decode and authenticate in one step.
    pub fn open(
        &self,
        bytes: &[u8],
        committee: &Committee,
    ) -> Result<AuthenticatedEnvelope, MessageError> {
        let (envelope, payload) = self.decode(bytes)?;
        self.authenticate(envelope, payload, committee)
    }

    /// Check the signature against the claimed sender, the sender's
    /// membership, and the committed seal rules.
    pub fn authenticate(
        &self,
        envelope: Envelope,
        payload: ConsensusPayload,
        committee: &Committee,
    ) -> Result<AuthenticatedEnvelope, MessageError> {
        let unsigned = envelope.unsigned_bytes()?;
        if !envelope
            .signature
            .verify(envelope.sender.as_ref(), &unsigned)
        {
            return Err(MessageError::SignatureMismatch(envelope.sender));
        }

        let power = committee
            .member(&envelope.sender)
            .map_err(|_| MessageError::UnauthorizedSender(envelope.sender))?
            .voting_power;

        match &payload {
            ConsensusPayload::Precommit(Vote {
                height,
                round,
                block_hash: Some(block_hash),
            }) => {
                let seal = envelope
                    .committed_seal
                    .ok_or(MessageError::MissingCommittedSeal(envelope.sender))?;
                let seal_payload = committed_seal_payload(*height, *round, block_hash);
                if !seal.verify(envelope.sender.as_ref(), &seal_payload) {
                    return Err(MessageError::InvalidCommittedSeal(envelope.sender));
                }
            }
            ConsensusPayload::Precommit(_) => {}
            _ => {
                if envelope.committed_seal.is_some() {
                    return Err(MessageError::UnexpectedCommittedSeal {
                        kind: envelope.kind,
                        sender: envelope.sender,
                    });
                }
            }
        }

        Ok(AuthenticatedEnvelope {
            envelope,
            payload,
            power,
        })
    }

    fn check_round(&self, round: i64) -> Result<u32, MessageError> {
        u32::try_from(round)
            .ok()
            .filter(|checked| *checked <= self.max_round)
            .ok_or(MessageError::RoundOutOfRange {
                round,
                max: self.max_round,
            })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(&BftConfig::default())
    }
}
