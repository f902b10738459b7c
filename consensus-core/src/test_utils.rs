//! Helpers shared by unit tests and downstream test crates.
//!
//! Enabled with the `dev-context-only-utils` feature.

use {
    crate::{
        backend::ConsensusBackend,
        committee::Committee,
        engine::ConsensusEvent,
        error::{BackendError, MessageError},
        message::{committed_seal_payload, Codec, ConsensusPayload, Envelope, Proposal, Vote},
        types::{CommittedSeal, ProposedBlock},
    },
    crossbeam_channel::Sender,
    log::*,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    solana_signer::Signer,
    std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        time::Duration,
    },
};

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

pub fn make_keypairs(count: usize) -> Vec<Keypair> {
    (0..count).map(|_| Keypair::new()).collect()
}

/// Equal-power committee in the order of `keypairs`.
pub fn make_committee(keypairs: &[Keypair]) -> Committee {
    Committee::new(keypairs.iter().map(|keypair| (keypair.pubkey(), 1)).collect())
        .expect("valid committee")
}

/// A block at `height`; `tag` makes otherwise identical blocks distinct.
pub fn make_block(height: u64, proposer: Pubkey, tag: u8) -> ProposedBlock {
    ProposedBlock {
        parent_hash: Hash::new_from_array([height as u8; 32]),
        height,
        timestamp: 1_700_000_000_000 + height as i64,
        transactions: vec![vec![tag]],
        state_root: Hash::new_from_array([tag; 32]),
        proposer,
    }
}

fn sign_envelope(
    keypair: &Keypair,
    payload: ConsensusPayload,
    committed_seal: Option<Signature>,
) -> Vec<u8> {
    Envelope::new_signed::<_, MessageError>(&payload, keypair.pubkey(), committed_seal, |bytes| {
        Ok(keypair.sign_message(bytes))
    })
    .and_then(|envelope| envelope.encode())
    .expect("encodable envelope")
}

pub fn signed_proposal(
    keypair: &Keypair,
    height: u64,
    round: u32,
    valid_round: Option<u32>,
    block: ProposedBlock,
) -> Vec<u8> {
    sign_envelope(
        keypair,
        ConsensusPayload::Proposal(Proposal {
            height,
            round,
            valid_round,
            block,
        }),
        None,
    )
}

pub fn signed_prevote(
    keypair: &Keypair,
    height: u64,
    round: u32,
    block_hash: Option<Hash>,
) -> Vec<u8> {
    sign_envelope(
        keypair,
        ConsensusPayload::Prevote(Vote {
            height,
            round,
            block_hash,
        }),
        None,
    )
}

/// A precommit, sealed when it names a block.
pub fn signed_precommit(
    keypair: &Keypair,
    height: u64,
    round: u32,
    block_hash: Option<Hash>,
) -> Vec<u8> {
    let seal = block_hash
        .map(|hash| keypair.sign_message(&committed_seal_payload(height, round, &hash)));
    sign_envelope(
        keypair,
        ConsensusPayload::Precommit(Vote {
            height,
            round,
            block_hash,
        }),
        seal,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub block: ProposedBlock,
    pub round: u32,
    pub seals: Vec<CommittedSeal>,
}

#[derive(Debug, Default)]
struct Wiring {
    peers: Vec<Sender<ConsensusEvent>>,
    own: Option<Sender<ConsensusEvent>>,
}

/// In-memory backend: signs with a local keypair, records broadcasts and
/// commits, and optionally forwards them over channels to form a network.
#[derive(Debug)]
pub struct MemoryBackend {
    keypair: Keypair,
    committee: Committee,
    broadcasts: Mutex<Vec<Vec<u8>>>,
    commits: Mutex<Vec<CommitRecord>>,
    rejected: Mutex<HashSet<Hash>>,
    fail_signing: AtomicBool,
    fail_commit: AtomicBool,
    wiring: Mutex<Wiring>,
}

impl MemoryBackend {
    pub fn new(keypair: Keypair, committee: Committee) -> Self {
        Self {
            keypair,
            committee,
            broadcasts: Mutex::default(),
            commits: Mutex::default(),
            rejected: Mutex::default(),
            fail_signing: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            wiring: Mutex::default(),
        }
    }

    /// Forward broadcasts to `peers` and confirm commits on `own`.
    pub fn connect(&self, peers: Vec<Sender<ConsensusEvent>>, own: Sender<ConsensusEvent>) {
        let mut wiring = self.wiring.lock().unwrap();
        wiring.peers = peers;
        wiring.own = Some(own);
    }

    /// Every payload broadcast so far, decoded, oldest first.
    pub fn sent(&self) -> Vec<ConsensusPayload> {
        let codec = Codec::default();
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| codec.decode(bytes).expect("own broadcast decodes").1)
            .collect()
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.commits.lock().unwrap().clone()
    }

    pub fn reject_block(&self, hash: Hash) {
        self.rejected.lock().unwrap().insert(hash);
    }

    pub fn set_fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::Relaxed);
    }
}

impl ConsensusBackend for MemoryBackend {
    fn address(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    fn verify_proposal(&self, block: &ProposedBlock) -> Result<Duration, BackendError> {
        if self.rejected.lock().unwrap().contains(&block.hash()) {
            return Err(BackendError::InvalidProposal(format!(
                "block {} rejected",
                block.hash()
            )));
        }
        Ok(Duration::ZERO)
    }

    fn sign(&self, payload: &[u8]) -> Result<Signature, BackendError> {
        if self.fail_signing.load(Ordering::Relaxed) {
            return Err(BackendError::Unavailable("signer offline".to_string()));
        }
        Ok(self.keypair.try_sign_message(payload)?)
    }

    fn broadcast(&self, _committee: &Committee, payload: Vec<u8>) -> Result<(), BackendError> {
        for peer in &self.wiring.lock().unwrap().peers {
            if peer.send(ConsensusEvent::Message(payload.clone())).is_err() {
                trace!("peer channel closed");
            }
        }
        self.broadcasts.lock().unwrap().push(payload);
        Ok(())
    }

    fn commit(
        &self,
        block: &ProposedBlock,
        round: u32,
        seals: Vec<CommittedSeal>,
    ) -> Result<(), BackendError> {
        if self.fail_commit.load(Ordering::Relaxed) {
            return Err(BackendError::Commit("store unavailable".to_string()));
        }
        self.commits.lock().unwrap().push(CommitRecord {
            block: block.clone(),
            round,
            seals,
        });
        if let Some(own) = &self.wiring.lock().unwrap().own {
            let _ = own.send(ConsensusEvent::CommitConfirmed(block.clone()));
        }
        Ok(())
    }

    fn committee_for_height(&self, _height: u64) -> Result<Committee, BackendError> {
        Ok(self.committee.clone())
    }

    fn candidate_block(&self, height: u64) -> Result<ProposedBlock, BackendError> {
        Ok(make_block(height, self.keypair.pubkey(), 0))
    }
}
