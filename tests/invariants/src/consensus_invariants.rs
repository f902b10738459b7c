//! Property-based tests for the BFT agreement core.
//!
//! Properties tested:
//! 1. Quorum intersection: any two quorums share more than the faulty power.
//! 2. Proposer rotation follows committee order.
//! 3. Vote accounting is idempotent and never double counts an equivocator.
//! 4. Any single-byte change to a signed envelope is rejected.
//! 5. Agreement: honest replicas never commit different blocks at a height,
//!    under reordering, message loss and an equivocating proposer.
//! 6. Liveness: with all replicas honest and no loss, heights keep committing.
//! 7. Every well-formed vote and proposal decodes to exactly what was signed.

#[cfg(test)]
mod tests {
    use {
        crossbeam_channel::{unbounded, Receiver, Sender},
        proptest::{prelude::*, sample::Index},
        solana_hash::Hash,
        solana_keypair::Keypair,
        solana_pubkey::Pubkey,
        solana_signer::Signer,
        std::{collections::HashMap, sync::Arc},
        trv1_consensus_core::{
            message::{committed_seal_payload, Codec},
            message_log::VoteStatus,
            test_utils::{
                make_block, make_committee, make_keypairs, signed_precommit, signed_prevote,
                signed_proposal, MemoryBackend,
            },
            BftConfig, Committee, ConsensusCore, ConsensusEvent, ConsensusPayload, ProposedBlock,
            Proposal, TimeoutKind, Vote, VoteKind, VoteSet,
        },
    };

    // ── Simulation ──

    struct Replica {
        core: ConsensusCore<Arc<MemoryBackend>>,
        backend: Arc<MemoryBackend>,
        inbox: Receiver<ConsensusEvent>,
        /// Events pulled from the inbox, delivered in arbitrary order.
        buffered: Vec<ConsensusEvent>,
    }

    /// Honest replicas exchanging messages through an adversarial scheduler.
    ///
    /// Delivery order and loss are driven by `choices`. Timeouts only fire
    /// once every buffered message has been delivered, which models a network
    /// that is eventually synchronous.
    struct Simulation {
        keys: Vec<Keypair>,
        committee: Committee,
        replicas: Vec<Replica>,
        senders: Vec<Sender<ConsensusEvent>>,
        choices: Vec<u16>,
        cursor: usize,
        /// Drop one in `loss` deliveries; zero disables loss.
        loss: usize,
    }

    impl Simulation {
        fn new(size: usize, byzantine: &[usize], choices: Vec<u16>, loss: usize) -> Self {
            let keys = make_keypairs(size);
            let committee = make_committee(&keys);
            let honest: Vec<usize> = (0..size).filter(|i| !byzantine.contains(i)).collect();
            let channels: Vec<_> = honest.iter().map(|_| unbounded()).collect();
            let senders: Vec<Sender<ConsensusEvent>> =
                channels.iter().map(|(sender, _)| sender.clone()).collect();

            let replicas = honest
                .iter()
                .zip(channels)
                .enumerate()
                .map(|(slot, (node, (own, inbox)))| {
                    let backend = Arc::new(MemoryBackend::new(
                        keys[*node].insecure_clone(),
                        committee.clone(),
                    ));
                    let peers = senders
                        .iter()
                        .enumerate()
                        .filter(|(peer, _)| *peer != slot)
                        .map(|(_, sender)| sender.clone())
                        .collect();
                    backend.connect(peers, own);
                    let core = ConsensusCore::new(BftConfig::default(), backend.clone(), 0)
                        .unwrap();
                    Replica {
                        core,
                        backend,
                        inbox,
                        buffered: Vec::new(),
                    }
                })
                .collect();

            Self {
                keys,
                committee,
                replicas,
                senders,
                choices,
                cursor: 0,
                loss,
            }
        }

        fn start(&mut self) {
            for replica in &mut self.replicas {
                replica.core.start();
            }
        }

        fn choice(&mut self) -> usize {
            let choice = self.choices[self.cursor % self.choices.len()];
            self.cursor = self.cursor.wrapping_add(1);
            usize::from(choice)
        }

        /// Deliver one event or fire one timeout. Returns false once nothing
        /// is left to do.
        fn step(&mut self) -> bool {
            for replica in &mut self.replicas {
                replica.buffered.extend(replica.inbox.try_iter());
            }

            let ready: Vec<usize> = (0..self.replicas.len())
                .filter(|i| !self.replicas[*i].buffered.is_empty())
                .collect();
            if !ready.is_empty() {
                let target = ready[self.choice() % ready.len()];
                let pick = self.choice();
                let loss = self.loss;
                let replica = &mut self.replicas[target];
                let event = replica.buffered.swap_remove(pick % replica.buffered.len());
                let dropped = loss != 0
                    && pick % loss == 0
                    && matches!(event, ConsensusEvent::Message(_));
                if !dropped {
                    let _ = replica.core.handle_event(event);
                }
                return true;
            }

            let timeouts: Vec<_> = self
                .replicas
                .iter()
                .enumerate()
                .flat_map(|(i, replica)| {
                    TimeoutKind::ALL
                        .iter()
                        .filter_map(|kind| replica.core.timeouts().pending(*kind))
                        .map(move |event| (i, event))
                })
                .collect();
            if timeouts.is_empty() {
                return false;
            }
            let (target, event) = timeouts[self.choice() % timeouts.len()];
            let _ = self.replicas[target]
                .core
                .handle_event(ConsensusEvent::Timeout(event));
            true
        }

        /// Run until every replica is past `height` or the budget runs out.
        fn run_until(&mut self, height: u64, budget: usize) {
            for _ in 0..budget {
                if self.replicas.iter().all(|r| r.core.height() > height) {
                    return;
                }
                if !self.step() {
                    return;
                }
            }
        }

        fn min_height(&self) -> u64 {
            self.replicas
                .iter()
                .map(|replica| replica.core.height())
                .min()
                .unwrap_or_default()
        }

        /// Every honest commit, checked for agreement and valid seals.
        fn assert_agreement(&self) -> Result<HashMap<u64, Hash>, TestCaseError> {
            let mut decided: HashMap<u64, Hash> = HashMap::new();
            for replica in &self.replicas {
                for commit in replica.backend.commits() {
                    let hash = commit.block.hash();
                    let first = *decided.entry(commit.block.height).or_insert(hash);
                    prop_assert_eq!(
                        first,
                        hash,
                        "Conflicting commits at height {}",
                        commit.block.height
                    );

                    let payload = committed_seal_payload(commit.block.height, commit.round, &hash);
                    let mut power = 0;
                    let mut signers = Vec::new();
                    for seal in &commit.seals {
                        prop_assert!(seal.signature.verify(seal.signer.as_ref(), &payload));
                        prop_assert!(!signers.contains(&seal.signer));
                        signers.push(seal.signer);
                        power += self.committee.power_of(&seal.signer);
                    }
                    prop_assert!(
                        power >= self.committee.quorum(),
                        "Commit at height {} carries {} power, quorum is {}",
                        commit.block.height,
                        power,
                        self.committee.quorum()
                    );
                }
            }
            Ok(decided)
        }
    }

    fn random_committee(weights: &[u64]) -> Committee {
        Committee::new(
            weights
                .iter()
                .map(|weight| (Pubkey::new_unique(), *weight))
                .collect(),
        )
        .unwrap()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 1-2. Committee arithmetic
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn quorums_intersect_beyond_faulty_power(
            weights in prop::collection::vec(1..=1_000u64, 1..=16),
        ) {
            let committee = random_committee(&weights);
            let total = committee.total_power();
            let quorum = committee.quorum();
            let faulty = committee.max_faulty_power();

            prop_assert_eq!(total, weights.iter().sum::<u64>());
            prop_assert!(quorum <= total);
            // Two quorums overlap in more power than the adversary holds.
            prop_assert!(2 * quorum > total + faulty);
            // Honest power alone reaches quorum.
            prop_assert!(total - faulty >= quorum);
        }

        #[test]
        fn proposer_rotation_follows_member_order(
            weights in prop::collection::vec(1..=100u64, 1..=10),
            offset in 0..=1_000u32,
        ) {
            let committee = random_committee(&weights);
            let addresses = committee.addresses();
            let size = addresses.len() as u32;

            for round in offset..offset + size {
                let proposer = committee.proposer(round).address;
                prop_assert_eq!(proposer, addresses[(round % size) as usize]);
                prop_assert!(committee.is_proposer(&proposer, round));
            }

            // A window of `size` rounds names every member exactly once.
            let mut window: Vec<Pubkey> = (offset..offset + size)
                .map(|round| committee.proposer(round).address)
                .collect();
            window.sort();
            window.dedup();
            prop_assert_eq!(window.len(), addresses.len());
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 3-4. Vote accounting and authentication
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn repeated_and_conflicting_votes_count_once(
            height in 1..=10_000u64,
            round in 0..=50u32,
            first in prop::option::of(any::<[u8; 32]>()),
            second in any::<[u8; 32]>(),
            repeats in 1..=5usize,
        ) {
            let keys = make_keypairs(4);
            let committee = make_committee(&keys);
            let codec = Codec::default();
            let first = first.map(Hash::new_from_array);
            let second = Some(Hash::new_from_array(second));

            let vote = codec
                .open(&signed_prevote(&keys[1], height, round, first), &committee)
                .unwrap();
            let mut set = VoteSet::new(VoteKind::Prevote, committee.quorum());
            prop_assert!(matches!(set.add(vote.clone()).status, VoteStatus::Counted));
            for _ in 0..repeats {
                prop_assert!(matches!(set.add(vote.clone()).status, VoteStatus::Duplicate));
            }
            prop_assert_eq!(set.len(), 1);
            prop_assert_eq!(set.power_for(&first), 1);

            if second != first {
                let conflicting = codec
                    .open(&signed_prevote(&keys[1], height, round, second), &committee)
                    .unwrap();
                prop_assert!(matches!(
                    set.add(conflicting).status,
                    VoteStatus::Equivocation(_)
                ));
                prop_assert_eq!(set.power_for(&first), 1);
                prop_assert_eq!(set.power_for(&second), 0);
                prop_assert_eq!(set.total_power(), 1);
                prop_assert_eq!(set.equivocations().len(), 1);
            }
        }

        #[test]
        fn tampered_envelope_is_rejected(
            height in 1..=10_000u64,
            round in 0..=50u32,
            hash in any::<[u8; 32]>(),
            position in any::<Index>(),
            mask in 1..=255u8,
        ) {
            let keys = make_keypairs(4);
            let committee = make_committee(&keys);
            let codec = Codec::default();
            let mut bytes =
                signed_precommit(&keys[2], height, round, Some(Hash::new_from_array(hash)));
            prop_assert!(codec.open(&bytes, &committee).is_ok());

            let position = position.index(bytes.len());
            bytes[position] ^= mask;
            prop_assert!(codec.open(&bytes, &committee).is_err());
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 5. Agreement
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn agreement_under_reordering_and_loss(
            size in 4..=7usize,
            choices in prop::collection::vec(any::<u16>(), 64..256),
            loss in prop_oneof![Just(0usize), 3..=10usize],
        ) {
            let mut sim = Simulation::new(size, &[], choices, loss);
            sim.start();
            sim.run_until(3, 20_000);
            sim.assert_agreement()?;
        }

        /// The round 0 proposer of every height sends different blocks to
        /// different replicas and votes for both.
        #[test]
        fn agreement_with_equivocating_proposer(
            split in prop::collection::vec(any::<bool>(), 3),
            choices in prop::collection::vec(any::<u16>(), 64..256),
        ) {
            let mut sim = Simulation::new(4, &[0], choices, 0);
            let byzantine = sim.keys[0].insecure_clone();
            for height in 1..=3u64 {
                let a = make_block(height, byzantine.pubkey(), 1);
                let b = make_block(height, byzantine.pubkey(), 2);
                for (slot, sender) in sim.senders.iter().enumerate() {
                    let block = if split[slot] { a.clone() } else { b.clone() };
                    let mut messages = vec![signed_proposal(&byzantine, height, 0, None, block)];
                    for hash in [a.hash(), b.hash()] {
                        messages.push(signed_prevote(&byzantine, height, 0, Some(hash)));
                        messages.push(signed_precommit(&byzantine, height, 0, Some(hash)));
                    }
                    for bytes in messages {
                        sender.send(ConsensusEvent::Message(bytes)).unwrap();
                    }
                }
            }

            sim.start();
            sim.run_until(3, 20_000);
            sim.assert_agreement()?;

            // Only the equivocator is ever accused.
            for replica in &sim.replicas {
                for evidence in replica.core.evidence().evidence() {
                    prop_assert_eq!(evidence.offender, byzantine.pubkey());
                }
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 6. Liveness
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn honest_replicas_keep_committing(
            size in 1..=7usize,
            choices in prop::collection::vec(any::<u16>(), 64..256),
        ) {
            let mut sim = Simulation::new(size, &[], choices, 0);
            sim.start();
            sim.run_until(3, 20_000);
            prop_assert!(
                sim.min_height() > 3,
                "Stalled at height {} with {} replicas",
                sim.min_height(),
                size
            );
            let decided = sim.assert_agreement()?;
            prop_assert!((1..=3).all(|height| decided.contains_key(&height)));
        }

        /// Losing the round 0 proposer costs one round per height.
        #[test]
        fn progress_without_round_zero_proposer(
            choices in prop::collection::vec(any::<u16>(), 64..256),
        ) {
            let mut sim = Simulation::new(4, &[0], choices, 0);
            sim.start();
            sim.run_until(2, 20_000);
            prop_assert!(sim.min_height() > 2);
            for replica in &sim.replicas {
                prop_assert!(replica.backend.commits().iter().all(|c| c.round >= 1));
            }
            sim.assert_agreement()?;
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 7. Codec fidelity
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// A block hash; the all-zero hash is the wire encoding of nil.
    fn block_hash() -> impl Strategy<Value = Hash> {
        any::<[u8; 32]>()
            .prop_filter("zero hash encodes nil", |bytes| *bytes != [0; 32])
            .prop_map(Hash::new_from_array)
    }

    /// A round within the default limit and a valid round strictly below it.
    fn rounds() -> impl Strategy<Value = (u32, Option<u32>)> {
        let max_round = BftConfig::default().max_round;
        (0..=max_round).prop_flat_map(|round| {
            let valid_round = if round == 0 {
                Just(None).boxed()
            } else {
                prop::option::of(0..round).boxed()
            };
            (Just(round), valid_round)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn votes_decode_as_signed(
            height in any::<u64>(),
            round in 0..=BftConfig::default().max_round,
            block_hash in prop::option::of(block_hash()),
            precommit in any::<bool>(),
        ) {
            let keys = make_keypairs(1);
            let committee = make_committee(&keys);
            let vote = Vote { height, round, block_hash };
            let (bytes, expected) = if precommit {
                (
                    signed_precommit(&keys[0], height, round, block_hash),
                    ConsensusPayload::Precommit(vote),
                )
            } else {
                (
                    signed_prevote(&keys[0], height, round, block_hash),
                    ConsensusPayload::Prevote(vote),
                )
            };

            let (envelope, payload) = Codec::default().decode(&bytes).unwrap();
            prop_assert_eq!(&payload, &expected);
            prop_assert_eq!(envelope.sender, keys[0].pubkey());
            prop_assert_eq!(envelope.committed_seal.is_some(), precommit && block_hash.is_some());
            let opened = Codec::default().open(&bytes, &committee).unwrap();
            prop_assert_eq!(opened.payload(), &expected);
        }

        #[test]
        fn proposals_decode_as_signed(
            height in any::<u64>(),
            (round, valid_round) in rounds(),
            timestamp in any::<i64>(),
            transactions in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8),
            parent in any::<[u8; 32]>(),
        ) {
            let keys = make_keypairs(1);
            let committee = make_committee(&keys);
            let block = ProposedBlock {
                parent_hash: Hash::new_from_array(parent),
                height,
                timestamp,
                transactions,
                state_root: Hash::default(),
                proposer: keys[0].pubkey(),
            };
            let bytes = signed_proposal(&keys[0], height, round, valid_round, block.clone());

            let opened = Codec::default().open(&bytes, &committee).unwrap();
            let expected = ConsensusPayload::Proposal(Proposal {
                height,
                round,
                valid_round,
                block,
            });
            prop_assert_eq!(opened.payload(), &expected);
        }
    }
}
