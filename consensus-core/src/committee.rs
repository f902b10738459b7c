//! Committee snapshot for one height.
//!
//! Holds the ordered member list supplied by the backend, the total voting
//! power, and the two committee facts the state machine needs: the quorum
//! threshold and the round-robin proposer.

use {
    crate::error::CommitteeError,
    solana_pubkey::Pubkey,
    std::collections::HashMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitteeMember {
    pub address: Pubkey,
    pub voting_power: u64,
}

/// Ordered, weighted validator set for a single height.
///
/// Member order is the order supplied by the backend and determines the
/// proposer rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
    members: Vec<CommitteeMember>,
    index: HashMap<Pubkey, usize>,
    total_power: u64,
}

impl Committee {
    /// Build a committee from `(address, voting_power)` pairs, keeping their order.
    pub fn new(members: Vec<(Pubkey, u64)>) -> Result<Self, CommitteeError> {
        if members.is_empty() {
            return Err(CommitteeError::Empty);
        }

        let mut index = HashMap::with_capacity(members.len());
        let mut total_power: u64 = 0;
        let mut ordered = Vec::with_capacity(members.len());
        for (position, (address, voting_power)) in members.into_iter().enumerate() {
            if voting_power == 0 {
                return Err(CommitteeError::ZeroPower(address));
            }
            if index.insert(address, position).is_some() {
                return Err(CommitteeError::DuplicateMember(address));
            }
            total_power = total_power
                .checked_add(voting_power)
                .ok_or(CommitteeError::PowerOverflow)?;
            ordered.push(CommitteeMember {
                address,
                voting_power,
            });
        }

        Ok(Self {
            members: ordered,
            index,
            total_power,
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Smallest power P with 3P > 2 * total, i.e. `total * 2 / 3 + 1`.
    pub fn quorum(&self) -> u64 {
        let two_thirds = u128::from(self.total_power) * 2 / 3;
        // two_thirds < total_power, so it fits back into u64.
        (two_thirds as u64).saturating_add(1)
    }

    /// Largest faulty power the committee tolerates: `(total - 1) / 3`.
    pub fn max_faulty_power(&self) -> u64 {
        self.total_power.saturating_sub(1) / 3
    }

    /// Round-robin proposer: `members[round mod len]`.
    pub fn proposer(&self, round: u32) -> &CommitteeMember {
        let position = (round as usize) % self.members.len();
        &self.members[position]
    }

    pub fn is_proposer(&self, address: &Pubkey, round: u32) -> bool {
        self.proposer(round).address == *address
    }

    pub fn member(&self, address: &Pubkey) -> Result<&CommitteeMember, CommitteeError> {
        self.index
            .get(address)
            .map(|&position| &self.members[position])
            .ok_or(CommitteeError::UnknownSender(*address))
    }

    pub fn contains(&self, address: &Pubkey) -> bool {
        self.index.contains_key(address)
    }

    /// Voting power of `address`, or 0 for non-members.
    pub fn power_of(&self, address: &Pubkey) -> u64 {
        self.member(address)
            .map(|member| member.voting_power)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter()
    }

    pub fn addresses(&self) -> Vec<Pubkey> {
        self.members.iter().map(|member| member.address).collect()
    }
}
