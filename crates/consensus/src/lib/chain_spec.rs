//! Explicit configuration context threaded through schema construction,
//! the state transition, shuffling and fork choice. Nothing here is
//! process-global; tests freely mix minimal and mainnet contexts.

use crate::types::{compute_fork_data_root, Epoch, Gwei, Hash256, Root, Slot, Version};

pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;

pub const DOMAIN_BEACON_PROPOSER: [u8; 4] = [0, 0, 0, 0];
pub const DOMAIN_BEACON_ATTESTER: [u8; 4] = [1, 0, 0, 0];
pub const DOMAIN_RANDAO: [u8; 4] = [2, 0, 0, 0];
pub const DOMAIN_DEPOSIT: [u8; 4] = [3, 0, 0, 0];
pub const DOMAIN_VOLUNTARY_EXIT: [u8; 4] = [4, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkName {
    Phase0,
    Altair,
}

#[derive(Debug, Clone)]
pub struct ChainSpec {
    // Time
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub min_attestation_inclusion_delay: u64,
    pub min_seed_lookahead: u64,
    pub max_seed_lookahead: u64,
    pub min_validator_withdrawability_delay: u64,
    pub shard_committee_period: u64,
    pub epochs_per_eth1_voting_period: u64,

    // State list lengths
    pub slots_per_historical_root: u64,
    pub epochs_per_historical_vector: u64,
    pub epochs_per_slashings_vector: u64,
    pub historical_roots_limit: u64,
    pub validator_registry_limit: u64,

    // Committees
    pub max_committees_per_slot: u64,
    pub target_committee_size: u64,
    pub max_validators_per_committee: u64,
    pub shuffle_round_count: u8,

    // Gwei values
    pub min_deposit_amount: Gwei,
    pub max_effective_balance: Gwei,
    pub effective_balance_increment: Gwei,
    pub ejection_balance: Gwei,
    pub hysteresis_quotient: u64,
    pub hysteresis_downward_multiplier: u64,
    pub hysteresis_upward_multiplier: u64,

    // Validator cycle
    pub min_per_epoch_churn_limit: u64,
    pub churn_limit_quotient: u64,

    // Slashing
    pub min_slashing_penalty_quotient: u64,
    pub whistleblower_reward_quotient: u64,

    // Fork choice
    pub safe_slots_to_update_justified: u64,

    // Fork schedule
    pub genesis_fork_version: [u8; 4],
    pub altair_fork_version: [u8; 4],
    pub altair_fork_epoch: Epoch,
}

impl ChainSpec {
    // https://github.com/ethereum/consensus-specs/blob/dev/configs/mainnet.yaml
    pub fn mainnet() -> Self {
        Self {
            seconds_per_slot: 12,
            slots_per_epoch: 2_u64.pow(5),
            min_attestation_inclusion_delay: 2_u64.pow(0),
            min_seed_lookahead: 2_u64.pow(0),
            max_seed_lookahead: 2_u64.pow(2),
            min_validator_withdrawability_delay: 2_u64.pow(8),
            shard_committee_period: 2_u64.pow(8),
            epochs_per_eth1_voting_period: 2_u64.pow(6),

            slots_per_historical_root: 2_u64.pow(13),
            epochs_per_historical_vector: 2_u64.pow(16),
            epochs_per_slashings_vector: 2_u64.pow(13),
            historical_roots_limit: 2_u64.pow(24),
            validator_registry_limit: 2_u64.pow(40),

            max_committees_per_slot: 2_u64.pow(6),
            target_committee_size: 2_u64.pow(7),
            max_validators_per_committee: 2_u64.pow(11),
            shuffle_round_count: 90,

            min_deposit_amount: 10_u64.pow(9),
            max_effective_balance: 32 * 10_u64.pow(9),
            effective_balance_increment: 10_u64.pow(9),
            ejection_balance: 16 * 10_u64.pow(9),
            hysteresis_quotient: 4,
            hysteresis_downward_multiplier: 1,
            hysteresis_upward_multiplier: 5,

            min_per_epoch_churn_limit: 2_u64.pow(2),
            churn_limit_quotient: 2_u64.pow(16),

            min_slashing_penalty_quotient: 2_u64.pow(5),
            whistleblower_reward_quotient: 2_u64.pow(9),

            safe_slots_to_update_justified: 2_u64.pow(3),

            genesis_fork_version: [0, 0, 0, 0],
            altair_fork_version: [1, 0, 0, 0],
            altair_fork_epoch: 74240,
        }
    }

    // https://github.com/ethereum/consensus-specs/blob/dev/configs/minimal.yaml
    pub fn minimal() -> Self {
        Self {
            seconds_per_slot: 6,
            slots_per_epoch: 8,
            min_validator_withdrawability_delay: 2_u64.pow(8),
            shard_committee_period: 64,
            epochs_per_eth1_voting_period: 4,

            slots_per_historical_root: 64,
            epochs_per_historical_vector: 64,
            epochs_per_slashings_vector: 64,
            historical_roots_limit: 2_u64.pow(24),
            validator_registry_limit: 2_u64.pow(16),

            max_committees_per_slot: 4,
            target_committee_size: 4,
            shuffle_round_count: 10,

            churn_limit_quotient: 32,

            genesis_fork_version: [0, 0, 0, 1],
            altair_fork_version: [1, 0, 0, 1],
            altair_fork_epoch: FAR_FUTURE_EPOCH,

            ..Self::mainnet()
        }
    }

    pub fn epoch_at_slot(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch
    }

    pub fn start_slot_of_epoch(&self, epoch: Epoch) -> Slot {
        epoch * self.slots_per_epoch
    }

    pub fn slots_since_epoch_start(&self, slot: Slot) -> u64 {
        slot - self.start_slot_of_epoch(self.epoch_at_slot(slot))
    }

    /// Earliest epoch at which an activation or exit triggered now takes
    /// effect.
    pub fn activation_exit_epoch(&self, epoch: Epoch) -> Epoch {
        epoch + 1 + self.max_seed_lookahead
    }

    pub fn churn_limit(&self, active_validator_count: u64) -> u64 {
        std::cmp::max(
            self.min_per_epoch_churn_limit,
            active_validator_count / self.churn_limit_quotient,
        )
    }

    pub fn fork_name_at_epoch(&self, epoch: Epoch) -> ForkName {
        if epoch >= self.altair_fork_epoch {
            ForkName::Altair
        } else {
            ForkName::Phase0
        }
    }

    pub fn fork_version_at_epoch(&self, epoch: Epoch) -> [u8; 4] {
        match self.fork_name_at_epoch(epoch) {
            ForkName::Altair => self.altair_fork_version,
            ForkName::Phase0 => self.genesis_fork_version,
        }
    }

    /// Domain separator: four type bytes followed by the first 28 bytes of
    /// the fork data root.
    pub fn compute_domain(
        &self,
        domain_type: [u8; 4],
        fork_version: [u8; 4],
        genesis_validators_root: Root,
    ) -> Hash256 {
        let version = Version::from(fork_version.to_vec());
        let fork_data_root = compute_fork_data_root(&version, genesis_validators_root);
        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&domain_type);
        domain[4..].copy_from_slice(&fork_data_root.as_slice()[..28]);
        Hash256::from(domain)
    }
}
