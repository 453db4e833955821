//! Swap-or-not shuffling, committee slicing and proposer sampling.

use ethereum_hashing::hash_fixed;

use crate::chain_spec::ChainSpec;
use crate::types::{Hash256, ValidatorIndex};

/// One round of the swap-or-not network decides, per index, whether it
/// swaps with its mirror around a seeded pivot.
pub fn shuffled_index(
    index: u64,
    index_count: u64,
    seed: &Hash256,
    shuffle_round_count: u8,
) -> u64 {
    debug_assert!(index < index_count);
    let mut index = index;
    for round in 0..shuffle_round_count {
        let mut pivot_input = [0u8; 33];
        pivot_input[..32].copy_from_slice(seed.as_slice());
        pivot_input[32] = round;
        let pivot = u64::from_le_bytes(
            hash_fixed(&pivot_input)[..8].try_into().expect("8 bytes"),
        ) % index_count;

        let flip = (pivot + index_count - index) % index_count;
        let position = index.max(flip);

        let mut source_input = [0u8; 37];
        source_input[..32].copy_from_slice(seed.as_slice());
        source_input[32] = round;
        source_input[33..].copy_from_slice(&((position / 256) as u32).to_le_bytes());
        let source = hash_fixed(&source_input);

        let byte = source[((position % 256) / 8) as usize];
        if (byte >> (position % 8)) & 1 == 1 {
            index = flip;
        }
    }
    index
}

/// Members of committee `index` among `committees` for one slot, as a
/// slice of the shuffled active set.
pub fn compute_committee(
    active: &[ValidatorIndex],
    seed: &Hash256,
    committee_index: u64,
    committee_count: u64,
    spec: &ChainSpec,
) -> Vec<ValidatorIndex> {
    let total = active.len() as u64;
    let start = (total * committee_index) / committee_count;
    let end = (total * (committee_index + 1)) / committee_count;
    (start..end)
        .map(|i| active[shuffled_index(i, total, seed, spec.shuffle_round_count) as usize])
        .collect()
}

pub fn committee_count_per_slot(active_count: u64, spec: &ChainSpec) -> u64 {
    (active_count / spec.slots_per_epoch / spec.target_committee_size)
        .clamp(1, spec.max_committees_per_slot)
}

/// Three random bytes per draw; the high byte only contributes its low
/// nibble, so draws are 20-bit values.
fn sample_u20(bytes: &[u8]) -> u32 {
    (bytes[0] as u32) | ((bytes[1] as u32) << 8) | (((bytes[2] & 0x0f) as u32) << 16)
}

/// Effective-balance-weighted proposer sampling over the shuffled active
/// set.
pub fn compute_proposer_index(
    active: &[ValidatorIndex],
    effective_balances: &[u64],
    seed: &Hash256,
    spec: &ChainSpec,
) -> Option<ValidatorIndex> {
    if active.is_empty() {
        return None;
    }
    let total = active.len() as u64;
    let max_effective = spec.max_effective_balance;
    let mut i: u64 = 0;
    loop {
        let shuffled = shuffled_index(i % total, total, seed, spec.shuffle_round_count);
        let candidate = active[shuffled as usize];

        let mut draw_input = [0u8; 40];
        draw_input[..32].copy_from_slice(seed.as_slice());
        draw_input[32..].copy_from_slice(&(i / 10).to_le_bytes());
        let digest = hash_fixed(&draw_input);
        let offset = ((i % 10) * 3) as usize;
        let draw = sample_u20(&digest[offset..offset + 3]) as u64;

        let effective = effective_balances
            .get(candidate as usize)
            .copied()
            .unwrap_or(0);
        if effective * 0xf_ffff >= max_effective * draw {
            return Some(candidate);
        }
        i += 1;
        if i >= total * 64 {
            // Bounded retry; fall back to the first shuffled candidate.
            return Some(active[shuffled_index(0, total, seed, spec.shuffle_round_count) as usize]);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain_spec::ChainSpec;

    #[test]
    fn shuffle_is_a_permutation() {
        let spec = ChainSpec::minimal();
        let seed = Hash256::repeat_byte(42);
        let count = 25u64;
        let mut seen = vec![false; count as usize];
        for i in 0..count {
            let j = shuffled_index(i, count, &seed, spec.shuffle_round_count);
            assert!(j < count);
            assert!(!seen[j as usize], "index {j} hit twice");
            seen[j as usize] = true;
        }
    }

    #[test]
    fn shuffle_depends_on_seed() {
        let spec = ChainSpec::minimal();
        let a: Vec<u64> = (0..16)
            .map(|i| shuffled_index(i, 16, &Hash256::repeat_byte(1), spec.shuffle_round_count))
            .collect();
        let b: Vec<u64> = (0..16)
            .map(|i| shuffled_index(i, 16, &Hash256::repeat_byte(2), spec.shuffle_round_count))
            .collect();
        assert_ne!(a, b);
    }

    #[test]
    fn committees_partition_the_active_set() {
        let spec = ChainSpec::minimal();
        let active: Vec<u64> = (0..23).collect();
        let seed = Hash256::repeat_byte(7);
        let committees = 4;
        let mut members: Vec<u64> = (0..committees)
            .flat_map(|c| compute_committee(&active, &seed, c, committees, &spec))
            .collect();
        members.sort_unstable();
        assert_eq!(members, active);
    }

    #[test]
    fn committee_count_is_clamped() {
        let spec = ChainSpec::minimal();
        assert_eq!(committee_count_per_slot(1, &spec), 1);
        assert_eq!(
            committee_count_per_slot(u64::MAX / 2, &spec),
            spec.max_committees_per_slot
        );
    }

    #[test]
    fn proposer_sampling_is_deterministic() {
        let spec = ChainSpec::minimal();
        let active: Vec<u64> = (0..8).collect();
        let balances = vec![spec.max_effective_balance; 8];
        let seed = Hash256::repeat_byte(3);
        let first = compute_proposer_index(&active, &balances, &seed, &spec).unwrap();
        let second = compute_proposer_index(&active, &balances, &seed, &spec).unwrap();
        assert_eq!(first, second);
        assert!(active.contains(&first));
    }
}
