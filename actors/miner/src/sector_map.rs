// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fvm_ipld_bitfield::BitField;

use sector_actors_runtime::{actor_error, ActorError};

/// Maps partition indices to sector-number sets, e.g. for a fault or
/// termination declaration addressed to one deadline. Iteration is in
/// partition order.
#[derive(Default, Debug, Clone)]
pub struct PartitionSectorMap(BTreeMap<u64, BitField>);

impl PartitionSectorMap {
    /// Records the given sector set at the given partition index, merging
    /// it with any existing sector set for that partition.
    pub fn add_values(&mut self, partition_idx: u64, sector_numbers: Vec<u64>) -> Result<(), ActorError> {
        let sector_numbers = BitField::try_from_bits(sector_numbers)
            .map_err(|_| actor_error!(illegal_argument; "sector number out of range"))?;
        self.add(partition_idx, sector_numbers);
        Ok(())
    }

    /// Records the given sector bitfield at the given partition index, merging
    /// it with any existing bitfield for that partition.
    pub fn add(&mut self, partition_idx: u64, sector_numbers: BitField) {
        self.0
            .entry(partition_idx)
            .and_modify(|old_sector_numbers| *old_sector_numbers |= &sector_numbers)
            .or_insert(sector_numbers);
    }

    /// Counts the number of partitions & sectors within the map.
    pub fn count(&self) -> Result<(u64, u64), ActorError> {
        let sectors = self
            .0
            .values()
            .try_fold(0_u64, |sectors, bf| {
                sectors
                    .checked_add(bf.len())
                    .ok_or_else(|| actor_error!(illegal_argument; "uint64 overflow when counting sectors"))
            })?;
        Ok((self.0.len() as u64, sectors))
    }

    /// Returns an iterator over the partition indices in ascending order.
    pub fn partitions(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &BitField)> + '_ {
        self.0.iter().map(|(&i, bf)| (i, bf))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
