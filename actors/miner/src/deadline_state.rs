// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::{PoStProof, SectorSize};
use num_traits::{Signed, Zero};

use sector_actors_runtime::{actor_error, ActorContext, ActorError, Array, AsActorError};

use crate::bitfield_queue::BitFieldQueue;
use crate::expiration_queue::ExpirationSet;
use crate::partition_state::Partition;
use crate::quantize::QuantSpec;
use crate::sector_map::PartitionSectorMap;
use crate::sectors::Sectors;
use crate::termination::TerminationResult;
use crate::types::{ActorVersion, PoStPartition, PowerPair, SectorOnChainInfo, WindowedPoSt};

pub const DEADLINE_PARTITIONS_AMT_BITWIDTH: u32 = 3;
pub const DEADLINE_EXPIRATIONS_AMT_BITWIDTH: u32 = 5;

/// Given that 4 partitions can be proven in one post, this AMT's height will
/// only exceed the partition AMT's height at ~0.75EiB of storage.
pub const DEADLINE_OPTIMISTIC_POST_SUBMISSIONS_AMT_BITWIDTH: u32 = 2;

/// Deadline holds the state for all sectors due at a specific deadline.
#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone)]
pub struct Deadline {
    /// Partitions in this deadline, in order.
    /// The keys of this AMT are always sequential integers beginning with zero.
    pub partitions: Cid, // AMT[PartitionNumber]Partition

    /// Maps epochs to partitions that _may_ have sectors that expire in or
    /// before that epoch, either on-time or early as faults.
    /// Keys are quantized to final epochs in each proving deadline.
    ///
    /// NOTE: Partitions MUST NOT be removed from this queue (until the
    /// associated epoch has passed) even if they no longer have sectors
    /// expiring at that epoch. Sectors expiring at this epoch may later be
    /// recovered, and this queue will not be updated at that time.
    pub expirations_epochs: Cid, // AMT[ChainEpoch]BitField

    /// Partitions that have been proved by window PoSts so far during the
    /// current challenge window.
    /// NOTE: This bitfield includes both partitions whose proofs
    /// were optimistically accepted and stored in
    /// `optimistic_post_submissions`, and those whose proofs were
    /// verified on-chain.
    pub partitions_posted: BitField,

    /// Partitions with sectors that terminated early.
    pub early_terminations: BitField,

    /// The number of non-terminated sectors in this deadline (incl faulty).
    pub live_sectors: u64,

    /// The total number of sectors in this deadline (incl dead).
    pub total_sectors: u64,

    /// Memoized sum of faulty power in partitions.
    pub faulty_power: PowerPair,

    /// AMT of optimistically accepted WindowPoSt proofs, submitted during
    /// the current challenge window. At the end of the challenge window,
    /// this AMT will be moved to `optimistic_post_submissions_snapshot`.
    /// WindowPoSt proofs verified on-chain do not appear in this AMT.
    /// Only used from V3; empty before then.
    pub optimistic_post_submissions: Cid, // AMT[]WindowedPoSt

    /// Snapshot of partition state at the end of the previous challenge
    /// window for this deadline. Only used from V3.
    pub partitions_snapshot: Cid,

    /// These proofs may be disputed via DisputeWindowedPoSt. Successfully
    /// disputed window PoSts are removed from the snapshot. Only used from V3.
    pub optimistic_post_submissions_snapshot: Cid,
}

/// Aggregate outcome of recording a window proof over a set of partitions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PoStResult {
    /// Power activated or deactivated (positive or negative).
    pub power_delta: PowerPair,
    pub new_faulty_power: PowerPair,
    pub retracted_recovery_power: PowerPair,
    pub recovered_power: PowerPair,
    /// A bitfield of all sectors in the proven partitions.
    pub sectors: BitField,
    /// A subset of `sectors` that should be ignored.
    pub ignored_sectors: BitField,
}

impl Deadline {
    pub fn new<BS: Blockstore>(store: &BS) -> Result<Self, ActorError> {
        let empty_partitions_array =
            Array::<Partition, BS>::new_with_bit_width(store, DEADLINE_PARTITIONS_AMT_BITWIDTH)
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to create empty partitions")?;
        let empty_deadline_expiration_array =
            Array::<BitField, BS>::new_with_bit_width(store, DEADLINE_EXPIRATIONS_AMT_BITWIDTH)
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to create empty expirations")?;
        let empty_post_submissions_array = Array::<WindowedPoSt, BS>::new_with_bit_width(
            store,
            DEADLINE_OPTIMISTIC_POST_SUBMISSIONS_AMT_BITWIDTH,
        )
        .flush()
        .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to create empty post submissions")?;

        Ok(Self {
            partitions: empty_partitions_array,
            expirations_epochs: empty_deadline_expiration_array,
            early_terminations: BitField::new(),
            live_sectors: 0,
            total_sectors: 0,
            faulty_power: PowerPair::zero(),
            partitions_posted: BitField::new(),
            optimistic_post_submissions: empty_post_submissions_array,
            partitions_snapshot: empty_partitions_array,
            optimistic_post_submissions_snapshot: empty_post_submissions_array,
        })
    }

    pub fn partitions_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<'db, Partition, BS>, ActorError> {
        Array::load(&self.partitions, store)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load partitions")
    }

    pub fn partitions_snapshot_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<'db, Partition, BS>, ActorError> {
        Array::load(&self.partitions_snapshot, store)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load partitions snapshot")
    }

    pub fn optimistic_proofs_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<'db, WindowedPoSt, BS>, ActorError> {
        Array::load(&self.optimistic_post_submissions, store)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load post submissions")
    }

    pub fn load_partition<BS: Blockstore>(
        &self,
        store: &BS,
        partition_idx: u64,
    ) -> Result<Partition, ActorError> {
        let partitions = self.partitions_amt(store)?;

        let partition = partitions
            .get(partition_idx)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to lookup partition {}", partition_idx)
            })?
            .ok_or_else(|| actor_error!(not_found; "no partition {}", partition_idx))?;

        Ok(partition.clone())
    }

    /// Adds some partition numbers to the set expiring at an epoch in the expiration queue.
    fn add_expiration_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        expiration_epoch: ChainEpoch,
        partitions: &[u64],
        quant: QuantSpec,
    ) -> Result<(), ActorError> {
        // Avoid doing any work if there's nothing to reschedule.
        if partitions.is_empty() {
            return Ok(());
        }

        let mut queue = BitFieldQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load expiration queue")?;

        queue
            .add_to_queue_values(expiration_epoch, partitions.iter().copied())
            .context("failed to mutate expiration queue")?;

        self.expirations_epochs = queue
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save expiration queue")?;

        Ok(())
    }

    /// PopExpiredSectors terminates expired sectors from all partitions.
    /// Returns the expired sector aggregates.
    pub fn pop_expired_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> Result<ExpirationSet, ActorError> {
        let (expired_partitions, modified) = self.pop_expired_partitions(store, until, quant)?;

        if !modified {
            // nothing to do.
            return Ok(ExpirationSet::empty());
        }

        let mut partitions = self.partitions_amt(store)?;

        let mut on_time_sectors = Vec::<BitField>::new();
        let mut early_sectors = Vec::<BitField>::new();
        let mut all_on_time_pledge = TokenAmount::zero();
        let mut all_active_power = PowerPair::zero();
        let mut all_faulty_power = PowerPair::zero();
        let mut partitions_with_early_terminations = Vec::<u64>::new();

        // For each partition with an expiry, remove and collect expirations from the partition queue.
        for i in expired_partitions.iter() {
            let partition_idx = i;
            let mut partition = partitions
                .get(partition_idx)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to lookup partition")?
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("missing expected partition {}", partition_idx)
                })?
                .clone();

            let partition_expiration =
                partition.pop_expired_sectors(store, until, quant).with_context(|| {
                    format!("failed to pop expired sectors from partition {}", partition_idx)
                })?;

            if !partition_expiration.early_sectors.is_empty() {
                partitions_with_early_terminations.push(partition_idx);
            }

            on_time_sectors.push(partition_expiration.on_time_sectors);
            early_sectors.push(partition_expiration.early_sectors);
            all_active_power += &partition_expiration.active_power;
            all_faulty_power += &partition_expiration.faulty_power;
            all_on_time_pledge += &partition_expiration.on_time_pledge;

            partitions.set(partition_idx, partition).context_code(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to store partition",
            )?;
        }

        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save partitions")?;

        // Update early expiration bitmap.
        for partition_idx in partitions_with_early_terminations {
            self.early_terminations.set(partition_idx);
        }

        let all_on_time_sectors = BitField::union(on_time_sectors.iter());
        let all_early_sectors = BitField::union(early_sectors.iter());

        // Update live sector count.
        let on_time_count = all_on_time_sectors.len();
        let early_count = all_early_sectors.len();
        self.live_sectors -= on_time_count + early_count;

        self.faulty_power -= &all_faulty_power;

        self.validate_state()?;

        Ok(ExpirationSet {
            on_time_sectors: all_on_time_sectors,
            early_sectors: all_early_sectors,
            on_time_pledge: all_on_time_pledge,
            active_power: all_active_power,
            faulty_power: all_faulty_power,
        })
    }

    /// Adds sectors to a deadline. It's the caller's responsibility to make
    /// sure that this deadline isn't currently "open" (i.e., being proved at
    /// this point in time). The sectors are assumed to be non-faulty.
    /// Returns the power activated immediately (zero for unproven additions).
    pub fn add_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        partition_size: u64,
        proven: bool,
        version: ActorVersion,
        mut sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<PowerPair, ActorError> {
        let mut activated_power = PowerPair::zero();

        if sectors.is_empty() {
            return Ok(activated_power);
        }

        // First update partitions, consuming the sectors
        let mut partition_deadline_updates =
            Vec::<(ChainEpoch, u64)>::with_capacity(sectors.len());
        self.live_sectors += sectors.len() as u64;
        self.total_sectors += sectors.len() as u64;

        let mut partitions = self.partitions_amt(store)?;

        // try filling up the last partition first.
        let mut partition_idx = partitions.count().saturating_sub(1);

        while !sectors.is_empty() {
            // Get/create partition to update.
            let mut partition = match partitions
                .get(partition_idx)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to lookup partition")?
            {
                Some(partition) => partition.clone(),
                None => Partition::new(store)?,
            };

            // Figure out which (if any) sectors we want to add to this partition.
            let sector_count = partition.sectors.len();
            if sector_count >= partition_size {
                partition_idx += 1;
                continue;
            }

            let size = cmp::min(partition_size - sector_count, sectors.len() as u64) as usize;
            let (partition_new_sectors, sectors_rest) = sectors.split_at(size);
            sectors = sectors_rest;

            // Add sectors to partition.
            let partition_activated_power = partition
                .add_sectors(store, proven, version, partition_new_sectors, sector_size, quant)
                .context("failed to add sectors to partition")?;
            activated_power += &partition_activated_power;

            // Save partition back.
            partitions.set(partition_idx, partition).context_code(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to store partition",
            )?;

            // Record deadline -> partition mapping so we can later update the deadlines.
            partition_deadline_updates.extend(
                partition_new_sectors.iter().map(|s| (s.expiration, partition_idx)),
            )
        }

        // Save partitions back.
        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save partitions")?;

        // Next, update the expiration queue.
        let mut deadline_expirations = BitFieldQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load expiration epochs")?;
        deadline_expirations
            .add_many_to_queue_values(partition_deadline_updates.iter().copied())
            .context("failed to add expirations for new deadlines")?;
        self.expirations_epochs = deadline_expirations
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save expiration epochs")?;

        self.validate_state()?;

        Ok(activated_power)
    }

    /// Pops queued early terminations from partitions in this deadline, up to
    /// the caller-supplied partition and sector budgets. `has_more` indicates
    /// whether this deadline still has pending early terminations.
    pub fn pop_early_terminations<BS: Blockstore>(
        &mut self,
        store: &BS,
        max_partitions: u64,
        max_sectors: u64,
    ) -> Result<(TerminationResult, bool), ActorError> {
        let mut partitions = self.partitions_amt(store)?;

        let mut partitions_finished = Vec::<u64>::new();
        let mut result = TerminationResult::new();

        for i in self.early_terminations.iter() {
            let partition_idx = i;

            let mut partition = match partitions
                .get(partition_idx)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to load partition {}", partition_idx)
                })? {
                Some(partition) => partition.clone(),
                None => {
                    // If the partition doesn't exist any more, no problem.
                    // We don't expect this to happen (compaction should re-index altered partitions),
                    // but it's not worth failing if it does.
                    log::warn!(
                        "partition {} marked for early termination but missing from deadline",
                        partition_idx
                    );
                    partitions_finished.push(partition_idx);
                    continue;
                }
            };

            // Pop early terminations.
            let (partition_result, more) = partition
                .pop_early_terminations(store, max_sectors - result.sectors_processed)
                .context("failed to pop terminations from partition")?;

            result += partition_result;

            // If we've processed all of them for this partition, unmark it in the deadline.
            if !more {
                partitions_finished.push(partition_idx);
            }

            // Save partition back.
            partitions.set(partition_idx, partition).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to store partition {}", partition_idx),
            )?;

            if !result.below_limit(max_partitions, max_sectors) {
                break;
            }
        }

        // Removed finished partitions from the index.
        for finished in partitions_finished {
            self.early_terminations.unset(finished);
        }

        // Save deadline state.
        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to update partitions")?;

        self.validate_state()?;

        let no_early_terminations = self.early_terminations.is_empty();

        Ok((result, !no_early_terminations))
    }

    /// Removes and returns all partition ids with expirations up to and
    /// including `until` from the deadline-wide expiration index.
    fn pop_expired_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> Result<(BitField, bool), ActorError> {
        let mut expirations = BitFieldQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load expiration queue")?;

        let (popped, modified) = expirations
            .pop_until(until)
            .context("failed to pop expiring partitions")?;

        if modified {
            self.expirations_epochs = expirations
                .amt
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save expiration queue")?;
        }

        Ok((popped, modified))
    }

    pub fn terminate_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        epoch: ChainEpoch,
        partition_sectors: &PartitionSectorMap,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<PowerPair, ActorError> {
        let mut partitions = self.partitions_amt(store)?;

        let mut power_lost = PowerPair::zero();
        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let mut partition = partitions
                .get(partition_idx)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to load partition {}", partition_idx)
                })?
                .ok_or_else(|| actor_error!(not_found; "failed to find partition {}", partition_idx))?
                .clone();

            let removed = partition
                .terminate_sectors(store, sectors, epoch, sector_numbers, sector_size, quant)
                .with_context(|| {
                    format!("failed to terminate sectors in partition {}", partition_idx)
                })?;

            partitions.set(partition_idx, partition).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to store updated partition {}", partition_idx),
            )?;

            let removed_count = removed.len();
            if removed_count > 0 {
                // Record that partition now has pending early terminations.
                self.early_terminations.set(partition_idx);

                // Record change to sectors and power
                self.live_sectors -= removed_count;
            } // note: we should _always_ have early terminations, unless the early termination bitfield is empty.

            self.faulty_power -= &removed.faulty_power;

            // Aggregate power lost from active sectors
            power_lost += &removed.active_power;
        }

        // Save partitions back.
        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to persist partitions")?;

        self.validate_state()?;

        Ok(power_lost)
    }

    /// RemovePartitions removes the specified partitions, shifting the remaining
    /// ones to the left, and returning the live and dead sectors they contained.
    ///
    /// Returns an error if any of the partitions contained faulty sectors or early
    /// terminations.
    pub fn remove_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        to_remove: &BitField,
        quant: QuantSpec,
    ) -> Result<(BitField, BitField, PowerPair), ActorError> {
        let old_partitions = self.partitions_amt(store).context("failed to load partitions")?;

        let partition_count = old_partitions.count();
        let to_remove_set: Vec<u64> = to_remove.iter().collect();

        if to_remove_set.is_empty() {
            // Nothing to do.
            return Ok((BitField::new(), BitField::new(), PowerPair::zero()));
        }

        if let Some(&max_partition) = to_remove_set.iter().max() {
            if max_partition >= partition_count {
                return Err(actor_error!(
                    illegal_argument;
                    "partition index {} out of range [0, {})",
                    max_partition, partition_count
                ));
            }
        }

        // Should already be checked earlier, but we might as well check again.
        if !self.early_terminations.is_empty() {
            return Err(actor_error!(
                illegal_state;
                "cannot remove partitions from deadline with early terminations"
            ));
        }

        let mut new_partitions =
            Array::<Partition, BS>::new_with_bit_width(store, DEADLINE_PARTITIONS_AMT_BITWIDTH);
        let mut all_dead_sectors = Vec::<BitField>::with_capacity(to_remove_set.len());
        let mut all_live_sectors = Vec::<BitField>::with_capacity(to_remove_set.len());
        let mut removed_power = PowerPair::zero();

        old_partitions
            .for_each(|partition_idx, partition| {
                // If we're keeping the partition as-is, append it to the new partitions array.
                if !to_remove.get(partition_idx) {
                    let next_idx = new_partitions.count();
                    new_partitions.set(next_idx, partition.clone())?;
                    return Ok(());
                }

                // Don't allow removing partitions with faulty sectors.
                if !partition.faults.is_empty() {
                    return Err(anyhow::anyhow!("cannot remove, partition contains faults"));
                }

                // Don't allow removing partitions with unproven sectors.
                if !partition.unproven.is_empty() {
                    return Err(anyhow::anyhow!(
                        "cannot remove, partition contains unproven sectors"
                    ));
                }

                // Get the live sectors.
                let live_sectors = partition.live_sectors();

                all_dead_sectors.push(partition.terminated.clone());
                all_live_sectors.push(live_sectors);
                removed_power += &partition.live_power;

                Ok(())
            })
            .context_code(ExitCode::USR_ILLEGAL_STATE, "while removing partitions")?;

        self.partitions = new_partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to persist new partition table")?;

        let dead = BitField::union(all_dead_sectors.iter());
        let live = BitField::union(all_live_sectors.iter());

        // Update sector counts.
        let removed_dead_sectors = dead.len();
        let removed_live_sectors = live.len();

        self.live_sectors -= removed_live_sectors;
        self.total_sectors -= removed_live_sectors + removed_dead_sectors;

        // Update expiration bitfields.
        let mut expiration_epochs = BitFieldQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load expiration queue")?;

        expiration_epochs
            .cut(to_remove)
            .context("failed cutting removed partitions from deadline expiration queue")?;

        self.expirations_epochs = expiration_epochs
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed persisting deadline expiration queue")?;

        self.validate_state()?;

        Ok((live, dead, removed_power))
    }

    pub fn record_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration_epoch: ChainEpoch,
        partition_sectors: &PartitionSectorMap,
    ) -> Result<PowerPair, ActorError> {
        let mut partitions = self.partitions_amt(store)?;

        // Record partitions with some fault, for subsequently indexing in the deadline.
        // Duplicate entries don't matter, they'll be stored in a bitfield (a set).
        let mut partitions_with_fault = Vec::<u64>::with_capacity(partition_sectors.len());
        let mut power_delta = PowerPair::zero();

        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let mut partition = partitions
                .get(partition_idx)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to load partition {}", partition_idx)
                })?
                .ok_or_else(|| actor_error!(not_found; "no such partition {}", partition_idx))?
                .clone();

            let (new_faults, partition_power_delta, partition_new_faulty_power) = partition
                .record_faults(
                    store,
                    sectors,
                    sector_numbers,
                    fault_expiration_epoch,
                    sector_size,
                    quant,
                )
                .with_context(|| format!("failed to declare faults in partition {}", partition_idx))?;

            self.faulty_power += &partition_new_faulty_power;
            power_delta += &partition_power_delta;
            if !new_faults.is_empty() {
                partitions_with_fault.push(partition_idx);
            }

            partitions.set(partition_idx, partition).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to store partition {}", partition_idx),
            )?;
        }

        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store partitions root")?;

        self.add_expiration_partitions(store, fault_expiration_epoch, &partitions_with_fault, quant)
            .context("failed to update expirations for partitions with faults")?;

        self.validate_state()?;

        Ok(power_delta)
    }

    pub fn declare_faults_recovered<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        partition_sectors: &PartitionSectorMap,
    ) -> Result<(), ActorError> {
        let mut partitions = self.partitions_amt(store)?;

        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let mut partition = partitions
                .get(partition_idx)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to load partition {}", partition_idx)
                })?
                .ok_or_else(|| actor_error!(not_found; "no such partition {}", partition_idx))?
                .clone();

            partition
                .declare_faults_recovered(sectors, sector_size, sector_numbers)
                .context("failed to add recoveries to partition")?;

            partitions.set(partition_idx, partition).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to update partition {}", partition_idx),
            )?;
        }

        // Power is not regained until the deadline end, when the recovery is confirmed.
        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store partitions root")?;

        self.validate_state()?;

        Ok(())
    }

    /// Processes a series of posts, recording proven partitions and marking skipped
    /// sectors as faulty.
    ///
    /// It returns a PoStResult containing the list of proven and skipped sectors and
    /// changes to power (newly faulty power, power that should have been proven
    /// recovered but wasn't, and newly recovered power).
    ///
    /// NOTE: This function does not actually _verify_ any proofs.
    pub fn record_proven_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        version: ActorVersion,
        post_partitions: &[PoStPartition],
    ) -> Result<PoStResult, ActorError> {
        // Reject duplicate partitions in a single submission.
        let mut partition_indexes = BitField::new();
        for post in post_partitions {
            if partition_indexes.get(post.index) {
                return Err(actor_error!(illegal_argument; "duplicate partitions proven"));
            }
            partition_indexes.set(post.index);
        }

        let mut partitions = self.partitions_amt(store)?;

        let mut all_sectors = Vec::<BitField>::with_capacity(post_partitions.len());
        let mut all_ignored = Vec::<BitField>::with_capacity(post_partitions.len());
        let mut new_faulty_power_total = PowerPair::zero();
        let mut retracted_recovery_power_total = PowerPair::zero();
        let mut recovered_power_total = PowerPair::zero();
        let mut rescheduled_partitions = Vec::<u64>::new();
        let mut power_delta = PowerPair::zero();

        // Accumulate sectors info for proof verification.
        for post in post_partitions {
            if self.partitions_posted.get(post.index) {
                // Partition already proven earlier in this window; nothing to do.
                continue;
            }

            let mut partition = partitions
                .get(post.index)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to load partition {}", post.index)
                })?
                .ok_or_else(|| actor_error!(not_found; "no such partition {}", post.index))?
                .clone();

            // Process new faults and accumulate new faulty power.
            // This updates the faults in partition state ahead of calculating the sectors to include for proof.
            let (mut new_power_delta, new_fault_power, retracted_recovery_power, has_new_faults) =
                partition
                    .record_skipped_faults(
                        store,
                        sectors,
                        sector_size,
                        quant,
                        fault_expiration,
                        &post.skipped,
                    )
                    .with_context(|| {
                        format!("failed to add skipped faults to partition {}", post.index)
                    })?;

            // If we have new faulty power, we've added some faults. We need
            // to record the new expiration in the deadline.
            if has_new_faults {
                rescheduled_partitions.push(post.index);
            }

            // Process recoveries, assuming the proof will be successful.
            // This similarly updates state.
            let recovered_power = partition
                .recover_faults(store, sectors, sector_size, quant)
                .with_context(|| {
                    format!("failed to recover faulty sectors for partition {}", post.index)
                })?;
            new_power_delta += &recovered_power;

            // Finally, activate power for newly proven sectors.
            if version.supports_unproven_sectors() {
                new_power_delta += &partition.activate_unproven();
            }

            // This will be rolled back if the method aborts with a failed proof.
            self.partitions_posted.set(post.index);

            new_faulty_power_total += &new_fault_power;
            retracted_recovery_power_total += &retracted_recovery_power;
            recovered_power_total += &recovered_power;
            power_delta += &new_power_delta;

            // Record the post.
            all_sectors.push(partition.sectors.clone());
            all_ignored.push(partition.faults.clone());
            all_ignored.push(partition.terminated.clone());

            partitions.set(post.index, partition).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to update partition {}", post.index),
            )?;
        }

        self.add_expiration_partitions(store, fault_expiration, &rescheduled_partitions, quant)
            .context("failed to update expirations for partitions with faults")?;

        // Save everything else.
        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to persist partitions")?;

        // Update memoized sum of faulty power.
        self.faulty_power -= &recovered_power_total;
        self.faulty_power += &new_faulty_power_total;

        self.validate_state()?;

        Ok(PoStResult {
            new_faulty_power: new_faulty_power_total,
            retracted_recovery_power: retracted_recovery_power_total,
            recovered_power: recovered_power_total,
            sectors: BitField::union(all_sectors.iter()),
            power_delta,
            ignored_sectors: BitField::union(all_ignored.iter()),
        })
    }

    /// Appends an optimistically accepted window proof, to be kept for
    /// later dispute. Only used from V3.
    pub fn record_post_proofs<BS: Blockstore>(
        &mut self,
        store: &BS,
        partitions: &BitField,
        proofs: &[PoStProof],
    ) -> Result<(), ActorError> {
        let mut proof_arr =
            self.optimistic_proofs_amt(store).context("failed to load post proofs")?;
        let next_idx = proof_arr.count();
        proof_arr
            .set(
                next_idx,
                WindowedPoSt { partitions: partitions.clone(), proofs: proofs.to_vec() },
            )
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store proof")?;

        self.optimistic_post_submissions = proof_arr
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save proofs")?;

        Ok(())
    }

    /// ProcessDeadlineEnd processes all PoSt submissions, marking unproven sectors as
    /// faulty and clearing failed recoveries. It returns the power delta, and any
    /// power that should be penalized (new faults and failed recoveries).
    pub fn process_deadline_end<BS: Blockstore>(
        &mut self,
        store: &BS,
        quant: QuantSpec,
        fault_expiration_epoch: ChainEpoch,
        version: ActorVersion,
    ) -> Result<(PowerPair, PowerPair), ActorError> {
        let mut partitions = self.partitions_amt(store).context("failed to load partitions")?;

        let mut power_delta = PowerPair::zero();
        let mut penalized_power = PowerPair::zero();
        let mut rescheduled_partitions = Vec::<u64>::new();

        for partition_idx in 0..partitions.count() {
            if self.partitions_posted.get(partition_idx) {
                // Skip partitions with proofs.
                continue;
            }

            let mut partition = partitions
                .get(partition_idx)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to load partition {}", partition_idx)
                })?
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("no partition {}", partition_idx)
                })?
                .clone();

            // If we have no recovering power/sectors, and all power is faulty, skip
            // this. This lets us skip some work if a miner repeatedly fails to PoSt.
            if partition.recovering_power.is_zero()
                && partition.faulty_power == partition.live_power
            {
                continue;
            }

            // Ok, we actually need to process this partition. Make sure we save the partition state back.
            let (part_power_delta, part_penalized_power, part_new_faulty_power) = partition
                .record_missed_post(store, fault_expiration_epoch, quant, version)
                .with_context(|| {
                    format!("failed to record missed PoSt for partition {}", partition_idx)
                })?;

            // We marked some sectors faulty, we need to record the new
            // expiration. We don't want to do this if we're just penalizing
            // the miner for failing to recover power.
            if !part_new_faulty_power.is_zero() {
                rescheduled_partitions.push(partition_idx);
            }

            // Save new partition state.
            partitions.set(partition_idx, partition).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to update partition {}", partition_idx),
            )?;

            self.faulty_power += &part_new_faulty_power;

            power_delta += &part_power_delta;
            penalized_power += &part_penalized_power;
        }

        // Save modified deadline state.
        self.partitions = partitions
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store partitions")?;

        self.add_expiration_partitions(
            store,
            fault_expiration_epoch,
            &rescheduled_partitions,
            quant,
        )
        .context("failed to update expirations for partitions with faults")?;

        // Reset PoSt submissions, and snapshot the proving state for disputes.
        self.partitions_posted = BitField::new();
        if version.keeps_post_snapshots() {
            self.partitions_snapshot = self.partitions;
            self.optimistic_post_submissions_snapshot = self.optimistic_post_submissions;
            self.optimistic_post_submissions = Array::<WindowedPoSt, BS>::new_with_bit_width(
                store,
                DEADLINE_OPTIMISTIC_POST_SUBMISSIONS_AMT_BITWIDTH,
            )
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to clear pending proofs")?;
        }

        self.validate_state()?;

        Ok((power_delta, penalized_power))
    }

    /// Reschedules the expirations of the given sectors to a new expiration
    /// epoch. References to partitions that no longer exist, or sector numbers
    /// a partition no longer holds active, are silently skipped (the caller's
    /// view may be stale after a compaction). Returns the sectors actually
    /// rescheduled.
    pub fn reschedule_sector_expirations<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        expiration: ChainEpoch,
        partition_sectors: &PartitionSectorMap,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        let mut partitions = self.partitions_amt(store)?;

        let mut rescheduled_partitions = Vec::<u64>::new();
        let mut all_replaced = Vec::new();

        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let mut partition = match partitions
                .get(partition_idx)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to load partition {}", partition_idx)
                })? {
                Some(partition) => partition.clone(),
                None => {
                    // We failed to find the partition, it could have moved
                    // due to compaction. This function only reschedules
                    // sectors it can find so we'll just skip it.
                    continue;
                }
            };

            let replaced = partition
                .reschedule_expirations(
                    store,
                    sectors,
                    expiration,
                    sector_numbers,
                    sector_size,
                    quant,
                )
                .with_context(|| {
                    format!("failed to reschedule expirations in partition {}", partition_idx)
                })?;

            if replaced.is_empty() {
                // nothing moved.
                continue;
            }
            all_replaced.extend(replaced);

            rescheduled_partitions.push(partition_idx);
            partitions.set(partition_idx, partition).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to store partition {}", partition_idx),
            )?;
        }

        if !rescheduled_partitions.is_empty() {
            self.partitions = partitions
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save partitions")?;

            self.add_expiration_partitions(store, expiration, &rescheduled_partitions, quant)
                .context("failed to reschedule partition expirations")?;
        }

        self.validate_state()?;

        Ok(all_replaced)
    }

    /// Checked after every mutation of the deadline.
    pub fn validate_state(&self) -> Result<(), ActorError> {
        if self.live_sectors > self.total_sectors {
            return Err(actor_error!(illegal_state; "deadline left with more live sectors than total"));
        }

        if self.faulty_power.raw.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(actor_error!(illegal_state; "deadline left with negative faulty power"));
        }

        Ok(())
    }
}
