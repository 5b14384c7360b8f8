// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::SectorSize;
use num_traits::Signed;

use sector_actors_runtime::{actor_error, ActorContext, ActorError, Array, AsActorError};

use crate::bitfield_queue::BitFieldQueue;
use crate::expiration_queue::{ExpirationQueue, ExpirationSet, PARTITION_EXPIRATION_AMT_BITWIDTH};
use crate::policy::power_for_sectors;
use crate::quantize::{QuantSpec, NO_QUANTIZATION};
use crate::sectors::{select_sectors, Sectors};
use crate::termination::TerminationResult;
use crate::types::{ActorVersion, PowerPair, SectorOnChainInfo};

pub const PARTITION_EARLY_TERMINATION_ARRAY_AMT_BITWIDTH: u32 = 3;

/// A bounded group of sectors sharing one fault/recovery/termination record
/// within a deadline. Sector metadata lives in the external sector store; the
/// partition tracks only numbers and power aggregates.
#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, PartialEq)]
pub struct Partition {
    /// Sector numbers in this partition, including faulty, unproven and terminated sectors.
    pub sectors: BitField,
    /// Unproven sectors in this partition. This bitfield will be cleared on
    /// a successful window post (or at the end of the partition's next
    /// deadline). At that time, any still-unproven sectors will be added to
    /// the faulty sector bitfield.
    pub unproven: BitField,
    /// Subset of sectors detected/declared faulty and not yet recovered (excl. from PoSt).
    /// Faults ∪ recovering must be a subset of partition sectors.
    /// Faults and recovering must be disjoint with terminated.
    pub faults: BitField,
    /// Subset of faulty sectors expected to recover on next PoSt.
    /// Recovering must be a subset of faults.
    pub recoveries: BitField,
    /// Subset of sectors terminated but not yet removed from partition (excl. from PoSt).
    pub terminated: BitField,
    /// Maps epochs sectors that expire in or before that epoch.
    /// An expiration may be an "on-time" scheduled expiration, or early "faulty" expiration.
    /// Keys are quantized to last-in-deadline epochs.
    pub expirations_epochs: Cid, // AMT[ChainEpoch]ExpirationSet
    /// Subset of terminated that were before their committed expiration epoch, by termination epoch.
    /// Termination fees have not yet been calculated or paid and associated deals have not yet been
    /// canceled but effective power has already been adjusted.
    /// Not quantized.
    pub early_terminated: Cid, // AMT[ChainEpoch]BitField
    /// Power of not-yet-terminated sectors (incl faulty & unproven).
    pub live_power: PowerPair,
    /// Power of yet-to-be-proved sectors (never faulty).
    pub unproven_power: PowerPair,
    /// Power of currently-faulty sectors. FaultyPower <= LivePower.
    pub faulty_power: PowerPair,
    /// Power of expected-to-recover sectors. RecoveringPower <= FaultyPower.
    pub recovering_power: PowerPair,
}

impl Partition {
    pub fn new<BS: Blockstore>(store: &BS) -> Result<Self, ActorError> {
        let empty_expiration_array =
            Array::<ExpirationSet, BS>::new_with_bit_width(store, PARTITION_EXPIRATION_AMT_BITWIDTH)
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to create empty expirations")?;
        let empty_early_termination_array = Array::<BitField, BS>::new_with_bit_width(
            store,
            PARTITION_EARLY_TERMINATION_ARRAY_AMT_BITWIDTH,
        )
        .flush()
        .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to create empty early terminations")?;

        Ok(Self {
            sectors: BitField::new(),
            unproven: BitField::new(),
            faults: BitField::new(),
            recoveries: BitField::new(),
            terminated: BitField::new(),
            expirations_epochs: empty_expiration_array,
            early_terminated: empty_early_termination_array,
            live_power: PowerPair::zero(),
            unproven_power: PowerPair::zero(),
            faulty_power: PowerPair::zero(),
            recovering_power: PowerPair::zero(),
        })
    }

    /// Live sectors are those that are not terminated (but may be faulty).
    pub fn live_sectors(&self) -> BitField {
        &self.sectors - &self.terminated
    }

    /// Active sectors are those that are neither terminated nor faulty nor unproven, i.e. actively contributing power.
    pub fn active_sectors(&self) -> BitField {
        let non_faulty = &self.live_sectors() - &self.faults;
        &non_faulty - &self.unproven
    }

    /// Active power is power of non-faulty sectors.
    pub fn active_power(&self) -> PowerPair {
        &(&self.live_power - &self.faulty_power) - &self.unproven_power
    }

    /// AddSectors adds new sectors to the partition.
    /// The sectors are "live", neither faulty, recovering, nor terminated.
    /// Each new sector's expiration is scheduled shortly after its target expiration epoch.
    /// If `proven` is false (and the version tracks unproven sectors), the sectors are added
    /// to the partition's unproven set and they will not be charged to power until activated.
    /// Returns the power activated immediately.
    pub fn add_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        proven: bool,
        version: ActorVersion,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<PowerPair, ActorError> {
        let mut expirations = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load sector expirations")?;

        let (sector_numbers, power, _) = expirations
            .add_active_sectors(sectors, sector_size)
            .context("failed to record new sector expirations")?;

        self.expirations_epochs = expirations
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store sector expirations")?;

        if self.sectors.contains_any(&sector_numbers) {
            return Err(actor_error!(illegal_state; "not all added sectors are new"));
        }

        // Update the partition's cached sector numbers and power.
        self.sectors |= &sector_numbers;
        self.live_power += &power;

        let mut activated_power = power.clone();
        if version.supports_unproven_sectors() && !proven {
            self.unproven_power += &power;
            self.unproven |= &sector_numbers;
            activated_power = PowerPair::zero();
        }

        self.validate_state()?;

        // No change to faults, recoveries, or terminations.
        // No change to faulty or recovering power.
        Ok(activated_power)
    }

    /// Activates all unproven sectors, returning the activated power.
    pub fn activate_unproven(&mut self) -> PowerPair {
        self.unproven = BitField::new();
        std::mem::take(&mut self.unproven_power)
    }

    /// marks a set of sectors faulty
    fn add_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &BitField,
        sectors: &[SectorOnChainInfo],
        fault_expiration: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<(PowerPair, PowerPair), ActorError> {
        // Load expiration queue
        let mut queue = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load partition queue")?;

        // Reschedule faults
        let new_faulty_power = queue
            .reschedule_as_faults(fault_expiration, sectors, sector_size)
            .context("failed to add faults to partition queue")?;

        // Save expiration queue
        self.expirations_epochs = queue
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store sector expirations")?;

        // Update partition metadata
        self.faults |= sector_numbers;

        // The sectors must not have been previously faulty or recovering.
        // No change to recoveries or terminations.
        self.faulty_power += &new_faulty_power;

        // Once marked faulty, sectors are moved out of the unproven set.
        let unproven = sector_numbers & &self.unproven;
        self.unproven -= &unproven;

        let mut power_delta = -new_faulty_power.clone();

        let unproven_infos = select_sectors(sectors, &unproven)?;
        if !unproven_infos.is_empty() {
            let lost_unproven_power = power_for_sectors(sector_size, &unproven_infos);
            self.unproven_power -= &lost_unproven_power;
            power_delta += &lost_unproven_power;
        }

        self.validate_state()?;

        // No change to live or recovering power.
        Ok((power_delta, new_faulty_power))
    }

    /// Declares a set of sectors faulty. Already faulty sectors are ignored,
    /// terminated sectors are skipped, and recovering sectors are reverted to
    /// faulty.
    ///
    /// - New faults are added to the Faults bitfield and the FaultyPower is increased.
    /// - The sectors' expirations are rescheduled to the fault expiration epoch, as "early" (if not expiring earlier).
    ///
    /// Returns the power of the now-faulty sectors.
    pub fn record_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_numbers: &BitField,
        fault_expiration_epoch: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<(BitField, PowerPair, PowerPair), ActorError> {
        if !self.sectors.contains_all(sector_numbers) {
            return Err(actor_error!(
                illegal_state;
                "failed fault declaration: not all sectors are assigned to the partition"
            ));
        }

        // Split declarations into declarations of new faults, and retraction of declared recoveries.
        let retracted_recoveries = &self.recoveries & sector_numbers;
        let mut new_faults = sector_numbers - &retracted_recoveries;

        // Ignore any terminated sectors and previously declared or detected faults
        new_faults -= &self.terminated;
        new_faults -= &self.faults;

        // Add new faults to state.
        let new_fault_sectors =
            sectors.load_sector(&new_faults).context("failed to load fault sectors")?;

        let (power_delta, new_faulty_power) = if !new_fault_sectors.is_empty() {
            self.add_faults(
                store,
                &new_faults,
                &new_fault_sectors,
                fault_expiration_epoch,
                sector_size,
                quant,
            )?
        } else {
            Default::default()
        };

        // Remove faulty recoveries from state.
        let retracted_recovery_sectors = sectors
            .load_sector(&retracted_recoveries)
            .context("failed to load recovery sectors")?;
        if !retracted_recovery_sectors.is_empty() {
            let retracted_recovery_power =
                power_for_sectors(sector_size, &retracted_recovery_sectors);
            self.remove_recoveries(&retracted_recoveries, &retracted_recovery_power);
        }

        self.validate_state()?;

        Ok((new_faults, power_delta, new_faulty_power))
    }

    /// Declares sectors as recovering. The sectors must all be faulty.
    /// Declaring a sector that is already recovering changes nothing, so
    /// repeated declarations never double-count `recovering_power`.
    pub fn declare_faults_recovered<BS: Blockstore>(
        &mut self,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        sector_numbers: &BitField,
    ) -> Result<(), ActorError> {
        // Recoveries must be declared for faulty sectors only.
        if !self.faults.contains_all(sector_numbers) {
            return Err(actor_error!(
                illegal_state;
                "failed recovery declaration: not all sectors are faulty in the partition"
            ));
        }

        // Ignore sectors already declared recovered.
        let recoveries = sector_numbers - &self.recoveries;

        let recovery_sectors =
            sectors.load_sector(&recoveries).context("failed to load recovered sectors")?;

        // Record the new recoveries for processing at Window PoSt or deadline cron.
        self.recoveries |= &recoveries;

        let power = power_for_sectors(sector_size, &recovery_sectors);
        self.recovering_power += &power;

        self.validate_state()?;

        // No change to faults, or terminations.
        // No change to faulty power.
        Ok(())
    }

    /// Removes sectors from recoveries and recovering power. Assumes sectors are currently faulty and recovering.
    fn remove_recoveries(&mut self, sector_numbers: &BitField, power: &PowerPair) {
        if sector_numbers.is_empty() {
            return;
        }

        self.recoveries -= sector_numbers;
        self.recovering_power -= power;

        // No change to faults, or terminations.
        // No change to faulty power.
    }

    /// Removes all previously-declared recoveries from faults, clears the
    /// recovery set, and restores their power from faulty to active.
    /// Returns the power of the newly-recovered sectors.
    pub fn recover_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<PowerPair, ActorError> {
        // Process recoveries, assuming the proof will be successful.
        // This similarly updates state.
        let recovered_sectors =
            sectors.load_sector(&self.recoveries).context("failed to load recovered sectors")?;

        // Load expiration queue
        let mut queue = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load partition queue")?;

        // Reschedule recovered
        let power = queue
            .reschedule_recovered(&recovered_sectors, sector_size)
            .context("failed to reschedule faults in partition queue")?;

        // Save expiration queue
        self.expirations_epochs = queue
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store sector expirations")?;

        // Update partition metadata
        let recoveries = std::mem::take(&mut self.recoveries);
        self.faults -= &recoveries;

        self.recovering_power -= &power;
        self.faulty_power -= &power;

        self.validate_state()?;

        // No change to live power.
        // No change to unproven sectors.
        Ok(power)
    }

    /// Reschedules the expirations of the partition's sectors named in
    /// `sector_numbers` that are currently active: faulty, terminated and
    /// absent sectors are silently excluded. Returns the infos of the sectors
    /// that were actually moved.
    pub fn reschedule_expirations<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        new_expiration: ChainEpoch,
        sector_numbers: &BitField,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        // Ensure these sectors actually belong to this partition.
        let present = sector_numbers & &self.sectors;

        // Filter out terminated sectors.
        let live = &present - &self.terminated;

        // Filter out faulty sectors.
        let active = &live - &self.faults;

        let sector_infos =
            sectors.load_sector(&active).context("failed to load rescheduled sectors")?;

        let mut expirations = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load sector expirations")?;

        expirations
            .reschedule_expirations(new_expiration, &sector_infos, sector_size)
            .context("failed to reschedule sector expirations")?;

        self.expirations_epochs = expirations
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store sector expirations")?;

        self.validate_state()?;

        Ok(sector_infos)
    }

    /// Replaces a number of "old" sectors with new ones.
    /// The old sectors must not be faulty, terminated, or unproven.
    /// If the same sector is both removed and added, this permits rescheduling *with a change in power*,
    /// unlike RescheduleExpirations.
    /// Returns the delta to power and pledge requirement.
    pub fn replace_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        old_sectors: &[SectorOnChainInfo],
        new_sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<(PowerPair, TokenAmount), ActorError> {
        let mut expirations = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load sector expirations")?;

        let (old_sector_numbers, new_sector_numbers, power_delta, pledge_delta) = expirations
            .replace_sectors(old_sectors, new_sectors, sector_size)
            .context("failed to replace sector expirations")?;

        self.expirations_epochs = expirations
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store sector expirations")?;

        // Check the sectors being removed are active (alive, not faulty, not unproven).
        let active = self.active_sectors();
        let all_active = active.contains_all(&old_sector_numbers);

        if !all_active {
            return Err(actor_error!(illegal_state; "refusing to replace inactive sectors"));
        }

        // Update partition metadata.
        self.sectors -= &old_sector_numbers;
        self.sectors |= &new_sector_numbers;
        self.live_power += &power_delta;

        self.validate_state()?;

        // No change to faults, recoveries, or terminations.
        // No change to faulty or recovering power.
        Ok((power_delta, pledge_delta))
    }

    /// Record the epoch of any sectors expiring early, for termination fee calculation later.
    pub fn record_early_termination<BS: Blockstore>(
        &mut self,
        store: &BS,
        epoch: ChainEpoch,
        sectors: &BitField,
    ) -> Result<(), ActorError> {
        let mut early_termination_queue =
            BitFieldQueue::new(store, &self.early_terminated, NO_QUANTIZATION)
                .context("failed to load early termination queue")?;

        early_termination_queue
            .add_to_queue(epoch, sectors)
            .context("failed to add to early termination queue")?;

        self.early_terminated = early_termination_queue
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save early termination queue")?;

        Ok(())
    }

    /// Marks a collection of sectors as terminated.
    /// The sectors are removed from Faults and Recoveries.
    /// The epoch of termination is recorded for future termination fee calculation.
    /// Returns the aggregate of removed sectors; its `active_power` is the
    /// power actually removed from the proving set.
    pub fn terminate_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        epoch: ChainEpoch,
        sector_numbers: &BitField,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<ExpirationSet, ActorError> {
        let live_sectors = self.live_sectors();

        if !live_sectors.contains_all(sector_numbers) {
            return Err(actor_error!(illegal_state; "can only terminate live sectors"));
        }

        let sector_infos =
            sectors.load_sector(sector_numbers).context("failed to load sectors")?;
        let mut expirations = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load sector expirations")?;

        let (mut removed, removed_recovering) = expirations
            .remove_sectors(&sector_infos, &self.faults, &self.recoveries, sector_size)
            .context("failed to remove sector expirations")?;

        self.expirations_epochs = expirations
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save sector expirations")?;

        let removed_sectors = &removed.on_time_sectors | &removed.early_sectors;

        // Record early termination.
        self.record_early_termination(store, epoch, &removed_sectors)
            .context("failed to record early sector termination")?;

        let unproven_nos = &removed_sectors & &self.unproven;

        // Update partition metadata.
        self.faults -= &removed_sectors;
        self.recoveries -= &removed_sectors;
        self.terminated |= &removed_sectors;
        self.live_power -= &removed.active_power;
        self.live_power -= &removed.faulty_power;
        self.faulty_power -= &removed.faulty_power;
        self.recovering_power -= &removed_recovering;
        self.unproven -= &unproven_nos;

        // Adjust for unproven sectors: they never contributed power, so their
        // removal is not reported to the caller.
        let unproven_infos = select_sectors(&sector_infos, &unproven_nos)?;
        if !unproven_infos.is_empty() {
            let removed_unproven_power = power_for_sectors(sector_size, &unproven_infos);
            self.unproven_power -= &removed_unproven_power;
            removed.active_power -= &removed_unproven_power;
        }

        self.validate_state()?;

        Ok(removed)
    }

    /// PopExpiredSectors traverses the expiration queue up to and including some epoch, and marks all expiring
    /// sectors as terminated.
    ///
    /// This cannot be called while there are unproven sectors.
    ///
    /// Returns the expired sector aggregates.
    pub fn pop_expired_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> Result<ExpirationSet, ActorError> {
        // This is a sanity check to make sure we handle proofs _before_
        // handling sector expirations.
        if !self.unproven.is_empty() {
            return Err(actor_error!(
                illegal_state;
                "cannot pop expired sectors from a partition with unproven sectors"
            ));
        }

        let mut expirations = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load expiration queue")?;
        let popped = expirations.pop_until(until).with_context(|| {
            format!("failed to pop expiration queue until {}", until)
        })?;
        self.expirations_epochs = expirations
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save expiration queue")?;

        let expired_sectors = &popped.on_time_sectors | &popped.early_sectors;

        // There shouldn't be any recovering sectors or power if this is invoked at deadline end.
        // Either the partition was proven, in which case the recovering sectors are recovered,
        // or the partition was not proven, in which case the recovering sectors are faulty.
        if !self.recoveries.is_empty() {
            return Err(actor_error!(
                illegal_state;
                "unexpected recoveries while processing expirations"
            ));
        }
        if !self.recovering_power.is_zero() {
            return Err(actor_error!(
                illegal_state;
                "unexpected recovering power while processing expirations"
            ));
        }

        // Nothing expiring now should have already terminated.
        if self.terminated.contains_any(&expired_sectors) {
            return Err(actor_error!(illegal_state; "expiring sectors already terminated"));
        }

        // Mark the sectors as terminated and subtract sector power.
        self.terminated |= &expired_sectors;
        self.faults -= &expired_sectors;
        self.live_power -= &popped.active_power;
        self.live_power -= &popped.faulty_power;
        self.faulty_power -= &popped.faulty_power;

        // Record the epoch of any sectors expiring early, for termination fee calculation later.
        self.record_early_termination(store, until, &popped.early_sectors)
            .context("failed to record early terminations")?;

        self.validate_state()?;

        Ok(popped)
    }

    /// Marks all non-faulty sectors in the partition as faulty and clears recoveries, updating power memos appropriately.
    /// All sectors' expirations are rescheduled to the fault expiration, as "early" (if not expiring earlier)
    /// Returns the power delta, power that should be penalized (new faults + failed recoveries), and newly faulty power.
    pub fn record_missed_post<BS: Blockstore>(
        &mut self,
        store: &BS,
        fault_expiration: ChainEpoch,
        quant: QuantSpec,
        version: ActorVersion,
    ) -> Result<(PowerPair, PowerPair, PowerPair), ActorError> {
        // Collapse tail of queue into the last entry, and mark all power faulty.
        // Happens regardless of whether the partition contains any strictly new faults.
        let mut queue = ExpirationQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load partition queue")?;

        queue
            .reschedule_all_as_faults(fault_expiration)
            .context("failed to reschedule all as faults")?;

        self.expirations_epochs = queue
            .amt
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save partition queue")?;

        // Compute faulty power for penalization. New faulty power is the total power minus already faulty.
        let new_faulty_power = &self.live_power - &self.faulty_power;
        // Penalized power is the newly faulty power, plus the failed recovery power.
        let penalized_power = &self.recovering_power + &new_faulty_power;

        // The power delta is -(newFaultyPower - unproven), because unproven power
        // was never counted in the first place.
        let power_delta = -(&new_faulty_power - &self.unproven_power);

        // Update partition metadata.
        let all_faults = self.live_sectors();
        self.faults = all_faults;
        self.recoveries = BitField::new();
        self.faulty_power = self.live_power.clone();
        self.recovering_power = PowerPair::zero();
        if version.supports_unproven_sectors() {
            self.unproven = BitField::new();
            self.unproven_power = PowerPair::zero();
        }

        self.validate_state()?;

        Ok((power_delta, penalized_power, new_faulty_power))
    }

    /// Pops up to `max_sectors` sectors from the queue of pending early
    /// terminations, oldest termination epoch first. The `has_more` flag
    /// indicates whether entries remain, so the caller can resume within its
    /// own per-invocation budget.
    pub fn pop_early_terminations<BS: Blockstore>(
        &mut self,
        store: &BS,
        max_sectors: u64,
    ) -> Result<(TerminationResult, bool), ActorError> {
        // Load early terminations.
        let mut early_terminated_queue =
            BitFieldQueue::new(store, &self.early_terminated, NO_QUANTIZATION)
                .context("failed to load early termination queue")?;

        let mut processed = Vec::<u64>::new();
        let mut remaining: Option<(u64, BitField)> = None;
        let mut result = TerminationResult::new();
        result.partitions_processed = 1;

        early_terminated_queue
            .amt
            .for_each_while(|i, sectors| {
                let epoch: ChainEpoch = i.try_into()?;
                let count = sectors.len();
                let limit = max_sectors - result.sectors_processed;

                let to_process = if limit < count {
                    let to_process = sectors
                        .slice(0, limit)
                        .ok_or_else(|| anyhow::anyhow!("failed to slice early terminations"))?;
                    let rest = sectors - &to_process;
                    remaining = Some((i, rest));
                    result.sectors_processed += limit;
                    to_process
                } else {
                    processed.push(i);
                    result.sectors_processed += count;
                    sectors.clone()
                };

                result.sectors.insert(epoch, to_process);

                Ok(result.sectors_processed < max_sectors)
            })
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to walk early terminations queue")?;

        // Update early terminations
        early_terminated_queue.amt.batch_delete(processed, true).context_code(
            ExitCode::USR_ILLEGAL_STATE,
            "failed to remove entries from early terminations queue",
        )?;

        if let Some((remaining_epoch, remaining_sectors)) = remaining.take() {
            early_terminated_queue.amt.set(remaining_epoch, remaining_sectors).context_code(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to update remaining entry in early terminations queue",
            )?;
        }

        // Save early terminations.
        self.early_terminated = early_terminated_queue.amt.flush().context_code(
            ExitCode::USR_ILLEGAL_STATE,
            "failed to store early terminations queue",
        )?;

        let has_more = early_terminated_queue.amt.count() > 0;

        self.validate_state()?;

        Ok((result, has_more))
    }

    /// Marks a number of sectors faulty because a submitted proof explicitly
    /// skipped them. Already-faulty and terminated sectors in the skip set are
    /// ignored; recoveries among them are retracted.
    ///
    /// Returns the power delta, new faulty power, power retracted from
    /// recovering, and whether any strictly new faults were recorded.
    pub fn record_skipped_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        skipped: &BitField,
    ) -> Result<(PowerPair, PowerPair, PowerPair, bool), ActorError> {
        if skipped.is_empty() {
            return Ok((PowerPair::zero(), PowerPair::zero(), PowerPair::zero(), false));
        }

        // Check that the declared sectors are actually in the partition.
        if !self.sectors.contains_all(skipped) {
            return Err(actor_error!(
                illegal_argument;
                "skipped faults contain sectors outside partition"
            ));
        }

        // Find all skipped faults that have been labeled recovered.
        let retracted_recoveries = &self.recoveries & skipped;
        let retracted_recovery_sectors = sectors
            .load_sector(&retracted_recoveries)
            .context("failed to load sectors retracted from recovering")?;
        let retracted_recovery_power =
            power_for_sectors(sector_size, &retracted_recovery_sectors);

        // Ignore skipped faults that are already faults or terminated.
        let new_faults = &(skipped - &self.terminated) - &self.faults;
        let new_fault_sectors =
            sectors.load_sector(&new_faults).context("failed to load skipped fault sectors")?;

        // Record new faults.
        let (power_delta, new_fault_power) = if !new_fault_sectors.is_empty() {
            self.add_faults(
                store,
                &new_faults,
                &new_fault_sectors,
                fault_expiration,
                sector_size,
                quant,
            )
            .context("failed to add skipped faults")?
        } else {
            Default::default()
        };

        // Remove faulty recoveries.
        if !retracted_recovery_sectors.is_empty() {
            self.remove_recoveries(&retracted_recoveries, &retracted_recovery_power);
        }

        self.validate_state()?;

        Ok((power_delta, new_fault_power, retracted_recovery_power, !new_fault_sectors.is_empty()))
    }

    /// Tests invariants about the power aggregates, returning an error if any are violated.
    pub fn validate_power_state(&self) -> Result<(), ActorError> {
        if self.live_power.raw.is_negative() || self.live_power.qa.is_negative() {
            return Err(actor_error!(illegal_state; "partition left with negative live power"));
        }
        if self.unproven_power.raw.is_negative() || self.unproven_power.qa.is_negative() {
            return Err(
                actor_error!(illegal_state; "partition left with negative unproven power"),
            );
        }
        if self.faulty_power.raw.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(actor_error!(illegal_state; "partition left with negative faulty power"));
        }
        if self.recovering_power.raw.is_negative() || self.recovering_power.qa.is_negative() {
            return Err(
                actor_error!(illegal_state; "partition left with negative recovering power"),
            );
        }
        if self.unproven_power.raw > self.live_power.raw {
            return Err(actor_error!(illegal_state; "partition left with invalid unproven power"));
        }
        if self.faulty_power.raw > self.live_power.raw {
            return Err(actor_error!(illegal_state; "partition left with invalid faulty power"));
        }
        // The first half of this conditional shouldn't matter, keeping for readability.
        if self.recovering_power.raw > self.live_power.raw
            || self.recovering_power.raw > self.faulty_power.raw
        {
            return Err(
                actor_error!(illegal_state; "partition left with invalid recovering power"),
            );
        }

        Ok(())
    }

    /// Tests invariants about the sector-number sets, returning an error if any are violated.
    pub fn validate_bf_state(&self) -> Result<(), ActorError> {
        let mut merge = &self.unproven | &self.faults;

        // Unproven or faulty sectors should not be in terminated
        if self.terminated.contains_any(&merge) {
            return Err(
                actor_error!(illegal_state; "partition left with terminated sectors in multiple states"),
            );
        }

        merge |= &self.terminated;

        // All merged sectors should exist in partition sectors
        if !self.sectors.contains_all(&merge) {
            return Err(actor_error!(illegal_state; "partition left with invalid sector state"));
        }

        // All recoveries should exist in partition faults
        if !self.faults.contains_all(&self.recoveries) {
            return Err(actor_error!(illegal_state; "partition left with invalid recovery state"));
        }

        Ok(())
    }

    /// Checked after every mutation: a violation is a programming error in the
    /// transition just applied, not a recoverable condition.
    pub fn validate_state(&self) -> Result<(), ActorError> {
        self.validate_power_state()?;
        self.validate_bf_state()?;
        Ok(())
    }
}
