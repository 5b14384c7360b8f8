// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorNumber, SectorSize};
use num_traits::Zero;

use sector_actors_runtime::MessageAccumulator;

use crate::expiration_queue::ExpirationQueue;
use crate::bitfield_queue::BitFieldQueue;
use crate::partition_state::Partition;
use crate::deadline_state::Deadline;
use crate::policy::power_for_sector;
use crate::quantize::{QuantSpec, NO_QUANTIZATION};
use crate::types::{PowerPair, SectorOnChainInfo};

pub type SectorsMap = BTreeMap<SectorNumber, SectorOnChainInfo>;

pub fn sectors_as_map(sectors: &[SectorOnChainInfo]) -> SectorsMap {
    sectors.iter().map(|sector| (sector.sector_number, sector.to_owned())).collect()
}

fn power_for_sectors_from_map(
    sector_size: SectorSize,
    sectors: &SectorsMap,
    include: &BitField,
    acc: &MessageAccumulator,
) -> PowerPair {
    let mut power = PowerPair::zero();
    for sector_number in include.iter() {
        match sectors.get(&sector_number) {
            Some(sector) => power += &power_for_sector(sector_size, sector),
            None => acc.add(format!("no info for sector {}", sector_number)),
        }
    }
    power
}

pub struct PartitionStateSummary {
    pub all_sectors: BitField,
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub recovering_power: PowerPair,
    // Epochs at which some sector is scheduled to expire.
    pub expiration_epochs: Vec<ChainEpoch>,
    pub early_termination_count: u64,
}

impl PartitionStateSummary {
    /// Checks the per-mutation invariants of one partition: set containment,
    /// power aggregates, expiration-queue consistency, and the early
    /// termination queue. Accumulates any violation into `acc`.
    pub fn check_partition_state_invariants<BS: Blockstore>(
        partition: &Partition,
        store: &BS,
        quant: QuantSpec,
        sector_size: SectorSize,
        sectors_map: &SectorsMap,
        acc: &MessageAccumulator,
    ) -> Self {
        let live = partition.live_sectors();
        let active = partition.active_sectors();

        // Live contains all active sectors.
        acc.require(live.contains_all(&active), "live does not contain active");

        // Live contains all faults.
        acc.require(live.contains_all(&partition.faults), "live does not contain faults");

        // Live contains all unproven.
        acc.require(live.contains_all(&partition.unproven), "live does not contain unproven");

        // Active contains no faults.
        acc.require(
            !active.contains_any(&partition.faults),
            "active includes faults",
        );

        // Active contains no unproven.
        acc.require(
            !active.contains_any(&partition.unproven),
            "active includes unproven",
        );

        // Faults contains all recoveries.
        acc.require(
            partition.faults.contains_all(&partition.recoveries),
            "faults do not contain recoveries",
        );

        // Live contains no terminated sectors.
        acc.require(
            !live.contains_any(&partition.terminated),
            "live includes terminations",
        );

        // Live contains all live sectors.
        acc.require(
            partition.sectors.contains_all(&live),
            "partition sectors do not contain live",
        );

        // All terminated sectors are part of the partition.
        acc.require(
            partition.sectors.contains_all(&partition.terminated),
            "partition sectors do not contain terminations",
        );

        // Validate power.
        let live_power = power_for_sectors_from_map(sector_size, sectors_map, &live, acc);
        acc.require(
            live_power == partition.live_power,
            format!("live power was {:?}, expected {:?}", partition.live_power, live_power),
        );

        let faulty_power =
            power_for_sectors_from_map(sector_size, sectors_map, &partition.faults, acc);
        acc.require(
            faulty_power == partition.faulty_power,
            format!("faulty power was {:?}, expected {:?}", partition.faulty_power, faulty_power),
        );

        let recovering_power =
            power_for_sectors_from_map(sector_size, sectors_map, &partition.recoveries, acc);
        acc.require(
            recovering_power == partition.recovering_power,
            format!(
                "recovering power was {:?}, expected {:?}",
                partition.recovering_power, recovering_power
            ),
        );

        let unproven_power =
            power_for_sectors_from_map(sector_size, sectors_map, &partition.unproven, acc);
        acc.require(
            unproven_power == partition.unproven_power,
            format!(
                "unproven power was {:?}, expected {:?}",
                partition.unproven_power, unproven_power
            ),
        );

        let active_power = &live_power - &faulty_power - unproven_power;
        acc.require(
            partition.active_power() == active_power,
            format!("active power was {:?}, expected {:?}", partition.active_power(), active_power),
        );

        // Validate the expiration queue.
        let mut expiration_epochs = Vec::new();
        match ExpirationQueue::new(store, &partition.expirations_epochs, quant) {
            Ok(expiration_queue) => {
                let ret = check_expiration_queue(
                    &expiration_queue,
                    &live,
                    &partition.faults,
                    quant,
                    sector_size,
                    sectors_map,
                    acc,
                );
                expiration_epochs = ret;
            }
            Err(err) => acc.add(format!("error loading expiration queue: {}", err)),
        };

        // Validate the early termination queue.
        let early_termination_count =
            match BitFieldQueue::new(store, &partition.early_terminated, NO_QUANTIZATION) {
                Ok(queue) => check_early_termination_queue(queue, &partition.terminated, acc),
                Err(err) => {
                    acc.add(format!("error loading early termination queue: {}", err));
                    0
                }
            };

        PartitionStateSummary {
            all_sectors: partition.sectors.clone(),
            live_power,
            active_power,
            faulty_power,
            recovering_power,
            expiration_epochs,
            early_termination_count,
        }
    }
}

/// Checks the expiration queue for consistency: quantized keys, uniquely
/// scheduled sectors, correct active/faulty classification, and aggregate
/// power/pledge per entry.
fn check_expiration_queue<BS: Blockstore>(
    expiration_queue: &ExpirationQueue<BS>,
    live: &BitField,
    faults: &BitField,
    quant: QuantSpec,
    sector_size: SectorSize,
    sectors_map: &SectorsMap,
    acc: &MessageAccumulator,
) -> Vec<ChainEpoch> {
    let mut seen_sectors = BitField::new();
    let mut all_on_time = Vec::<BitField>::new();
    let mut all_early = Vec::<BitField>::new();
    let mut expiration_epochs = Vec::new();

    let ret = expiration_queue.amt.for_each(|epoch, expiration_set| {
        let epoch = epoch as ChainEpoch;
        let acc = acc.with_prefix(format!("expiration epoch {}: ", epoch));
        acc.require(
            quant.quantize_up(epoch) == epoch,
            format!("expiration queue key {} is not quantized", epoch),
        );

        expiration_epochs.push(epoch);

        let mut expiring_sector_count = 0_u64;
        let mut active_power = PowerPair::zero();
        let mut faulty_power = PowerPair::zero();
        let mut on_time_pledge = TokenAmount::zero();

        for sector_number in expiration_set.on_time_sectors.iter() {
            expiring_sector_count += 1;

            // Check sectors are present only once.
            acc.require(
                !seen_sectors.get(sector_number),
                format!("sector {} in expiration queue twice", sector_number),
            );
            seen_sectors.set(sector_number);

            // Check expiring sectors are still alive.
            if let Some(sector) = sectors_map.get(&sector_number) {
                // The sector can be "on time" either at its target expiration epoch, or in a
                // earlier set (when rescheduled).
                let target = quant.quantize_up(sector.expiration);
                acc.require(
                    epoch <= target,
                    format!(
                        "invalid expiration {} for sector {}, expected at most {}",
                        epoch, sector_number, target
                    ),
                );

                let power = power_for_sector(sector_size, sector);
                if faults.get(sector_number) {
                    faulty_power += &power;
                } else {
                    active_power += &power;
                }
                on_time_pledge += &sector.initial_pledge;
            } else {
                acc.add(format!("on-time expiring sector {} isn't live", sector_number));
            }
        }

        for sector_number in expiration_set.early_sectors.iter() {
            expiring_sector_count += 1;

            acc.require(
                !seen_sectors.get(sector_number),
                format!("sector {} in expiration queue twice", sector_number),
            );
            seen_sectors.set(sector_number);

            // Early sectors must be faulty.
            acc.require(
                faults.get(sector_number),
                format!("early expiring sector {} is not faulty", sector_number),
            );

            if let Some(sector) = sectors_map.get(&sector_number) {
                // Check early sectors are not scheduled at or beyond their target epoch.
                let target = quant.quantize_up(sector.expiration);
                acc.require(
                    epoch < target,
                    format!(
                        "invalid early expiration {} for sector {}, expected strictly before {}",
                        epoch, sector_number, target
                    ),
                );
                faulty_power += &power_for_sector(sector_size, sector);
            } else {
                acc.add(format!("early expiring sector {} isn't live", sector_number));
            }
        }

        // Validate power and pledge.
        acc.require(
            active_power == expiration_set.active_power,
            format!(
                "active power recorded {:?} doesn't match computed {:?}",
                expiration_set.active_power, active_power
            ),
        );
        acc.require(
            faulty_power == expiration_set.faulty_power,
            format!(
                "faulty power recorded {:?} doesn't match computed {:?}",
                expiration_set.faulty_power, faulty_power
            ),
        );
        acc.require(
            on_time_pledge == expiration_set.on_time_pledge,
            format!(
                "on-time pledge recorded {:?} doesn't match computed {:?}",
                expiration_set.on_time_pledge, on_time_pledge
            ),
        );

        acc.require(expiring_sector_count > 0, "expiration set is empty");

        all_on_time.push(expiration_set.on_time_sectors.clone());
        all_early.push(expiration_set.early_sectors.clone());

        Ok(())
    });
    acc.require_no_error(ret, "error iterating expiration queue");

    // Check that all live sectors are scheduled, and only once.
    let union_on_time = BitField::union(all_on_time.iter());
    let union_early = BitField::union(all_early.iter());
    let all_expiring = &union_on_time | &union_early;
    acc.require(
        all_expiring == *live,
        "live does not equal all expirations",
    );

    expiration_epochs
}

/// Checks the early termination queue: all queued sectors must be terminated.
/// Returns the number of queued sectors.
fn check_early_termination_queue<BS: Blockstore>(
    early_queue: BitFieldQueue<BS>,
    terminated: &BitField,
    acc: &MessageAccumulator,
) -> u64 {
    let mut seen = 0_u64;
    let mut seen_sectors = BitField::new();

    let iter_result = early_queue.amt.for_each(|epoch, bitfield| {
        let acc = acc.with_prefix(format!("early termination epoch {}: ", epoch));
        for i in bitfield.iter() {
            acc.require(!seen_sectors.get(i), format!("sector {} in early queue twice", i));
            seen_sectors.set(i);
            seen += 1;
        }
        Ok(())
    });

    acc.require_no_error(iter_result, "error iterating early termination bitfield");

    acc.require(
        terminated.contains_all(&seen_sectors),
        "terminated sectors missing early termination entries",
    );

    seen
}

pub struct DeadlineStateSummary {
    pub all_sectors: BitField,
    pub live_sectors: BitField,
    pub faulty_sectors: BitField,
    pub recovering_sectors: BitField,
    pub unproven_sectors: BitField,
    pub terminated_sectors: BitField,
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
}

/// Checks the per-mutation invariants of one deadline: partition disjointness,
/// memoized counters, the partition expiration index, and the early
/// terminations index. Accumulates any violation into `acc`.
pub fn check_deadline_state_invariants<BS: Blockstore>(
    deadline: &Deadline,
    store: &BS,
    quant: QuantSpec,
    sector_size: SectorSize,
    sectors_map: &SectorsMap,
    acc: &MessageAccumulator,
) -> DeadlineStateSummary {
    // Load linked structures.
    let partitions = match deadline.partitions_amt(store) {
        Ok(partitions) => partitions,
        Err(e) => {
            // Hard to do any other checks.
            acc.add(format!("error loading partitions: {e}"));
            return DeadlineStateSummary {
                all_sectors: BitField::new(),
                live_sectors: BitField::new(),
                faulty_sectors: BitField::new(),
                recovering_sectors: BitField::new(),
                unproven_sectors: BitField::new(),
                terminated_sectors: BitField::new(),
                live_power: PowerPair::zero(),
                active_power: PowerPair::zero(),
                faulty_power: PowerPair::zero(),
            };
        }
    };

    let mut all_sectors = BitField::new();
    let mut all_live_sectors: Vec<BitField> = Vec::new();
    let mut all_faulty_sectors: Vec<BitField> = Vec::new();
    let mut all_recovering_sectors: Vec<BitField> = Vec::new();
    let mut all_unproven_sectors: Vec<BitField> = Vec::new();
    let mut all_terminated_sectors: Vec<BitField> = Vec::new();
    let mut all_live_power = PowerPair::zero();
    let mut all_active_power = PowerPair::zero();
    let mut all_faulty_power = PowerPair::zero();

    let mut partition_count = 0;

    // Check partitions.
    let mut partitions_with_expirations: BTreeMap<ChainEpoch, Vec<u64>> = BTreeMap::new();
    let mut partitions_with_early_terminations = BitField::new();

    let ret = partitions.for_each(|index, partition| {
        // Check sequential partitions.
        if index != partition_count {
            return Err(anyhow::anyhow!(
                "Non-sequential partitions, expected index {partition_count}, found {index}"
            ));
        }
        partition_count += 1;

        let acc = acc.with_prefix(format!("partition {index}: "));
        let summary = PartitionStateSummary::check_partition_state_invariants(
            partition,
            store,
            quant,
            sector_size,
            sectors_map,
            &acc,
        );

        acc.require(
            !all_sectors.contains_any(&summary.all_sectors),
            "duplicate sector in partition",
        );

        for epoch in summary.expiration_epochs {
            partitions_with_expirations.entry(epoch).or_default().push(index);
        }

        if summary.early_termination_count > 0 {
            partitions_with_early_terminations.set(index);
        }

        all_sectors = &all_sectors | &summary.all_sectors;
        all_live_sectors.push(partition.live_sectors());
        all_faulty_sectors.push(partition.faults.clone());
        all_recovering_sectors.push(partition.recoveries.clone());
        all_unproven_sectors.push(partition.unproven.clone());
        all_terminated_sectors.push(partition.terminated.clone());
        all_live_power += &summary.live_power;
        all_active_power += &summary.active_power;
        all_faulty_power += &summary.faulty_power;

        Ok(())
    });
    acc.require_no_error(ret, "error iterating partitions");

    // Check memoized sector and power values.
    let live_sectors = BitField::union(all_live_sectors.iter());
    acc.require(
        deadline.live_sectors == live_sectors.len(),
        format!(
            "deadline live sectors {} != partitions count {}",
            deadline.live_sectors,
            live_sectors.len()
        ),
    );

    acc.require(
        deadline.total_sectors == all_sectors.len(),
        format!(
            "deadline total sectors {} != partitions count {}",
            deadline.total_sectors,
            all_sectors.len()
        ),
    );

    let faulty_sectors = BitField::union(all_faulty_sectors.iter());
    let recovering_sectors = BitField::union(all_recovering_sectors.iter());
    let unproven_sectors = BitField::union(all_unproven_sectors.iter());
    let terminated_sectors = BitField::union(all_terminated_sectors.iter());

    acc.require(
        deadline.faulty_power == all_faulty_power,
        format!(
            "deadline faulty power {:?} != partitions total {:?}",
            deadline.faulty_power, all_faulty_power
        ),
    );

    // Check the expiration queue is correctly quantized and indexes all
    // partitions with expirations.
    match BitFieldQueue::new(store, &deadline.expirations_epochs, quant) {
        Ok(expiration_queue) => {
            let mut indexed: BTreeMap<ChainEpoch, BitField> = BTreeMap::new();
            let ret = expiration_queue.amt.for_each(|epoch, partitions| {
                let epoch = epoch as ChainEpoch;
                if quant.quantize_up(epoch) != epoch {
                    return Err(anyhow::anyhow!("deadline expiration epoch {epoch} is not quantized"));
                }
                indexed.insert(epoch, partitions.clone());
                Ok(())
            });
            acc.require_no_error(ret, "error iterating deadline expiration queue");

            for (epoch, partitions) in &partitions_with_expirations {
                let entry = indexed.get(epoch);
                match entry {
                    Some(bf) => {
                        for partition in partitions {
                            acc.require(
                                bf.get(*partition),
                                format!(
                                    "expiration epoch {} missing partition {}",
                                    epoch, partition
                                ),
                            );
                        }
                    }
                    None => acc.add(format!(
                        "expiration epoch {} missing from deadline queue",
                        epoch
                    )),
                }
            }
        }
        Err(err) => acc.add(format!("error loading expiration queue: {err}")),
    };

    // Check early terminations.
    acc.require(
        deadline.early_terminations == partitions_with_early_terminations,
        "deadline early terminations doesn't match expected partitions",
    );

    DeadlineStateSummary {
        all_sectors,
        live_sectors,
        faulty_sectors,
        recovering_sectors,
        unproven_sectors,
        terminated_sectors,
        live_power: all_live_power,
        active_power: all_active_power,
        faulty_power: all_faulty_power,
    }
}
