use std::collections::BTreeMap;

use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::MemoryBlockstore;
use fvm_shared::clock::ChainEpoch;

use sector_actor_miner::{
    power_for_sectors, ActorVersion, BitFieldQueue, Deadline, PartitionSectorMap, PoStPartition,
    PowerPair, SectorOnChainInfo,
};
use sector_actors_runtime::test_utils::assert_bitfield_equals;

mod util;
use util::*;

const VERSION: ActorVersion = ActorVersion::V2;

fn sectors() -> Vec<SectorOnChainInfo> {
    vec![
        test_sector(2, 1, 50, 60, 1000),
        test_sector(3, 2, 51, 61, 1001),
        test_sector(7, 3, 52, 62, 1002),
        test_sector(8, 4, 53, 63, 1003),
        test_sector(8, 5, 54, 64, 1004),
        test_sector(11, 6, 55, 65, 1005),
        test_sector(13, 7, 56, 66, 1006),
        test_sector(8, 8, 57, 67, 1007),
        test_sector(8, 9, 58, 68, 1008),
    ]
}

fn sector_power(sector_numbers: &[u64]) -> PowerPair {
    power_for_sectors(
        SECTOR_SIZE,
        &select_sectors(&sectors(), &make_bitfield(sector_numbers)),
    )
}

// Adds sectors, and proves them if requested.
//
// Partition 1: sectors 1, 2, 3, 4
// Partition 2: sectors 5, 6, 7, 8
// Partition 3: sectors 9
fn add_sectors(
    store: &MemoryBlockstore,
    deadline: &mut Deadline,
    prove: bool,
) -> Vec<SectorOnChainInfo> {
    let sectors = sectors();

    let activated_power = deadline
        .add_sectors(store, PARTITION_SIZE, false, VERSION, &sectors, SECTOR_SIZE, QUANT_SPEC)
        .expect("couldn't add sectors");

    // Unproven sectors activate no power yet.
    assert!(activated_power.is_zero());

    let deadline_state = deadline_state()
        .with_unproven(&[1, 2, 3, 4, 5, 6, 7, 8, 9])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(store, &sectors, deadline);

    // The deadline-wide expiration index points at the right quantized epochs.
    let queue = BitFieldQueue::new(store, &deadline.expirations_epochs, QUANT_SPEC).unwrap();
    let mut index = BTreeMap::<ChainEpoch, Vec<u64>>::new();
    queue
        .amt
        .for_each(|epoch, partitions| {
            index.insert(epoch as ChainEpoch, partitions.iter().collect());
            Ok(())
        })
        .unwrap();
    assert_eq!(
        BTreeMap::from([(5, vec![0]), (9, vec![0, 1, 2]), (13, vec![1])]),
        index
    );

    if !prove {
        return sectors;
    }

    let sector_array = sectors_arr(store, sectors.to_owned());

    // Prove everything
    let result = deadline
        .record_proven_sectors(
            store,
            &sector_array,
            SECTOR_SIZE,
            QUANT_SPEC,
            0,
            VERSION,
            &[
                PoStPartition { index: 0, skipped: BitField::default() },
                PoStPartition { index: 1, skipped: BitField::default() },
                PoStPartition { index: 2, skipped: BitField::default() },
            ],
        )
        .unwrap();

    assert_eq!(result.power_delta, power_for_sectors(SECTOR_SIZE, &sectors));

    let (power_delta, penalized_power) =
        deadline.process_deadline_end(store, QUANT_SPEC, 0, VERSION).unwrap();

    assert!(power_delta.is_zero());
    assert!(penalized_power.is_zero());

    deadline_state
        .with_unproven(&[])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(store, &sectors, deadline);

    sectors
}

// Adds sectors according to addSectors, then terminates them:
//
// From partition 0: sectors 1 & 3
// From partition 1: sectors 6
fn add_then_terminate(
    store: &MemoryBlockstore,
    deadline: &mut Deadline,
    prove: bool,
) -> Vec<SectorOnChainInfo> {
    let sectors = add_sectors(store, deadline, prove);
    let sector_array = sectors_arr(store, sectors.to_owned());

    let mut partition_sector_map = PartitionSectorMap::default();
    partition_sector_map.add(0, make_bitfield(&[1, 3]));
    partition_sector_map.add(1, make_bitfield(&[6]));

    let removed_power = deadline
        .terminate_sectors(store, &sector_array, 15, &partition_sector_map, SECTOR_SIZE, QUANT_SPEC)
        .unwrap();

    let (expected_power, unproven) = if prove {
        (sector_power(&[1, 3, 6]), vec![])
    } else {
        (PowerPair::zero(), vec![2, 4, 5, 7, 8, 9]) // not 1, 3, 6
    };

    assert_eq!(expected_power, removed_power);

    deadline_state()
        .with_terminations(&[1, 3, 6])
        .with_unproven(&unproven)
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(store, &sectors, deadline);

    sectors
}

// Adds and terminates sectors, then pops the early terminations.
fn add_then_terminate_then_pop_early(
    store: &MemoryBlockstore,
    deadline: &mut Deadline,
) -> Vec<SectorOnChainInfo> {
    let sectors = add_then_terminate(store, deadline, true);

    let (early_terminations, has_more) = deadline.pop_early_terminations(store, 100, 100).unwrap();

    assert!(!has_more);
    assert_eq!(2, early_terminations.partitions_processed);
    assert_eq!(3, early_terminations.sectors_processed);
    assert_eq!(1, early_terminations.sectors.len());

    assert_bitfield_equals(early_terminations.sectors.get(&15).unwrap(), &[1, 3, 6]);

    // Popping early terminations doesn't affect the terminations bitfield.
    deadline_state()
        .with_terminations(&[1, 3, 6])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(store, &sectors, deadline);

    sectors
}

#[test]
fn adds_sectors() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_sectors(&store, &mut deadline, false);
}

#[test]
fn adds_sectors_and_proves() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_sectors(&store, &mut deadline, true);
}

#[test]
fn terminates_sectors() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_terminate(&store, &mut deadline, true);
}

#[test]
fn terminates_unproven_sectors() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_terminate(&store, &mut deadline, false);
}

#[test]
fn pops_early_terminations() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_terminate_then_pop_early(&store, &mut deadline);
}

#[test]
fn bounded_early_termination_pops_match_unbounded_pop() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_terminate(&store, &mut deadline, true);

    // Pop with a budget of one sector at a time until drained; combined, the
    // results must be identical to a single unbounded call.
    let mut accumulated = Vec::<u64>::new();
    let mut rounds = 0;
    loop {
        let (result, has_more) = deadline.pop_early_terminations(&store, 100, 1).unwrap();
        for (epoch, sectors) in result.iter() {
            assert_eq!(15, epoch);
            accumulated.extend(sectors.iter());
        }
        rounds += 1;
        if !has_more {
            break;
        }
    }

    assert_eq!(vec![1, 3, 6], accumulated);
    assert!(rounds >= 3);
}

#[test]
fn removes_partitions() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    let sectors = add_then_terminate_then_pop_early(&store, &mut deadline);

    let (live, dead, removed_power) = deadline
        .remove_partitions(&store, &make_bitfield(&[0]), QUANT_SPEC)
        .expect("should have removed partitions");

    assert_bitfield_equals(&live, &[2, 4]);
    assert_bitfield_equals(&dead, &[1, 3]);

    let live_power = power_for_sectors(SECTOR_SIZE, &select_sectors(&sectors, &live));
    assert_eq!(live_power, removed_power);

    deadline_state()
        .with_terminations(&[6])
        .with_partitions(vec![make_bitfield(&[5, 6, 7, 8]), make_bitfield(&[9])])
        .assert(&store, &sectors, &deadline);
}

#[test]
fn cannot_remove_partitions_with_early_terminations() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_terminate(&store, &mut deadline, true);

    let res = deadline.remove_partitions(&store, &make_bitfield(&[0]), QUANT_SPEC);

    let err = res.expect_err("expected error, but call succeeded");
    assert!(err
        .to_string()
        .contains("cannot remove partitions from deadline with early terminations"));
}

#[test]
fn cannot_remove_missing_partition() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_terminate_then_pop_early(&store, &mut deadline);

    let res = deadline.remove_partitions(&store, &make_bitfield(&[3]), QUANT_SPEC);

    let err = res.expect_err("expected error, but call succeeded");
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn cannot_remove_partitions_with_faulty_sectors() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    let sectors = add_sectors(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors);

    // fault a sector in partition 1
    let mut partition_sector_map = PartitionSectorMap::default();
    partition_sector_map.add(1, make_bitfield(&[5]));
    deadline
        .record_faults(
            &store,
            &sector_array,
            SECTOR_SIZE,
            QUANT_SPEC,
            9,
            &partition_sector_map,
        )
        .unwrap();

    let res = deadline.remove_partitions(&store, &make_bitfield(&[1]), QUANT_SPEC);

    let err = res.expect_err("expected error, but call succeeded");
    assert!(err.to_string().contains("partition contains faults"));
}

// Marks sectors 1 (partition 0), 5 & 6 (partition 1) as faulty, expiring at
// epoch 9.
//
// Sector 5 will expire on-time at epoch 9 while 6 will expire early at epoch 9.
fn add_then_mark_faulty(
    store: &MemoryBlockstore,
    deadline: &mut Deadline,
    prove: bool,
) -> Vec<SectorOnChainInfo> {
    let sectors = add_sectors(store, deadline, prove);
    let sector_array = sectors_arr(store, sectors.to_owned());

    let mut partition_sector_map = PartitionSectorMap::default();
    partition_sector_map.add(0, make_bitfield(&[1]));
    partition_sector_map.add(1, make_bitfield(&[5, 6]));

    // mark faulty
    let power_delta = deadline
        .record_faults(
            store,
            &sector_array,
            SECTOR_SIZE,
            QUANT_SPEC,
            9,
            &partition_sector_map,
        )
        .unwrap();

    let (expected_power, unproven) = if prove {
        (sector_power(&[1, 5, 6]), vec![])
    } else {
        (PowerPair::zero(), vec![2, 3, 4, 7, 8, 9]) // not 1, 5, 6
    };

    assert_eq!(power_delta, -expected_power);

    // deadline's faulty power memo tracks the partitions' faulty power
    assert_eq!(deadline.faulty_power, sector_power(&[1, 5, 6]));

    deadline_state()
        .with_faults(&[1, 5, 6])
        .with_unproven(&unproven)
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(store, &sectors, deadline);

    sectors
}

#[test]
fn marks_faulty() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_mark_faulty(&store, &mut deadline, true);
}

#[test]
fn marks_unproven_sectors_faulty() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();
    add_then_mark_faulty(&store, &mut deadline, false);
}

#[test]
fn fault_then_terminate_removes_only_active_power() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    // Fault sectors 1, 5, 6 at epoch 9.
    let sectors = add_then_mark_faulty(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors.to_owned());

    // Terminate 1 & 3 in partition 0, 6 in partition 1, at epoch 15.
    let mut partition_sector_map = PartitionSectorMap::default();
    partition_sector_map.add(0, make_bitfield(&[1, 3]));
    partition_sector_map.add(1, make_bitfield(&[6]));

    let removed_power = deadline
        .terminate_sectors(&store, &sector_array, 15, &partition_sector_map, SECTOR_SIZE, QUANT_SPEC)
        .unwrap();

    // 1 and 6 were faulty, so the removed (active) power is that of sector 3 only.
    assert_eq!(removed_power, sector_power(&[3]));

    deadline_state()
        .with_faults(&[5])
        .with_terminations(&[1, 3, 6])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(&store, &sectors, &deadline);
}

#[test]
fn declares_faults_recovered_and_recovers_on_post() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    let sectors = add_then_mark_faulty(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors.to_owned());

    // Declare sectors 1 and 5 recovered.
    let mut partition_sector_map = PartitionSectorMap::default();
    partition_sector_map.add(0, make_bitfield(&[1]));
    partition_sector_map.add(1, make_bitfield(&[5]));
    deadline
        .declare_faults_recovered(&store, &sector_array, SECTOR_SIZE, &partition_sector_map)
        .unwrap();

    deadline_state()
        .with_faults(&[1, 5, 6])
        .with_recovering(&[1, 5])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(&store, &sectors, &deadline);

    // A proof over both partitions recovers the declared sectors.
    let result = deadline
        .record_proven_sectors(
            &store,
            &sector_array,
            SECTOR_SIZE,
            QUANT_SPEC,
            13,
            VERSION,
            &[
                PoStPartition { index: 0, skipped: BitField::default() },
                PoStPartition { index: 1, skipped: BitField::default() },
            ],
        )
        .unwrap();

    assert_eq!(result.recovered_power, sector_power(&[1, 5]));
    assert_eq!(result.power_delta, sector_power(&[1, 5]));
    assert!(result.new_faulty_power.is_zero());
    assert!(result.retracted_recovery_power.is_zero());

    deadline_state()
        .with_faults(&[6])
        .with_posts(&[0, 1])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(&store, &sectors, &deadline);
}

#[test]
fn skipped_faults_are_recorded_at_post() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    let sectors = add_sectors(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors.to_owned());

    // Prove partition 0 while skipping sector 2.
    let result = deadline
        .record_proven_sectors(
            &store,
            &sector_array,
            SECTOR_SIZE,
            QUANT_SPEC,
            13,
            VERSION,
            &[PoStPartition { index: 0, skipped: make_bitfield(&[2]) }],
        )
        .unwrap();

    assert_eq!(result.new_faulty_power, sector_power(&[2]));
    assert_eq!(result.power_delta, -sector_power(&[2]));

    deadline_state()
        .with_faults(&[2])
        .with_posts(&[0])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(&store, &sectors, &deadline);
}

#[test]
fn duplicate_proven_partitions_are_rejected() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    let sectors = add_sectors(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors);

    let res = deadline.record_proven_sectors(
        &store,
        &sector_array,
        SECTOR_SIZE,
        QUANT_SPEC,
        13,
        VERSION,
        &[
            PoStPartition { index: 0, skipped: BitField::default() },
            PoStPartition { index: 0, skipped: BitField::default() },
        ],
    );

    let err = res.expect_err("expected error, but call succeeded");
    assert!(err.to_string().contains("duplicate partitions proven"));
}

#[test]
fn proving_an_unknown_partition_is_not_found() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    let sectors = add_sectors(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors);

    let res = deadline.record_proven_sectors(
        &store,
        &sector_array,
        SECTOR_SIZE,
        QUANT_SPEC,
        13,
        VERSION,
        &[PoStPartition { index: 4, skipped: BitField::default() }],
    );

    let err = res.expect_err("expected error, but call succeeded");
    assert!(err.to_string().contains("no such partition"));
}

#[test]
fn missed_post_marks_all_unposted_partitions_faulty() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    let sectors = add_sectors(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors.to_owned());

    // Prove only partition 0.
    deadline
        .record_proven_sectors(
            &store,
            &sector_array,
            SECTOR_SIZE,
            QUANT_SPEC,
            13,
            VERSION,
            &[PoStPartition { index: 0, skipped: BitField::default() }],
        )
        .unwrap();

    let (power_delta, penalized_power) =
        deadline.process_deadline_end(&store, QUANT_SPEC, 13, VERSION).unwrap();

    // Sectors 5-9 are faulted by the missed proof.
    assert_eq!(power_delta, -sector_power(&[5, 6, 7, 8, 9]));
    assert_eq!(penalized_power, sector_power(&[5, 6, 7, 8, 9]));

    // The posted-partitions set resets at the end of the window.
    deadline_state()
        .with_faults(&[5, 6, 7, 8, 9])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(&store, &sectors, &deadline);
}

#[test]
fn pop_expired_sectors_terminates_all_due_sectors() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    let sectors = add_sectors(&store, &mut deadline, true);

    // Pop everything up to the last quantized expiration epoch.
    let expired = deadline.pop_expired_sectors(&store, 13, QUANT_SPEC).unwrap();

    assert_bitfield_equals(&expired.on_time_sectors, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert!(expired.early_sectors.is_empty());
    assert_eq!(expired.active_power, power_for_sectors(SECTOR_SIZE, &sectors));
    assert!(expired.faulty_power.is_zero());

    assert_eq!(deadline.live_sectors, 0);
    assert_eq!(deadline.total_sectors, 9);

    deadline_state()
        .with_terminations(&[1, 2, 3, 4, 5, 6, 7, 8, 9])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(&store, &sectors, &deadline);

    // On-time expirations do not queue early terminations.
    let (result, has_more) = deadline.pop_early_terminations(&store, 100, 100).unwrap();
    assert!(result.is_empty());
    assert!(!has_more);
}

#[test]
fn pop_expired_sectors_queues_early_terminations_for_faults() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    // Sector 6 (expiring at 13) is faulted with expiration 9 and so expires early.
    let sectors = add_then_mark_faulty(&store, &mut deadline, true);

    let expired = deadline.pop_expired_sectors(&store, 9, QUANT_SPEC).unwrap();

    assert_bitfield_equals(&expired.on_time_sectors, &[1, 2, 3, 4, 5, 8, 9]);
    assert_bitfield_equals(&expired.early_sectors, &[6]);

    // Faulty power expired: 1 and 5 on-time but faulty, 6 early.
    assert_eq!(expired.faulty_power, sector_power(&[1, 5, 6]));
    assert_eq!(expired.active_power, sector_power(&[2, 3, 4, 8, 9]));

    // The early termination is queued for penalty processing.
    let (result, has_more) = deadline.pop_early_terminations(&store, 100, 100).unwrap();
    assert!(!has_more);
    assert_eq!(1, result.sectors_processed);
    assert_bitfield_equals(result.sectors.get(&9).unwrap(), &[6]);

    deadline_state()
        .with_terminations(&[1, 2, 3, 4, 5, 6, 8, 9])
        .with_partitions(vec![
            make_bitfield(&[1, 2, 3, 4]),
            make_bitfield(&[5, 6, 7, 8]),
            make_bitfield(&[9]),
        ])
        .assert(&store, &sectors, &deadline);
}

#[test]
fn reschedules_sector_expirations_skipping_missing_partitions() {
    let store = MemoryBlockstore::new();
    let mut deadline = Deadline::new(&store).unwrap();

    let sectors = add_sectors(&store, &mut deadline, true);
    let sector_array = sectors_arr(&store, sectors.to_owned());

    let mut partition_sector_map = PartitionSectorMap::default();
    partition_sector_map.add(0, make_bitfield(&[2, 4]));
    // Partition 5 doesn't exist and is skipped without error.
    partition_sector_map.add(5, make_bitfield(&[99]));

    let replaced = deadline
        .reschedule_sector_expirations(
            &store,
            &sector_array,
            2,
            &partition_sector_map,
            SECTOR_SIZE,
            QUANT_SPEC,
        )
        .unwrap();

    let replaced_numbers: Vec<u64> = replaced.iter().map(|s| s.sector_number).collect();
    assert_eq!(vec![2, 4], replaced_numbers);

    // Both rescheduled sectors are now due at the quantized epoch 5.
    let expired = deadline.pop_expired_sectors(&store, 5, QUANT_SPEC).unwrap();
    assert_bitfield_equals(&expired.on_time_sectors, &[1, 2, 4]);
}
