#![allow(dead_code)]

use std::collections::BTreeMap;

use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::{Blockstore, MemoryBlockstore};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorSize;

use sector_actor_miner::testing::{
    check_deadline_state_invariants, sectors_as_map, DeadlineStateSummary, PartitionStateSummary,
};
use sector_actor_miner::{
    BitFieldQueue, Deadline, ExpirationQueue, Partition, QuantSpec, SectorOnChainInfo, Sectors,
};
use sector_actors_runtime::test_utils::{assert_bitfield_equals, make_sealed_cid};
use sector_actors_runtime::{DealWeight, MessageAccumulator};

pub const SECTOR_SIZE: SectorSize = SectorSize::_32GiB;
pub const QUANT_SPEC: QuantSpec = QuantSpec { unit: 4, offset: 1 };
pub const PARTITION_SIZE: u64 = 4;

pub fn test_sector(
    expiration: ChainEpoch,
    sector_number: u64,
    deal_weight: u64,
    verified_deal_weight: u64,
    pledge: u64,
) -> SectorOnChainInfo {
    SectorOnChainInfo {
        expiration,
        sector_number,
        deal_weight: DealWeight::from(deal_weight),
        verified_deal_weight: DealWeight::from(verified_deal_weight),
        initial_pledge: TokenAmount::from_atto(pledge),
        sealed_cid: make_sealed_cid(format!("commR-{}", sector_number).as_bytes()),
        ..Default::default()
    }
}

pub fn sectors_arr<'a>(
    store: &'a MemoryBlockstore,
    sectors_info: Vec<SectorOnChainInfo>,
) -> Sectors<'a, MemoryBlockstore> {
    let mut sectors = Sectors::empty(store).unwrap();
    sectors.store(sectors_info).unwrap();
    sectors
}

pub fn make_bitfield(bits: &[u64]) -> BitField {
    let mut bf = BitField::new();
    for b in bits {
        bf.set(*b);
    }
    bf
}

pub fn select_sectors(sectors: &[SectorOnChainInfo], field: &BitField) -> Vec<SectorOnChainInfo> {
    sector_actor_miner::select_sectors(sectors, field).unwrap()
}

pub fn require_no_expiration_groups_before(
    epoch: ChainEpoch,
    queue: &mut ExpirationQueue<'_, MemoryBlockstore>,
) {
    queue.amt.flush().unwrap();

    let set = queue.pop_until(epoch - 1).unwrap();
    assert!(set.is_empty());
}

/// Checks that a bitfield queue has exactly the given entries.
#[derive(Default)]
pub struct BitFieldQueueExpectation {
    pub expected: BTreeMap<ChainEpoch, Vec<u64>>,
}

impl BitFieldQueueExpectation {
    pub fn add(mut self, epoch: ChainEpoch, values: &[u64]) -> Self {
        self.expected.insert(epoch, values.to_vec());
        self
    }

    pub fn equals<BS: Blockstore>(&self, queue: &BitFieldQueue<'_, BS>) {
        // ensure cached changes are ready to read
        let length = queue.amt.count();
        assert_eq!(self.expected.len() as u64, length);

        queue
            .amt
            .for_each(|epoch, bitfield| {
                let values = self
                    .expected
                    .get(&(epoch as ChainEpoch))
                    .unwrap_or_else(|| panic!("unexpected entry at epoch {}", epoch));

                assert_bitfield_equals(bitfield, values);
                Ok(())
            })
            .unwrap();
    }
}

#[allow(clippy::too_many_arguments)]
pub fn assert_partition_state(
    store: &MemoryBlockstore,
    partition: &Partition,
    quant: QuantSpec,
    sector_size: SectorSize,
    sectors: &[SectorOnChainInfo],
    all_sector_ids: BitField,
    faults: BitField,
    recovering: BitField,
    terminations: BitField,
    unproven: BitField,
) {
    assert_eq!(faults, partition.faults);
    assert_eq!(recovering, partition.recoveries);
    assert_eq!(terminations, partition.terminated);
    assert_eq!(unproven, partition.unproven);
    assert_eq!(all_sector_ids, partition.sectors);

    let acc = MessageAccumulator::default();
    let _ = PartitionStateSummary::check_partition_state_invariants(
        partition,
        store,
        quant,
        sector_size,
        &sectors_as_map(sectors),
        &acc,
    );

    acc.assert_empty();
}

pub struct ExpectExpirationGroup {
    pub expiration: ChainEpoch,
    pub sectors: BitField,
}

pub fn assert_partition_expiration_queue(
    store: &MemoryBlockstore,
    partition: &Partition,
    quant: QuantSpec,
    groups: &[ExpectExpirationGroup],
) {
    let mut queue = ExpirationQueue::new(store, &partition.expirations_epochs, quant).unwrap();

    for group in groups {
        require_no_expiration_groups_before(group.expiration, &mut queue);
        let set = queue.pop_until(group.expiration).unwrap();

        // We only care whether the sectors are in the queue or not.
        // ExpirationQueue tests can deal with early or on time.
        let all_sectors = &set.on_time_sectors | &set.early_sectors;
        assert_eq!(group.sectors, all_sectors);
    }
}

/// Builder-style expectation for a deadline's state, checked together with
/// the full deadline invariants.
pub struct ExpectedDeadlineState {
    pub quant: QuantSpec,
    pub sector_size: SectorSize,
    pub partition_size: u64,
    pub sectors: Vec<SectorOnChainInfo>,
    pub faults: BitField,
    pub recovering: BitField,
    pub terminations: BitField,
    pub unproven: BitField,
    pub posts: BitField,
    pub partition_sectors: Vec<BitField>,
}

pub fn deadline_state() -> ExpectedDeadlineState {
    ExpectedDeadlineState {
        quant: QUANT_SPEC,
        sector_size: SECTOR_SIZE,
        partition_size: PARTITION_SIZE,
        sectors: Vec::new(),
        faults: BitField::new(),
        recovering: BitField::new(),
        terminations: BitField::new(),
        unproven: BitField::new(),
        posts: BitField::new(),
        partition_sectors: Vec::new(),
    }
}

impl ExpectedDeadlineState {
    pub fn with_faults(mut self, faults: &[u64]) -> Self {
        self.faults = make_bitfield(faults);
        self
    }

    pub fn with_recovering(mut self, recovering: &[u64]) -> Self {
        self.recovering = make_bitfield(recovering);
        self
    }

    pub fn with_terminations(mut self, terminations: &[u64]) -> Self {
        self.terminations = make_bitfield(terminations);
        self
    }

    pub fn with_unproven(mut self, unproven: &[u64]) -> Self {
        self.unproven = make_bitfield(unproven);
        self
    }

    pub fn with_posts(mut self, posts: &[u64]) -> Self {
        self.posts = make_bitfield(posts);
        self
    }

    pub fn with_partitions(mut self, partitions: Vec<BitField>) -> Self {
        self.partition_sectors = partitions;
        self
    }

    /// Assert that the deadline's state matches the expected state.
    pub fn assert(
        self,
        store: &MemoryBlockstore,
        sectors: &[SectorOnChainInfo],
        deadline: &Deadline,
    ) -> Self {
        let summary = self.check_deadline_invariants(store, sectors, deadline);

        assert_eq!(self.faults, summary.faulty_sectors);
        assert_eq!(self.recovering, summary.recovering_sectors);
        assert_eq!(self.terminations, summary.terminated_sectors);
        assert_eq!(self.unproven, summary.unproven_sectors);
        assert_eq!(self.posts, deadline.partitions_posted);

        let partitions = deadline.partitions_amt(store).unwrap();
        assert_eq!(self.partition_sectors.len() as u64, partitions.count());

        for (i, partition_sectors) in self.partition_sectors.iter().enumerate() {
            let partition = partitions.get(i as u64).unwrap().unwrap();
            assert_eq!(partition_sectors, &partition.sectors);
        }

        self
    }

    fn check_deadline_invariants(
        &self,
        store: &MemoryBlockstore,
        sectors: &[SectorOnChainInfo],
        deadline: &Deadline,
    ) -> DeadlineStateSummary {
        let acc = MessageAccumulator::default();
        let summary = check_deadline_state_invariants(
            deadline,
            store,
            self.quant,
            self.sector_size,
            &sectors_as_map(sectors),
            &acc,
        );

        acc.assert_empty();

        summary
    }
}
