// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::bigint::bigint_ser;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{PoStProof, RegisteredSealProof, SectorNumber, StoragePower};
use num_derive::FromPrimitive;
use num_traits::Zero;

use sector_actors_runtime::DealWeight;

/// The version of the state schema and state-transition rules in force for one
/// actor instance. Chosen once when the state is instantiated and consulted by
/// the shared algorithms; later versions add unproven-sector tracking (V2) and
/// windowed-PoSt dispute snapshots (V3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
pub enum ActorVersion {
    V0 = 0,
    V2 = 2,
    V3 = 3,
}

impl ActorVersion {
    /// Sectors committed at V2 or later remain unproven, with no power, until
    /// the first window proof that covers them.
    pub fn supports_unproven_sectors(self) -> bool {
        self >= ActorVersion::V2
    }

    /// V3 deadlines keep a snapshot of partitions and optimistically accepted
    /// proofs from the previous challenge window for later dispute.
    pub fn keeps_post_snapshots(self) -> bool {
        self >= ActorVersion::V3
    }
}

/// Value type for quantities of power (raw and QA).
#[derive(Serialize_tuple, Deserialize_tuple, Default, Debug, Clone, PartialEq, Eq)]
pub struct PowerPair {
    #[serde(with = "bigint_ser")]
    pub raw: StoragePower,
    #[serde(with = "bigint_ser")]
    pub qa: StoragePower,
}

impl PowerPair {
    pub fn new(raw: StoragePower, qa: StoragePower) -> Self {
        Self { raw, qa }
    }

    pub fn zero() -> Self {
        Default::default()
    }

    pub fn is_zero(&self) -> bool {
        self.raw.is_zero() && self.qa.is_zero()
    }
}

impl Add for &PowerPair {
    type Output = PowerPair;

    fn add(self, rhs: Self) -> PowerPair {
        PowerPair { raw: &self.raw + &rhs.raw, qa: &self.qa + &rhs.qa }
    }
}

impl Add for PowerPair {
    type Output = PowerPair;

    fn add(self, rhs: Self) -> PowerPair {
        &self + &rhs
    }
}

impl AddAssign<&Self> for PowerPair {
    fn add_assign(&mut self, rhs: &Self) {
        *self = &*self + rhs;
    }
}

impl AddAssign for PowerPair {
    fn add_assign(&mut self, rhs: Self) {
        *self += &rhs;
    }
}

impl Sub for &PowerPair {
    type Output = PowerPair;

    fn sub(self, rhs: Self) -> PowerPair {
        PowerPair { raw: &self.raw - &rhs.raw, qa: &self.qa - &rhs.qa }
    }
}

impl Sub for PowerPair {
    type Output = PowerPair;

    fn sub(self, rhs: Self) -> PowerPair {
        &self - &rhs
    }
}

impl SubAssign<&Self> for PowerPair {
    fn sub_assign(&mut self, rhs: &Self) {
        *self = &*self - rhs;
    }
}

impl SubAssign for PowerPair {
    fn sub_assign(&mut self, rhs: Self) {
        *self -= &rhs;
    }
}

impl Neg for PowerPair {
    type Output = PowerPair;

    fn neg(self) -> PowerPair {
        PowerPair { raw: -self.raw, qa: -self.qa }
    }
}

impl Neg for &PowerPair {
    type Output = PowerPair;

    fn neg(self) -> PowerPair {
        -self.clone()
    }
}

/// Information stored on-chain for a proven sector. Immutable once committed;
/// held in the external sector store and only ever referenced by number from
/// partitions and deadlines.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct SectorOnChainInfo {
    pub sector_number: SectorNumber,
    /// The seal proof type implies the PoSt proofs
    pub seal_proof: RegisteredSealProof,
    /// CommR
    pub sealed_cid: Cid,
    pub deal_ids: Vec<DealID>,
    /// Epoch during which the sector proof was accepted
    pub activation: ChainEpoch,
    /// Epoch during which the sector expires
    pub expiration: ChainEpoch,
    /// Integral of active deals over sector lifetime
    #[serde(with = "bigint_ser")]
    pub deal_weight: DealWeight,
    /// Integral of active verified deals over sector lifetime
    #[serde(with = "bigint_ser")]
    pub verified_deal_weight: DealWeight,
    /// Pledge collected to commit this sector
    pub initial_pledge: TokenAmount,
    /// Expected one day projection of reward for sector computed at activation time
    pub expected_day_reward: TokenAmount,
    /// Expected twenty day projection of reward for sector computed at activation time
    pub expected_storage_pledge: TokenAmount,
    /// The original SealedSectorCID, only gets set on the first ReplicaUpdate
    pub sector_key_cid: Option<Cid>,
}

/// Identifies a partition, and the sectors skipped while proving it, in a
/// window proof submission.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PoStPartition {
    /// Partitions are numbered per-deadline, from zero.
    pub index: u64,
    /// Sectors skipped while proving that weren't already declared faulty.
    pub skipped: BitField,
}

/// A windowed proof accepted optimistically, kept so it can be disputed until
/// the end of the next challenge window.
#[derive(Debug, Default, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct WindowedPoSt {
    /// Partitions proved by this proof.
    pub partitions: BitField,
    /// Array of proofs, one per distinct registered proof type present in the
    /// sectors being proven. In the usual case of a single proof type, this
    /// array will always have a single element (independent of number of
    /// partitions).
    pub proofs: Vec<PoStProof>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(raw: i64, qa: i64) -> PowerPair {
        PowerPair { raw: StoragePower::from(raw), qa: StoragePower::from(qa) }
    }

    #[test]
    fn power_pair_arithmetic() {
        let a = pair(10, 20);
        let b = pair(3, 4);
        assert_eq!(pair(13, 24), &a + &b);
        assert_eq!(pair(7, 16), &a - &b);
        assert_eq!(pair(-10, -20), -a.clone());
        assert!(PowerPair::zero().is_zero());
        assert!(!(a - b).is_zero());
    }

    #[test]
    fn version_gates() {
        assert!(!ActorVersion::V0.supports_unproven_sectors());
        assert!(ActorVersion::V2.supports_unproven_sectors());
        assert!(ActorVersion::V3.supports_unproven_sectors());
        assert!(!ActorVersion::V2.keeps_post_snapshots());
        assert!(ActorVersion::V3.keeps_post_snapshots());
    }
}
