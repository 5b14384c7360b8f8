// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::iter;

use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use itertools::{EitherOrBoth, Itertools};
use num_traits::Zero;

use crate::policy::VestSpec;
use crate::quantize::QuantSpec;

/// Represents funds that will vest at the given epoch.
#[derive(Debug, Serialize_tuple, Deserialize_tuple, Clone, PartialEq, Eq)]
pub struct VestingFund {
    pub epoch: ChainEpoch,
    pub amount: TokenAmount,
}

/// Represents the vesting table state for the miner. It is a sorted list of
/// (epoch, amount) buckets; the caller stores it as its own block.
/// An empty table may be dropped entirely.
#[derive(Default, Debug, Serialize_tuple, Deserialize_tuple, Clone, PartialEq, Eq)]
pub struct VestingFunds {
    /// Unlocked funds, in order of epoch.
    pub funds: Vec<VestingFund>,
}

impl VestingFunds {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.funds.is_empty()
    }

    /// Sum of locked collateral remaining in the table.
    pub fn total(&self) -> TokenAmount {
        self.funds.iter().map(|f| &f.amount).sum()
    }

    /// Removes and returns all funds that have fully vested before the given epoch.
    pub fn unlock_vested_funds(&mut self, current_epoch: ChainEpoch) -> TokenAmount {
        // The funds are in order of epoch, so we can search for the first
        // bucket whose epoch has not yet passed.
        let i = self.funds.iter().position(|fund| fund.epoch >= current_epoch).unwrap_or(
            // everything has vested
            self.funds.len(),
        );

        self.funds.drain(..i).map(|fund| fund.amount).sum()
    }

    /// Adds locked funds, vesting over the schedule described by the spec.
    /// Each vesting step epoch is quantized to the proving-period grid, and
    /// steps merge into any bucket already scheduled at the same epoch.
    pub fn add_locked_funds(
        &mut self,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        proving_period_start: ChainEpoch,
        spec: &VestSpec,
    ) {
        // Nothing unlocks here, this is just the start of the clock.
        let vest_begin = current_epoch + spec.initial_delay;
        let quant = QuantSpec { unit: spec.quantization, offset: proving_period_start };

        let mut vested_so_far = TokenAmount::zero();
        let mut epoch = vest_begin;

        // The iterator for the new vesting schedule to be "joined" with the
        // current one. Quantization can land several steps on one epoch; all
        // but the first contribute nothing and are skipped, so emitted epochs
        // strictly increase.
        let new_funds = iter::from_fn(|| {
            while vested_so_far < *vesting_sum {
                epoch += spec.step_duration;

                let vest_epoch = quant.quantize_up(epoch);

                let elapsed = vest_epoch - vest_begin;
                let target_vest = if elapsed < spec.vest_period {
                    // Linear vesting
                    (vesting_sum * elapsed).div_floor(spec.vest_period)
                } else {
                    vesting_sum.clone()
                };

                let vest_this_time = &target_vest - &vested_so_far;
                vested_so_far = target_vest;

                if vest_this_time.is_zero() {
                    continue;
                }

                return Some(VestingFund { epoch: vest_epoch, amount: vest_this_time });
            }
            None
        });

        // Take the old funds array and replace it with a new one, merging
        // buckets landing on the same epoch. Remains sorted by epoch.
        let old_funds = std::mem::take(&mut self.funds);
        self.funds = old_funds
            .into_iter()
            .merge_join_by(new_funds, |a, b| a.epoch.cmp(&b.epoch))
            .map(|item| match item {
                EitherOrBoth::Left(a) => a,
                EitherOrBoth::Right(b) => b,
                EitherOrBoth::Both(a, b) => {
                    VestingFund { epoch: a.epoch, amount: a.amount + b.amount }
                }
            })
            .collect();
    }

    /// Unlocks locked funds that have *not yet vested*, up to the target
    /// amount, preferring the buckets that would vest soonest. Buckets that
    /// have already vested (epoch < current epoch) are untouched. Returns the
    /// amount actually unlocked, at most the target.
    pub fn unlock_unvested_funds(
        &mut self,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> TokenAmount {
        let mut amount_unlocked = TokenAmount::zero();
        let mut last_index_to_remove = None;
        let mut start_index_for_remove = 0;

        for (i, fund) in self.funds.iter_mut().enumerate() {
            if &amount_unlocked >= target {
                break;
            }

            if fund.epoch >= current_epoch {
                let unlock_amount =
                    std::cmp::min(target - &amount_unlocked, fund.amount.clone());
                amount_unlocked += &unlock_amount;
                let new_amount = &fund.amount - &unlock_amount;

                if new_amount.is_zero() {
                    last_index_to_remove = Some(i);
                } else {
                    fund.amount = new_amount;
                }
            } else {
                start_index_for_remove = i + 1;
            }
        }

        // Remove fully drained buckets, preserving any untouched vested
        // buckets before them and any partially drained bucket after them.
        if let Some(last_index_to_remove) = last_index_to_remove {
            self.funds.drain(start_index_for_remove..=last_index_to_remove);
        }

        amount_unlocked
    }
}
