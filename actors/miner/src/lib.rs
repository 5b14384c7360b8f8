// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage-sector lifecycle and power accounting state for a mining actor.
//!
//! This crate tracks committed sectors through proof, fault, recovery and
//! termination, batched into quantized epoch buckets:
//!
//! * [`BitFieldQueue`] — epoch-bucketed queue of sector (or partition) numbers.
//! * [`ExpirationQueue`] — epoch-bucketed aggregates of expiring sectors with
//!   their power and pledge, one per partition.
//! * [`Partition`] — a bounded group of sectors with fault/recovery/unproven
//!   state and memoized power.
//! * [`Deadline`] — the partitions proven in one window, with deadline-wide
//!   expiration and early-termination indexes.
//! * [`VestingFunds`] — the epoch-bucketed collateral-unlock ledger.
//!
//! All persistent collections live in an injected blockstore; the enclosing
//! actor-method handlers are responsible for transactionality and for
//! discarding mutations of failed transitions.

pub use bitfield_queue::*;
pub use deadline_state::*;
pub use expiration_queue::*;
pub use partition_state::*;
pub use policy::*;
pub use quantize::*;
pub use sector_map::*;
pub use sectors::*;
pub use termination::*;
pub use types::*;
pub use vesting_state::*;

mod bitfield_queue;
mod deadline_state;
mod expiration_queue;
mod partition_state;
mod policy;
mod quantize;
mod sector_map;
mod sectors;
mod termination;
pub mod testing;
mod types;
mod vesting_state;
