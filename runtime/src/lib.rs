// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared support layer for the sector-accounting actors: the coded error
//! type used by every state transition, blockstore-backed collection
//! aliases, and common chain constants.

use fvm_ipld_amt::Amt;
use fvm_shared::bigint::BigInt;

pub use self::actor_error::*;
pub use self::util::*;

mod actor_error;
pub mod network;
mod util;

#[cfg(feature = "test_utils")]
pub mod test_utils;

/// Map type to be used within actors. The underlying type is an AMT.
pub type Array<'bs, V, BS> = Amt<V, &'bs BS>;

/// Deal weight
pub type DealWeight = BigInt;
