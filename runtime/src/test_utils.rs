// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_shared::commcid::{FIL_COMMITMENT_SEALED, FIL_COMMITMENT_UNSEALED};
use multihash::{Code, MultihashDigest};

pub fn make_cid(input: &[u8], prefix: u64) -> Cid {
    let hash = Code::Blake2b256.digest(input);
    Cid::new_v1(prefix, hash)
}

pub fn make_piece_cid(input: &[u8]) -> Cid {
    make_cid(input, FIL_COMMITMENT_UNSEALED)
}

pub fn make_sealed_cid(input: &[u8]) -> Cid {
    make_cid(input, FIL_COMMITMENT_SEALED)
}

pub fn bitfield_from_slice(bits: &[u64]) -> BitField {
    let mut bf = BitField::new();
    for b in bits {
        bf.set(*b);
    }
    bf
}

pub fn assert_bitfield_equals(bf: &BitField, bits: &[u64]) {
    let actual: Vec<u64> = bf.iter().collect();
    assert_eq!(actual, bits);
}
