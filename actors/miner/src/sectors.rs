// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeSet;

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::{SectorNumber, MAX_SECTOR_NUMBER};

use sector_actors_runtime::{actor_error, ActorError, Array, AsActorError};

use crate::types::SectorOnChainInfo;

pub const SECTORS_AMT_BITWIDTH: u32 = 5;

/// Wrapper for the sector store: an AMT of `SectorOnChainInfo` keyed by sector
/// number. Partitions and deadlines reference sectors by number only and load
/// the metadata through this store.
pub struct Sectors<'db, BS> {
    pub amt: Array<'db, SectorOnChainInfo, BS>,
}

impl<'db, BS: Blockstore> Sectors<'db, BS> {
    pub fn load(store: &'db BS, root: &Cid) -> Result<Self, ActorError> {
        Ok(Self {
            amt: Array::load(root, store)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")?,
        })
    }

    pub fn empty(store: &'db BS) -> Result<Self, ActorError> {
        Ok(Self { amt: Array::new_with_bit_width(store, SECTORS_AMT_BITWIDTH) })
    }

    pub fn load_sector(
        &self,
        sector_numbers: &BitField,
    ) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        let mut sector_infos = Vec::with_capacity(sector_numbers.len() as usize);
        for sector_number in sector_numbers.iter() {
            let sector_on_chain = self
                .amt
                .get(sector_number)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load sector")?
                .cloned()
                .ok_or_else(|| actor_error!(not_found; "sector not found: {}", sector_number))?;
            sector_infos.push(sector_on_chain);
        }
        Ok(sector_infos)
    }

    pub fn get(
        &self,
        sector_number: SectorNumber,
    ) -> Result<Option<SectorOnChainInfo>, ActorError> {
        Ok(self
            .amt
            .get(sector_number)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to get sector {}", sector_number)
            })?
            .cloned())
    }

    pub fn must_get(&self, sector_number: SectorNumber) -> Result<SectorOnChainInfo, ActorError> {
        self.get(sector_number)?
            .ok_or_else(|| actor_error!(not_found; "sector {} not found", sector_number))
    }

    pub fn store(&mut self, infos: Vec<SectorOnChainInfo>) -> Result<(), ActorError> {
        for info in infos {
            let sector_number = info.sector_number;

            if sector_number > MAX_SECTOR_NUMBER {
                return Err(
                    actor_error!(illegal_argument; "sector number {} out of range", sector_number),
                );
            }

            self.amt.set(sector_number, info).with_context_code(
                ExitCode::USR_ILLEGAL_STATE,
                || format!("failed to store sector {}", sector_number),
            )?;
        }

        Ok(())
    }
}

/// Selects from an (in-memory) slice of sector infos exactly the sectors named
/// by the bitfield. All named sectors must be present in the slice.
pub fn select_sectors(
    sectors: &[SectorOnChainInfo],
    field: &BitField,
) -> Result<Vec<SectorOnChainInfo>, ActorError> {
    let mut to_include: BTreeSet<_> = field.iter().collect();
    let included: Vec<_> =
        sectors.iter().filter(|s| to_include.remove(&s.sector_number)).cloned().collect();

    if !to_include.is_empty() {
        return Err(actor_error!(
            illegal_state;
            "failed to find {} expected sectors",
            to_include.len()
        ));
    }

    Ok(included)
}
