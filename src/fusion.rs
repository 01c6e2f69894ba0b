//! Fusion of vehicle crops with plate recognition results.
//!
//! Every crop carries the vehicle it was cut from, so recognizer output for
//! crop `i` is attached to that crop's vehicle and never to a vehicle looked up
//! by position in some other list. When several plates are read for one
//! vehicle the [`TieBreak`] strategy decides which one is kept.

use crate::{
    api::{FusedVehicleRecord, PlateCandidate, PlateRecord, VehicleId},
    region::VehicleCrop,
};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Every new candidate replaces the stored one.
    LastWins,
    /// A candidate replaces the stored one only with a strictly higher detection confidence.
    #[default]
    HighestConfidence,
}

impl TieBreak {
    /// Picks which of the stored and the incoming candidate survives. Confidences
    /// compare at the two decimals they are reported with.
    pub fn resolve(self, current: PlateCandidate, candidate: PlateCandidate) -> PlateCandidate {
        match self {
            TieBreak::LastWins => candidate,
            TieBreak::HighestConfidence => {
                match (current.detection_confidence, candidate.detection_confidence) {
                    (_, None) => current,
                    (None, Some(_)) => candidate,
                    (Some(stored), Some(new)) if new > stored => candidate,
                    _ => current,
                }
            }
        }
    }
}

impl std::fmt::Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TieBreak::LastWins => write!(f, "last-wins"),
            TieBreak::HighestConfidence => write!(f, "highest-confidence"),
        }
    }
}

/// Vehicle id to the single plate kept for it.
#[derive(Debug, Default)]
pub struct AssociationTable {
    tie_break: TieBreak,
    plates: HashMap<VehicleId, PlateCandidate>,
}

impl AssociationTable {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            tie_break,
            plates: HashMap::new(),
        }
    }

    pub fn offer(&mut self, vehicle_id: VehicleId, candidate: PlateCandidate) {
        let kept = match self.plates.remove(&vehicle_id) {
            Some(current) => self.tie_break.resolve(current, candidate),
            None => candidate,
        };
        self.plates.insert(vehicle_id, kept);
    }

    pub fn merge<I>(&mut self, vehicle_id: VehicleId, candidates: I)
    where
        I: IntoIterator<Item = PlateCandidate>,
    {
        for candidate in candidates {
            self.offer(vehicle_id, candidate);
        }
    }

    pub fn get(&self, vehicle_id: VehicleId) -> Option<&PlateCandidate> {
        self.plates.get(&vehicle_id)
    }

}

/// Builds one record per crop, in crop order. `candidates` must hold one list per crop.
pub fn fuse_vehicles(
    crops: &[VehicleCrop],
    candidates: Vec<Vec<PlateCandidate>>,
    tie_break: TieBreak,
) -> anyhow::Result<Vec<FusedVehicleRecord>> {
    if crops.len() != candidates.len() {
        bail!(
            "Recognizer returned {} results for {} vehicle crops",
            candidates.len(),
            crops.len()
        );
    }

    let mut table = AssociationTable::new(tie_break);
    for (crop, plates) in crops.iter().zip(candidates) {
        table.merge(crop.vehicle_id(), plates);
    }

    Ok(crops
        .iter()
        .map(|crop| FusedVehicleRecord::new(&crop.vehicle, table.get(crop.vehicle_id())))
        .collect())
}

/// True when no vehicle ended up with readable plate text.
pub fn needs_fallback(records: &[FusedVehicleRecord]) -> bool {
    !records.iter().any(FusedVehicleRecord::has_plate_text)
}

/// Flattens whole-image recognizer output into plate-only records.
pub fn plate_records(
    candidates: Vec<Vec<PlateCandidate>>,
    drop_unread: bool,
) -> Vec<PlateRecord> {
    candidates
        .into_iter()
        .flatten()
        .filter(|plate| !drop_unread || (plate.detection_confidence.is_some() && plate.has_text()))
        .map(PlateRecord::from)
        .collect()
}
