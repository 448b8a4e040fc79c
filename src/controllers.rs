use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

/// Position type a controller is working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FacilityType {
    /// Clearance delivery
    Del,
    /// Ground
    Gnd,
    /// Tower
    Twr,
    /// Approach
    App,
    /// Departure
    Dep,
    /// Centre
    Ctr,
    /// Flight service station
    Fss,
}

impl FacilityType {
    pub fn suffix(&self) -> &'static str {
        match self {
            FacilityType::Del => "DEL",
            FacilityType::Gnd => "GND",
            FacilityType::Twr => "TWR",
            FacilityType::App => "APP",
            FacilityType::Dep => "DEP",
            FacilityType::Ctr => "CTR",
            FacilityType::Fss => "FSS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerMetadata {
    /// Facility identifier, e.g. `LAX` or `SCT`.
    pub facility: String,
    pub facility_type: FacilityType,
    /// Optional position discriminator, e.g. `N` in `LAX_N_TWR`.
    pub discriminator: Option<String>,
}

impl ControllerMetadata {
    /// Derived callsign: `facility[_discriminator]_type`.
    pub fn callsign(&self) -> String {
        match &self.discriminator {
            Some(d) => format!("{}_{}_{}", self.facility, d, self.facility_type.suffix()),
            None => format!("{}_{}", self.facility, self.facility_type.suffix()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Radar heads feeding this position's scope.
    pub radar_antennae: Vec<Coordinate>,
}

/// One connected controller as the authoritative store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    /// Instant this controller last announced itself.
    pub time: DateTime<Utc>,
    pub metadata: ControllerMetadata,
    pub state: ControllerState,
}
