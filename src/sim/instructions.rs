use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

/// Lateral navigation command of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Lnav {
    /// Keep whatever heading the aircraft is already on.
    PresentHeading,
    /// Fly a specific heading in degrees.
    Heading(f64),
    /// Proceed direct to a point.
    Direct(Coordinate),
}

/// Altitude restriction in feet MSL. An empty range restricts nothing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AltitudeRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AltitudeRange {
    pub fn between(min: f64, max: f64) -> AltitudeRange {
        AltitudeRange {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn is_compliant(&self, altitude: f64) -> bool {
        self.min.is_none_or(|min| altitude >= min) && self.max.is_none_or(|max| altitude <= max)
    }
}

/// Speed restriction in knots. An empty range restricts nothing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

impl SpeedRange {
    pub fn between(min: u32, max: u32) -> SpeedRange {
        SpeedRange {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn is_compliant(&self, speed: u32) -> bool {
        self.min.is_none_or(|min| speed >= min) && self.max.is_none_or(|max| speed <= max)
    }
}

/// When the planner considers an instruction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Finished once the aircraft passes abeam the direct endpoint.
    Crossing,
    /// Finished once the altitude restriction is satisfied.
    Altitude,
    /// Never finishes on its own.
    Forever,
}

/// One queued element of an aircraft's route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub lnav: Lnav,
    pub altitude: AltitudeRange,
    pub speed: SpeedRange,
    pub termination: Termination,
}

impl Instruction {
    /// `Crossing` only makes sense against a direct endpoint; any other
    /// combination degrades to `Forever`.
    pub fn effective_termination(&self) -> Termination {
        match (self.termination, self.lnav) {
            (Termination::Crossing, Lnav::Direct(_)) => Termination::Crossing,
            (Termination::Crossing, _) => Termination::Forever,
            (other, _) => other,
        }
    }
}
