use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::{Coordinate, normalize_heading};

/// Flight rules filed on an aircraft's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlightRules {
    Vfr,
    Ifr,
    /// IFR plan with a VFR segment
    Y,
    /// VFR plan with an IFR segment
    Z,
}

/// Transponder operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SquawkMode {
    Standby,
    On,
    Altitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Squawk {
    pub code: u16,
    pub mode: SquawkMode,
}

/// Filed plan and identity data; changes rarely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AircraftMetadata {
    pub callsign: String,
    pub origin: String,
    pub destination: String,
    pub rules: FlightRules,
    pub aircraft_type: String,
    pub route: String,
    pub remarks: String,
}

/// Instantaneous situation of the aircraft.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AircraftState {
    /// True heading, always normalised into `[0, 360)`.
    pub heading: f64,
    pub altitude: f64,
    pub position: Coordinate,
    pub squawk: Squawk,
}

/// Rates of change applied when extrapolating the state forward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AircraftMotion {
    /// Ground speed in knots.
    pub speed: u32,
    /// Vertical rate in feet, applied per elapsed second.
    pub climb_rate: i32,
    /// Turn rate magnitude in degrees per second; zero flies straight.
    pub turn_rate: f32,
    pub clockwise: bool,
}

impl AircraftMotion {
    /// Turn rate with the turn direction folded in (clockwise positive).
    pub fn signed_turn_rate(&self) -> f64 {
        if self.clockwise {
            f64::from(self.turn_rate)
        } else {
            -f64::from(self.turn_rate)
        }
    }
}

/// One simulated aircraft as the authoritative store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aircraft {
    /// Instant `state` was last authoritative.
    pub time: DateTime<Utc>,
    pub metadata: AircraftMetadata,
    pub state: AircraftState,
    pub motion: AircraftMotion,
}

impl Aircraft {
    /// Project the aircraft forward to `at` under its current motion.
    ///
    /// Zero turn rate translates along the heading; a non-zero turn rate
    /// sweeps a small-circle arc of radius `speed / ω` whose tangent at
    /// `self.time` matches the heading. The vertical rate is applied per
    /// elapsed second. Negative deltas only restamp the time.
    pub fn extrapolated(&self, at: DateTime<Utc>) -> Aircraft {
        let mut next = self.clone();
        next.time = at;

        let dt = (at - self.time).num_milliseconds() as f64 / 1000.0;
        if dt <= 0.0 {
            next.state.heading = normalize_heading(self.state.heading);
            return next;
        }

        let speed_nm_per_s = f64::from(self.motion.speed) / 3600.0;
        let rate = self.motion.signed_turn_rate();

        if rate == 0.0 {
            let distance = speed_nm_per_s * dt;
            if distance > 0.0 {
                next.state.position = self
                    .state
                    .position
                    .fix_radial_distance(self.state.heading, distance);
            }
            next.state.heading = normalize_heading(self.state.heading);
        } else {
            let heading = self.state.heading + rate * dt;
            let radius = speed_nm_per_s / rate.abs().to_radians();
            // Turn centre sits abeam the aircraft on the inside of the turn
            let to_centre = if rate > 0.0 { 90.0 } else { -90.0 };
            let centre = self
                .state
                .position
                .fix_radial_distance(normalize_heading(self.state.heading + to_centre), radius);
            next.state.position =
                centre.fix_radial_distance(normalize_heading(heading - to_centre), radius);
            next.state.heading = normalize_heading(heading);
        }

        next.state.altitude += f64::from(self.motion.climb_rate) * dt;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_aircraft() -> Aircraft {
        Aircraft {
            time: Utc::now(),
            metadata: AircraftMetadata {
                callsign: "DAL123".to_string(),
                origin: "KLAX".to_string(),
                destination: "KSFO".to_string(),
                rules: FlightRules::Ifr,
                aircraft_type: "B738".to_string(),
                route: "DOTSS2 SERFR".to_string(),
                remarks: String::new(),
            },
            state: AircraftState {
                heading: 360.0,
                altitude: 9000.0,
                position: Coordinate::new(33.9425, -118.408056),
                squawk: Squawk {
                    code: 0o4601,
                    mode: SquawkMode::Altitude,
                },
            },
            motion: AircraftMotion {
                speed: 200,
                climb_rate: -10,
                turn_rate: 3.0,
                clockwise: true,
            },
        }
    }

    #[test]
    fn extrapolation_stamps_target_time() {
        let ac = test_aircraft();
        let at = ac.time + Duration::seconds(5);
        assert_eq!(ac.extrapolated(at).time, at);
    }

    #[test]
    fn turning_extrapolation_matches_known_vector() {
        let ac = test_aircraft();
        let next = ac.extrapolated(ac.time + Duration::seconds(1));

        assert!(
            (next.state.heading - 3.0).abs() < 0.01,
            "heading {}",
            next.state.heading
        );
        assert!(next.state.position.latitude > 33.9425);
        assert!(
            (next.state.altitude - 8990.0).abs() < 1.0,
            "altitude {}",
            next.state.altitude
        );
    }

    #[test]
    fn straight_extrapolation_composes() {
        let mut ac = test_aircraft();
        ac.motion.turn_rate = 0.0;
        ac.state.heading = 47.0;

        let t1 = ac.time + Duration::seconds(13);
        let t2 = ac.time + Duration::seconds(31);
        let direct = ac.extrapolated(t2);
        let stepped = ac.extrapolated(t1).extrapolated(t2);

        assert!(direct.state.position.distance_to(&stepped.state.position) < 1e-3);
        assert_eq!(direct.state.altitude, stepped.state.altitude);
    }

    #[test]
    fn zero_motion_still_normalises_heading() {
        let mut ac = test_aircraft();
        ac.motion = AircraftMotion {
            speed: 0,
            climb_rate: 0,
            turn_rate: 0.0,
            clockwise: true,
        };
        ac.state.heading = -10.0;

        let next = ac.extrapolated(ac.time + Duration::seconds(1));
        assert!((0.0..360.0).contains(&next.state.heading));
        assert_eq!(next.state.heading, 350.0);
    }

    #[test]
    fn counter_clockwise_turn_decreases_heading() {
        let mut ac = test_aircraft();
        ac.state.heading = 10.0;
        ac.motion.clockwise = false;

        let next = ac.extrapolated(ac.time + Duration::seconds(5));
        assert!((next.state.heading - 355.0).abs() < 0.01);
    }
}
