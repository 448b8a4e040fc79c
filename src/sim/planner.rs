//! Per-aircraft instruction queues and the actuation that flies them.
//!
//! Each pump tick the planner checks the head instruction of every routed
//! aircraft for termination, pops at most one finished head, and then
//! steers the aircraft toward the (possibly new) head by adjusting its
//! motion. Motion is written through the store only when it actually
//! changes, keeping the commit batch minimal.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::aircraft::{Aircraft, AircraftMotion};
use crate::geo::heading_delta;
use crate::protocol::{AircraftUpdate, UpdateFields};
use crate::sim::instructions::{Instruction, Lnav, Termination};
use crate::sim::store::Store;

/// Standard-rate-ish turn used for every commanded heading change.
const TURN_RATE_DEG_PER_SEC: f32 = 3.0;
/// Within this many degrees of the target the turn is considered done.
const HEADING_TOLERANCE_DEG: f64 = 1.0;
/// Vertical rates commanded outside an altitude restriction.
const CLIMB_RATE: i32 = 1000;
const DESCENT_RATE: i32 = -500;
/// Speed chase rates in knots per second.
const ACCELERATION: f64 = 10.0;
const DECELERATION: f64 = 5.0;

struct RouteState {
    queue: VecDeque<Instruction>,
    /// Whether the aircraft was still inbound to the head's direct
    /// endpoint at the last evaluation; `None` until first seen.
    approaching: Option<bool>,
    /// Fractional knots carried between ticks while chasing a speed range.
    speed_carry: f64,
}

impl RouteState {
    fn new(queue: VecDeque<Instruction>) -> RouteState {
        RouteState {
            queue,
            approaching: None,
            speed_carry: 0.0,
        }
    }
}

#[derive(Default)]
pub struct Planner {
    routes: HashMap<Uuid, RouteState>,
}

impl Planner {
    pub fn new() -> Planner {
        Planner::default()
    }

    /// Replace an aircraft's route outright.
    pub fn assign(&mut self, aircraft: Uuid, route: Vec<Instruction>) {
        self.routes
            .insert(aircraft, RouteState::new(route.into()));
    }

    /// Append one instruction to an aircraft's route.
    pub fn enqueue(&mut self, aircraft: Uuid, instruction: Instruction) {
        self.routes
            .entry(aircraft)
            .or_insert_with(|| RouteState::new(VecDeque::new()))
            .queue
            .push_back(instruction);
    }

    pub fn clear(&mut self, aircraft: Uuid) {
        self.routes.remove(&aircraft);
    }

    /// Head instruction of an aircraft's route, if any.
    pub fn current(&self, aircraft: Uuid) -> Option<Instruction> {
        self.routes
            .get(&aircraft)
            .and_then(|state| state.queue.front().copied())
    }

    /// Run one planner pass over every routed aircraft.
    pub async fn tick(&mut self, store: &Store, dt: f64) {
        let aircraft = store.effective_aircraft().await;

        // Routes for aircraft that no longer exist, or that ran dry, go idle
        self.routes
            .retain(|id, state| !state.queue.is_empty() && aircraft.contains_key(id));

        for (id, state) in &mut self.routes {
            let Some(current) = aircraft.get(id) else {
                continue;
            };

            let approaching = &mut state.approaching;
            let popped = state
                .queue
                .front()
                .is_some_and(|head| head_terminated(head, current, approaching));
            if popped {
                state.queue.pop_front();
                state.approaching = None;
            }

            let Some(head) = state.queue.front() else {
                continue;
            };
            let motion = actuate(head, current, dt, &mut state.speed_carry);
            if motion != current.motion {
                store
                    .queue_update(AircraftUpdate {
                        aircraft: *id,
                        update: UpdateFields::MOVEMENT,
                        time: None,
                        metadata: None,
                        state: None,
                        motion: Some(motion),
                    })
                    .await;
            }
        }
    }
}

/// Termination check for the head instruction.
fn head_terminated(head: &Instruction, aircraft: &Aircraft, approaching: &mut Option<bool>) -> bool {
    match head.effective_termination() {
        Termination::Forever => false,
        Termination::Altitude => head.altitude.is_compliant(aircraft.state.altitude),
        Termination::Crossing => {
            let Lnav::Direct(endpoint) = head.lnav else {
                return false;
            };
            let (bearing, _) = aircraft.state.position.bearing_distance_to(&endpoint);
            let Some(bearing) = bearing else {
                // Sitting on the endpoint itself; no crossing observable yet
                return false;
            };
            // Inbound while the endpoint is within a quarter turn of the nose
            let now_approaching = heading_delta(aircraft.state.heading, bearing).abs() <= 90.0;
            // A head first seen already past abeam pops immediately
            let was_approaching = approaching.unwrap_or(true);
            *approaching = Some(now_approaching);
            was_approaching && !now_approaching
        }
    }
}

/// Motion the aircraft should fly to chase `head`.
fn actuate(head: &Instruction, aircraft: &Aircraft, dt: f64, speed_carry: &mut f64) -> AircraftMotion {
    let mut motion = aircraft.motion;

    let target_heading = match head.lnav {
        Lnav::PresentHeading => None,
        Lnav::Heading(heading) => Some(heading),
        Lnav::Direct(endpoint) => aircraft.state.position.bearing_distance_to(&endpoint).0,
    };
    match target_heading {
        Some(target) => {
            let delta = heading_delta(aircraft.state.heading, target);
            if delta.abs() <= HEADING_TOLERANCE_DEG {
                motion.turn_rate = 0.0;
            } else {
                motion.turn_rate = TURN_RATE_DEG_PER_SEC;
                motion.clockwise = delta > 0.0;
            }
        }
        None => motion.turn_rate = 0.0,
    }

    if head.altitude.is_compliant(aircraft.state.altitude) {
        motion.climb_rate = 0;
    } else if head
        .altitude
        .min
        .is_some_and(|min| aircraft.state.altitude < min)
    {
        motion.climb_rate = CLIMB_RATE;
    } else {
        motion.climb_rate = DESCENT_RATE;
    }

    if !head.speed.is_compliant(motion.speed) {
        let (rate, target) = if head
            .speed
            .min
            .is_some_and(|min| motion.speed < min)
        {
            (ACCELERATION, f64::from(head.speed.min.unwrap_or(0)))
        } else {
            (-DECELERATION, f64::from(head.speed.max.unwrap_or(0)))
        };
        let step = rate * dt + *speed_carry;
        let whole = step.trunc();
        *speed_carry = step - whole;

        let chased = f64::from(motion.speed) + whole;
        let clamped = if rate > 0.0 {
            chased.min(target)
        } else {
            chased.max(target)
        };
        motion.speed = clamped.max(0.0) as u32;
    } else {
        *speed_carry = 0.0;
    }

    motion
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::{
        AircraftMetadata, AircraftMotion, AircraftState, FlightRules, Squawk, SquawkMode,
    };
    use crate::geo::Coordinate;
    use crate::sim::instructions::{AltitudeRange, SpeedRange};
    use chrono::Utc;

    fn flying(heading: f64, speed: u32, altitude: f64) -> Aircraft {
        Aircraft {
            time: Utc::now(),
            metadata: AircraftMetadata {
                callsign: "N51342".to_string(),
                origin: "KSMO".to_string(),
                destination: "KVNY".to_string(),
                rules: FlightRules::Vfr,
                aircraft_type: "C172".to_string(),
                route: "DCT".to_string(),
                remarks: String::new(),
            },
            state: AircraftState {
                heading,
                altitude,
                position: Coordinate::new(34.0, -118.0),
                squawk: Squawk {
                    code: 1200,
                    mode: SquawkMode::Altitude,
                },
            },
            motion: AircraftMotion {
                speed,
                climb_rate: 0,
                turn_rate: 0.0,
                clockwise: true,
            },
        }
    }

    fn forever(lnav: Lnav) -> Instruction {
        Instruction {
            lnav,
            altitude: AltitudeRange::default(),
            speed: SpeedRange::default(),
            termination: Termination::Forever,
        }
    }

    #[test]
    fn commanded_heading_turns_the_short_way() {
        let aircraft = flying(350.0, 120, 3000.0);
        let mut carry = 0.0;
        let motion = actuate(&forever(Lnav::Heading(10.0)), &aircraft, 0.1, &mut carry);
        assert_eq!(motion.turn_rate, TURN_RATE_DEG_PER_SEC);
        assert!(motion.clockwise);

        let motion = actuate(&forever(Lnav::Heading(320.0)), &aircraft, 0.1, &mut carry);
        assert!(!motion.clockwise);
    }

    #[test]
    fn on_heading_zeroes_the_turn() {
        let aircraft = flying(90.5, 120, 3000.0);
        let mut carry = 0.0;
        let motion = actuate(&forever(Lnav::Heading(90.0)), &aircraft, 0.1, &mut carry);
        assert_eq!(motion.turn_rate, 0.0);
    }

    #[test]
    fn altitude_restriction_commands_climb_and_descent() {
        let low = flying(90.0, 120, 2000.0);
        let mut carry = 0.0;
        let instruction = Instruction {
            lnav: Lnav::PresentHeading,
            altitude: AltitudeRange::between(5000.0, 7000.0),
            speed: SpeedRange::default(),
            termination: Termination::Forever,
        };
        assert_eq!(actuate(&instruction, &low, 0.1, &mut carry).climb_rate, CLIMB_RATE);

        let high = flying(90.0, 120, 9000.0);
        assert_eq!(actuate(&instruction, &high, 0.1, &mut carry).climb_rate, DESCENT_RATE);

        let level = flying(90.0, 120, 6000.0);
        assert_eq!(actuate(&instruction, &level, 0.1, &mut carry).climb_rate, 0);
    }

    #[test]
    fn speed_chase_accumulates_fractional_knots() {
        let aircraft = flying(90.0, 200, 3000.0);
        let instruction = Instruction {
            lnav: Lnav::PresentHeading,
            altitude: AltitudeRange::default(),
            speed: SpeedRange {
                min: None,
                max: Some(180),
            },
            termination: Termination::Forever,
        };

        // -5 kt/s at 10 Hz is half a knot per tick; the carry makes it land
        let mut carry = 0.0;
        let mut speed = aircraft.motion.speed;
        for _ in 0..4 {
            let mut current = aircraft.clone();
            current.motion.speed = speed;
            speed = actuate(&instruction, &current, 0.1, &mut carry).speed;
        }
        assert_eq!(speed, 198, "2 kt lost over 0.4 s");
    }

    #[test]
    fn speed_chase_clamps_to_the_range() {
        let aircraft = flying(90.0, 179, 3000.0);
        let instruction = Instruction {
            lnav: Lnav::PresentHeading,
            altitude: AltitudeRange::default(),
            speed: SpeedRange::between(180, 250),
            termination: Termination::Forever,
        };
        let mut carry = 0.0;
        let motion = actuate(&instruction, &aircraft, 1.0, &mut carry);
        assert_eq!(motion.speed, 180, "accelerating past the minimum clamps");
    }

    #[tokio::test]
    async fn crossing_past_abeam_pops_to_next_instruction() {
        let store = Store::new();
        let id = Uuid::new_v4();
        // 0.05 NM past abeam of the endpoint, wings level northbound
        let endpoint = Coordinate::new(34.0, -118.0);
        let mut aircraft = flying(360.0, 60, 3000.0);
        aircraft.state.position = endpoint.fix_radial_distance(5.0, 0.05);
        store.queue_update(AircraftUpdate::full(id, &aircraft)).await;
        store.commit_batch().await;

        let mut planner = Planner::new();
        planner.assign(
            id,
            vec![
                Instruction {
                    lnav: Lnav::Direct(endpoint),
                    altitude: AltitudeRange::default(),
                    speed: SpeedRange::default(),
                    termination: Termination::Crossing,
                },
                Instruction {
                    lnav: Lnav::PresentHeading,
                    altitude: AltitudeRange::between(1000.0, 1000.0),
                    speed: SpeedRange::default(),
                    termination: Termination::Altitude,
                },
            ],
        );

        planner.tick(&store, 0.1).await;
        let head = planner.current(id).expect("route must not run dry");
        assert_eq!(head.termination, Termination::Altitude);
    }

    #[tokio::test]
    async fn inbound_direct_does_not_pop_until_crossing() {
        let store = Store::new();
        let id = Uuid::new_v4();
        let endpoint = Coordinate::new(34.0, -118.0);
        // 1 NM south of the endpoint, heading straight at it
        let mut aircraft = flying(360.0, 60, 3000.0);
        aircraft.state.position = endpoint.fix_radial_distance(180.0, 1.0);
        store.queue_update(AircraftUpdate::full(id, &aircraft)).await;
        store.commit_batch().await;

        let mut planner = Planner::new();
        planner.assign(
            id,
            vec![Instruction {
                lnav: Lnav::Direct(endpoint),
                altitude: AltitudeRange::default(),
                speed: SpeedRange::default(),
                termination: Termination::Crossing,
            }],
        );

        planner.tick(&store, 0.1).await;
        assert!(planner.current(id).is_some(), "still inbound, nothing pops");
    }
}
