//! The authoritative aircraft/controller store of a server process.
//!
//! Aircraft mutations never land directly: they accumulate in a pending
//! table keyed by aircraft id, coalesced with the delta-merge operator,
//! and take effect when the commit ticker drains the batch. The pending
//! mutex is the batching gate: a drain can never interleave with an
//! incoming delta and expose half a state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::aircraft::Aircraft;
use crate::controllers::Controller;
use crate::protocol::{AircraftUpdate, ControllerUpdate};

pub struct Store {
    aircraft: RwLock<HashMap<Uuid, Aircraft>>,
    controllers: RwLock<HashMap<Uuid, Controller>>,
    /// Batching gate; always taken before the aircraft lock.
    pending: Mutex<HashMap<Uuid, AircraftUpdate>>,
}

/// Outcome of an inbound controller announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerChange {
    Created,
    Updated,
    /// Partial update for a controller the store has never seen.
    Ignored,
}

impl Store {
    pub fn new() -> Arc<Store> {
        Arc::new(Store {
            aircraft: RwLock::new(HashMap::new()),
            controllers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Queue one aircraft delta for the next commit, coalescing by id.
    pub async fn queue_update(&self, delta: AircraftUpdate) {
        let mut pending = self.pending.lock().await;
        match pending.remove(&delta.aircraft) {
            Some(existing) => {
                pending.insert(delta.aircraft, existing.merge(delta));
            }
            None => {
                pending.insert(delta.aircraft, delta);
            }
        }
    }

    /// Drain the pending batch into the live store.
    ///
    /// Returns one coalesced update per mutated aircraft; merged left to
    /// right they equal the diff between the store before and after the
    /// commit. Deletes remove the aircraft and are themselves emitted.
    pub async fn commit_batch(&self) -> Vec<AircraftUpdate> {
        let mut pending = self.pending.lock().await;
        let mut live = self.aircraft.write().await;

        let mut emitted = Vec::with_capacity(pending.len());
        for (_, delta) in pending.drain() {
            if apply_delta(&mut live, &delta) {
                emitted.push(delta);
            }
        }
        metrics::histogram!("sim.commit.batch_size").record(emitted.len() as f64);
        emitted
    }

    /// Live aircraft as of the last commit.
    pub async fn aircraft_snapshot(&self) -> HashMap<Uuid, Aircraft> {
        self.aircraft.read().await.clone()
    }

    /// Live aircraft with the pending batch folded in. The pump and the
    /// planner work against this view so consecutive ticks build on each
    /// other instead of on the last commit.
    pub async fn effective_aircraft(&self) -> HashMap<Uuid, Aircraft> {
        let pending = self.pending.lock().await;
        let mut view = self.aircraft.read().await.clone();
        for delta in pending.values() {
            apply_delta(&mut view, delta);
        }
        view
    }

    pub async fn aircraft_by_callsign(&self, callsign: &str) -> HashMap<Uuid, Aircraft> {
        self.effective_aircraft()
            .await
            .into_iter()
            .filter(|(_, aircraft)| aircraft.metadata.callsign == callsign)
            .collect()
    }

    pub async fn contains_aircraft(&self, id: Uuid) -> bool {
        self.effective_aircraft().await.contains_key(&id)
    }

    /// Apply an inbound controller announcement directly; controllers are
    /// not batched.
    pub async fn upsert_controller(&self, update: &ControllerUpdate) -> ControllerChange {
        let mut controllers = self.controllers.write().await;
        match controllers.get(&update.controller) {
            Some(existing) => match update.apply_to(existing) {
                Ok(next) => {
                    controllers.insert(update.controller, next);
                    ControllerChange::Updated
                }
                Err(error) => {
                    warn!(%error, "Dropped controller update");
                    ControllerChange::Ignored
                }
            },
            None => {
                let (Some(time), Some(metadata), Some(state)) =
                    (update.time, update.metadata.clone(), update.state.clone())
                else {
                    return ControllerChange::Ignored;
                };
                controllers.insert(
                    update.controller,
                    Controller {
                        time,
                        metadata,
                        state,
                    },
                );
                ControllerChange::Created
            }
        }
    }

    pub async fn remove_controller(&self, id: Uuid) -> Option<Controller> {
        self.controllers.write().await.remove(&id)
    }

    pub async fn controllers_snapshot(&self) -> HashMap<Uuid, Controller> {
        self.controllers.read().await.clone()
    }

    /// Controllers whose last announcement is older than `cutoff`.
    pub async fn stale_controllers(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.controllers
            .read()
            .await
            .iter()
            .filter(|(_, controller)| controller.time < cutoff)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Apply one delta to a keyed aircraft map; returns whether it changed
/// anything. A delete that also carries a complete entity is a
/// remove-then-recreate.
fn apply_delta(map: &mut HashMap<Uuid, Aircraft>, delta: &AircraftUpdate) -> bool {
    if delta.is_delete() {
        let existed = map.remove(&delta.aircraft).is_some();
        if let (Some(time), Some(metadata), Some(state), Some(motion)) = (
            delta.time,
            delta.metadata.clone(),
            delta.state,
            delta.motion,
        ) {
            map.insert(
                delta.aircraft,
                Aircraft {
                    time,
                    metadata,
                    state,
                    motion,
                },
            );
            return true;
        }
        return existed;
    }

    match map.get(&delta.aircraft) {
        Some(existing) => match delta.apply_to(existing) {
            Ok(next) => {
                if next == *existing {
                    false
                } else {
                    map.insert(delta.aircraft, next);
                    true
                }
            }
            Err(error) => {
                warn!(%error, "Dropped aircraft delta");
                false
            }
        },
        None => {
            let (Some(time), Some(metadata), Some(state), Some(motion)) = (
                delta.time,
                delta.metadata.clone(),
                delta.state,
                delta.motion,
            ) else {
                warn!(aircraft = %delta.aircraft, "Dropped partial delta for unknown aircraft");
                return false;
            };
            map.insert(
                delta.aircraft,
                Aircraft {
                    time,
                    metadata,
                    state,
                    motion,
                },
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::{
        AircraftMetadata, AircraftMotion, AircraftState, FlightRules, Squawk, SquawkMode,
    };
    use crate::geo::Coordinate;
    use crate::protocol::UpdateFields;

    fn sample(callsign: &str) -> Aircraft {
        Aircraft {
            time: Utc::now(),
            metadata: AircraftMetadata {
                callsign: callsign.to_string(),
                origin: "KSMO".to_string(),
                destination: "KVNY".to_string(),
                rules: FlightRules::Vfr,
                aircraft_type: "C172".to_string(),
                route: "DCT".to_string(),
                remarks: String::new(),
            },
            state: AircraftState {
                heading: 90.0,
                altitude: 3500.0,
                position: Coordinate::new(34.0158, -118.4513),
                squawk: Squawk {
                    code: 1200,
                    mode: SquawkMode::Altitude,
                },
            },
            motion: AircraftMotion {
                speed: 110,
                climb_rate: 0,
                turn_rate: 0.0,
                clockwise: true,
            },
        }
    }

    #[tokio::test]
    async fn create_commit_emits_one_update() {
        let store = Store::new();
        let id = Uuid::new_v4();
        store
            .queue_update(AircraftUpdate::full(id, &sample("N51342")))
            .await;

        let emitted = store.commit_batch().await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].aircraft, id);
        assert!(store.contains_aircraft(id).await);
    }

    #[tokio::test]
    async fn batch_coalesces_per_aircraft() {
        let store = Store::new();
        let id = Uuid::new_v4();
        let aircraft = sample("N51342");
        store.queue_update(AircraftUpdate::full(id, &aircraft)).await;

        let mut faster = aircraft.clone();
        faster.motion.speed = 140;
        store
            .queue_update(AircraftUpdate::diff(id, &aircraft, &faster))
            .await;

        let emitted = store.commit_batch().await;
        assert_eq!(emitted.len(), 1, "one update per aircraft per batch");
        assert_eq!(
            store.aircraft_snapshot().await[&id].motion.speed,
            140,
            "both mutations landed"
        );
    }

    #[tokio::test]
    async fn delete_removes_and_is_emitted() {
        let store = Store::new();
        let id = Uuid::new_v4();
        store
            .queue_update(AircraftUpdate::full(id, &sample("N51342")))
            .await;
        store.commit_batch().await;

        store.queue_update(AircraftUpdate::delete(id)).await;
        let emitted = store.commit_batch().await;

        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].is_delete());
        assert!(!store.contains_aircraft(id).await);
    }

    #[tokio::test]
    async fn delete_of_unknown_aircraft_emits_nothing() {
        let store = Store::new();
        store.queue_update(AircraftUpdate::delete(Uuid::new_v4())).await;
        assert!(store.commit_batch().await.is_empty());
    }

    #[tokio::test]
    async fn partial_delta_for_unknown_aircraft_is_dropped() {
        let store = Store::new();
        let delta = AircraftUpdate {
            aircraft: Uuid::new_v4(),
            update: UpdateFields::MOVEMENT,
            time: None,
            metadata: None,
            state: None,
            motion: Some(sample("N1").motion),
        };
        store.queue_update(delta).await;
        assert!(store.commit_batch().await.is_empty());
        assert!(store.aircraft_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn committed_batch_equals_diff_of_snapshots() {
        let store = Store::new();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let a = sample("N1");
        let b = sample("N2");
        store.queue_update(AircraftUpdate::full(id_a, &a)).await;
        store.queue_update(AircraftUpdate::full(id_b, &b)).await;
        store.commit_batch().await;

        let before = store.aircraft_snapshot().await;

        let mut a_turning = a.clone();
        a_turning.motion.turn_rate = 3.0;
        store.queue_update(AircraftUpdate::diff(id_a, &a, &a_turning)).await;
        store.queue_update(AircraftUpdate::delete(id_b)).await;

        let emitted = store.commit_batch().await;
        let after = store.aircraft_snapshot().await;

        // Replaying the emitted batch over the old snapshot reproduces the new one
        let mut replayed = before.clone();
        for delta in &emitted {
            apply_delta(&mut replayed, delta);
        }
        assert_eq!(replayed, after);
    }

    #[tokio::test]
    async fn effective_view_folds_in_pending() {
        let store = Store::new();
        let id = Uuid::new_v4();
        let aircraft = sample("N51342");
        store.queue_update(AircraftUpdate::full(id, &aircraft)).await;

        // Not committed yet, but the pump's view already sees it
        assert!(store.aircraft_snapshot().await.is_empty());
        assert_eq!(store.effective_aircraft().await.len(), 1);
    }

    #[tokio::test]
    async fn controller_lifecycle() {
        use crate::controllers::{ControllerMetadata, ControllerState, FacilityType};

        let store = Store::new();
        let id = Uuid::new_v4();
        let controller = Controller {
            time: Utc::now(),
            metadata: ControllerMetadata {
                facility: "LAX".to_string(),
                facility_type: FacilityType::Twr,
                discriminator: None,
            },
            state: ControllerState {
                radar_antennae: vec![Coordinate::new(33.9425, -118.408056)],
            },
        };

        let full = ControllerUpdate::full(id, &controller);
        assert_eq!(store.upsert_controller(&full).await, ControllerChange::Created);
        assert_eq!(store.upsert_controller(&full).await, ControllerChange::Updated);

        let stale = store
            .stale_controllers(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(stale, vec![id]);

        assert!(store.remove_controller(id).await.is_some());
        assert!(store.controllers_snapshot().await.is_empty());
    }
}
