use crate::model::{
    MowerSnapshot, MowerState, MowerStateUpdate, ACTIVITY_CHARGING, ACTIVITY_UNKNOWN,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Authoritative in-memory view of every known mower.
///
/// Each update builds a new [`MowerState`] and swaps it in under the write
/// lock, so readers only ever observe complete snapshots. One instance is
/// owned by the application and shared by `Arc`; tests create their own.
#[derive(Debug, Default)]
pub struct MowerStates {
    states: RwLock<HashMap<String, Arc<MowerState>>>,
}

impl MowerStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `update` onto the current (or default) state of `mower_id`.
    pub fn update_mower_state(&self, mower_id: &str, update: MowerStateUpdate) -> Arc<MowerState> {
        let mut states = self
            .states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut next = states
            .get(mower_id)
            .map(|current| MowerState::clone(current))
            .unwrap_or_else(|| MowerState::new(mower_id));
        merge(&mut next, update);

        let next = Arc::new(next);
        states.insert(mower_id.to_string(), Arc::clone(&next));
        next
    }

    pub fn mower_state(&self, mower_id: &str) -> Option<Arc<MowerState>> {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(mower_id)
            .cloned()
    }

    /// Snapshots of all mowers, sorted by id.
    pub fn all_mower_states(&self) -> Vec<Arc<MowerState>> {
        let states = self
            .states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<Arc<MowerState>> = states.values().cloned().collect();
        all.sort_by(|a, b| a.mower_id.cmp(&b.mower_id));
        all
    }

    /// Seeds names, activities and battery levels from a fleet snapshot.
    pub fn seed(&self, snapshot: &[MowerSnapshot]) {
        for mower in snapshot {
            let activity = mower
                .activity
                .clone()
                .unwrap_or_else(|| ACTIVITY_UNKNOWN.to_string());
            let update = MowerStateUpdate {
                name: mower.name.clone(),
                is_charging: Some(activity == ACTIVITY_CHARGING),
                activity: Some(activity),
                battery_percent: mower.battery_percent,
                ..Default::default()
            };
            self.update_mower_state(&mower.mower_id, update);
        }
    }

    pub fn len(&self) -> usize {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn merge(state: &mut MowerState, update: MowerStateUpdate) {
    if let Some(name) = update.name {
        state.name = name;
    }
    if let Some(activity) = update.activity {
        state.activity = activity;
    }
    if let Some(session_id) = update.session_id {
        state.session_id = Some(session_id);
    }
    if let Some(at) = update.last_activity_at {
        state.last_activity_at = Some(at);
    }
    if let Some(percent) = update.battery_percent {
        state.battery_percent = Some(percent);
    }
    if let Some(at) = update.battery_at {
        state.battery_at = Some(at);
    }
    if let Some(is_charging) = update.is_charging {
        state.is_charging = is_charging;
    }
    if let Some(message) = update.last_message {
        state.last_message = Some(message);
    }
    if let Some(position) = update.last_position {
        state.last_position = Some(position);
    }
    if let Some(at) = update.last_event_at {
        state.last_event_at = Some(at);
    }
}
