/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::control::Value;
use crate::equipment::{EquipmentId, GroupId};
use crate::pid::PidState;

const UI_STATE_TTL: Duration = Duration::from_secs(24 * 3600);
const LEAD_LAG_TTL: Duration = Duration::from_secs(24 * 3600);
const COMMAND_HISTORY_LEN: usize = 20;

/// Key for a single PID loop: `(locationId, equipmentId, loopName)` (§4.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PidKey {
    pub location_id: String,
    pub equipment_id: EquipmentId,
    pub loop_name: String,
}

impl PidKey {
    pub fn new(
        location_id: impl Into<String>,
        equipment_id: impl Into<String>,
        loop_name: impl Into<String>,
    ) -> Self {
        PidKey {
            location_id: location_id.into(),
            equipment_id: equipment_id.into(),
            loop_name: loop_name.into(),
        }
    }
}

/// Persistent hysteresis state for a single on/off loop (§3 "Hysteresis
/// state").
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HysteresisState {
    pub is_on: bool,
}

/// Persistent stage-count state for geothermal staging (§4.5.7). One entry
/// per equipment; `stage_entered_at` anchors the 180 s minimum-runtime gate
/// and must survive across ticks, not just within a single `run`.
/// `rotation_offset` is assigned once, at random, the first time an
/// equipment is seen, then held fixed for its lifetime to equalize wear
/// across stages without reshuffling which physical stage leads every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: u8,
    pub stage_entered_at: Option<DateTime<Utc>>,
    pub rotation_offset: Option<u8>,
}

/// Bounded history entry for a UI-originated command (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiCommandHistoryEntry {
    pub command: String,
    pub applied_at: DateTime<Utc>,
}

/// Per-equipment UI state (§4.3, §4.10). Writers are the location worker (on
/// apply) and the UI command worker (on ingest); readers include the external
/// `GET /api/equipment/{id}/state` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EquipmentUiState {
    pub last_modified_at: Option<DateTime<Utc>>,
    pub last_modified_by: Option<String>,
    pub settings: HashMap<String, Value>,
    pub command: Option<String>,
    pub command_history: VecDeque<UiCommandHistoryEntry>,
}

impl EquipmentUiState {
    fn record(&mut self, command: String, by: String, settings: HashMap<String, Value>) {
        self.last_modified_at = Some(Utc::now());
        self.last_modified_by = Some(by);
        self.command = Some(command.clone());
        self.settings = settings;
        if self.command_history.len() >= COMMAND_HISTORY_LEN {
            self.command_history.pop_front();
        }
        self.command_history.push_back(UiCommandHistoryEntry {
            command,
            applied_at: Utc::now(),
        });
    }
}

/// Abstraction over the shared, TTL'd cache collaborator (§6 "Shared cache").
/// The in-process [`InMemorySharedCache`] is sufficient for a single-replica
/// deployment; the trait seam is what lets a real external cache (e.g.
/// memcached/redis-alike) stand in for multi-replica deployments (§9).
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn setex(&self, key: &str, ttl: Duration, value: String);
    async fn get(&self, key: &str) -> Option<String>;
}

pub struct InMemorySharedCache {
    cache: Cache<String, String>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        InMemorySharedCache {
            cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(LEAD_LAG_TTL.max(UI_STATE_TTL))
                .build(),
        }
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn setex(&self, key: &str, _ttl: Duration, value: String) {
        // per-key custom TTLs aren't exposed by moka's sync builder API; the
        // cache's fixed TTL is set generously above the longest TTL we use.
        self.cache.insert(key.to_string(), value).await;
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).await
    }
}

/// Keyed, in-process persistence for PID loops, lead/lag rotation state, and
/// per-equipment UI state (§4.3). Restart-safety for the lead/lag and UI
/// families comes from mirroring through [`SharedCache`].
pub struct StateStore {
    pid_states: RwLock<HashMap<PidKey, PidState>>,
    hysteresis_states: RwLock<HashMap<PidKey, HysteresisState>>,
    stage_states: RwLock<HashMap<EquipmentId, StageState>>,
    shared_cache: Arc<dyn SharedCache>,
    /// Per-equipment busy gate enforcing invariant (1): at most one control
    /// tick active per equipment at any moment.
    busy_gates: RwLock<HashMap<EquipmentId, Arc<Mutex<()>>>>,
}

impl StateStore {
    pub fn new(shared_cache: Arc<dyn SharedCache>) -> Self {
        StateStore {
            pid_states: RwLock::new(HashMap::new()),
            hysteresis_states: RwLock::new(HashMap::new()),
            stage_states: RwLock::new(HashMap::new()),
            shared_cache,
            busy_gates: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_pid_state(&self, key: &PidKey) -> PidState {
        self.pid_states
            .read()
            .await
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_pid_state(&self, key: PidKey, state: PidState) {
        self.pid_states.write().await.insert(key, state);
    }

    pub async fn get_hysteresis_state(&self, key: &PidKey) -> HysteresisState {
        self.hysteresis_states
            .read()
            .await
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_hysteresis_state(&self, key: PidKey, state: HysteresisState) {
        self.hysteresis_states.write().await.insert(key, state);
    }

    pub async fn get_stage_state(&self, equipment_id: &EquipmentId) -> StageState {
        self.stage_states
            .read()
            .await
            .get(equipment_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_stage_state(&self, equipment_id: EquipmentId, state: StageState) {
        self.stage_states.write().await.insert(equipment_id, state);
    }

    /// Acquires the per-equipment busy gate, blocking out any concurrent tick
    /// for the same equipment (invariant §3.1). Lazily creates the gate.
    pub async fn lock_equipment(&self, equipment_id: &EquipmentId) -> Arc<Mutex<()>> {
        if let Some(gate) = self.busy_gates.read().await.get(equipment_id) {
            return Arc::clone(gate);
        }
        let mut gates = self.busy_gates.write().await;
        Arc::clone(
            gates
                .entry(equipment_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn cache_get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.shared_cache.get(key).await?;
        serde_json::from_str(&raw).ok()
    }

    async fn cache_set_json<T: Serialize>(&self, key: &str, ttl: Duration, value: &T) {
        if let Ok(raw) = serde_json::to_string(value) {
            self.shared_cache.setex(key, ttl, raw).await;
        }
    }

    pub async fn get_ui_state(&self, equipment_id: &EquipmentId) -> EquipmentUiState {
        self.cache_get_json(&ui_state_key(equipment_id))
            .await
            .unwrap_or_default()
    }

    /// Records a UI-originated command, applying last-write-wins semantics
    /// (§8 idempotence: the same payload applied twice yields the same
    /// stored value).
    pub async fn record_ui_command(
        &self,
        equipment_id: &EquipmentId,
        command: String,
        by: String,
        settings: HashMap<String, Value>,
    ) {
        let mut state = self.get_ui_state(equipment_id).await;
        state.record(command, by, settings);
        self.cache_set_json(&ui_state_key(equipment_id), UI_STATE_TTL, &state)
            .await;
    }

    pub async fn get_group_state(&self, group_id: &GroupId) -> Option<LeadLagCacheEntry> {
        self.cache_get_json(&group_state_key(group_id)).await
    }

    pub async fn set_group_state(&self, group_id: &GroupId, entry: &LeadLagCacheEntry) {
        self.cache_set_json(&group_state_key(group_id), LEAD_LAG_TTL, entry)
            .await;
    }
}

fn ui_state_key(equipment_id: &EquipmentId) -> String {
    format!("equipment:{equipment_id}:state")
}

fn group_state_key(group_id: &GroupId) -> String {
    format!("group:{group_id}:leadlag")
}

/// What's mirrored to the shared cache for a lead/lag group, so a restart (or
/// another replica, §9) can recover rotation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadLagCacheEntry {
    pub lead_id: EquipmentId,
    pub last_changeover_at: Option<DateTime<Utc>>,
    pub last_failover_at: Option<DateTime<Utc>>,
    pub failover_count: u32,
    pub runtime_hours_by_member: HashMap<EquipmentId, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ui_command_idempotence() {
        let store = StateStore::new(Arc::new(InMemorySharedCache::new()));
        let mut settings = HashMap::new();
        settings.insert("mode".to_string(), Value::Text("heating".to_string()));
        store
            .record_ui_command(
                &"eq-1".to_string(),
                "setMode".to_string(),
                "user-1".to_string(),
                settings.clone(),
            )
            .await;
        let first = store.get_ui_state(&"eq-1".to_string()).await;
        store
            .record_ui_command(
                &"eq-1".to_string(),
                "setMode".to_string(),
                "user-1".to_string(),
                settings,
            )
            .await;
        let second = store.get_ui_state(&"eq-1".to_string()).await;
        assert_eq!(first.settings, second.settings);
        assert_eq!(first.command, second.command);
    }

    #[tokio::test]
    async fn pid_state_clamped_integral_round_trips() {
        let store = StateStore::new(Arc::new(InMemorySharedCache::new()));
        let key = PidKey::new("1", "eq-1", "heating");
        let state = PidState {
            integral: 42.0,
            previous_error: 1.0,
            last_output: 80.0,
        };
        store.set_pid_state(key.clone(), state).await;
        assert_eq!(store.get_pid_state(&key).await, state);
    }

    #[tokio::test]
    async fn stage_state_round_trips() {
        let store = StateStore::new(Arc::new(InMemorySharedCache::new()));
        let equipment_id = "eq-1".to_string();
        let state = StageState {
            stage: 3,
            stage_entered_at: Some(Utc::now()),
            rotation_offset: Some(2),
        };
        store.set_stage_state(equipment_id.clone(), state).await;
        assert_eq!(store.get_stage_state(&equipment_id).await, state);
    }

    #[tokio::test]
    async fn busy_gate_is_shared_across_calls_for_same_equipment() {
        let store = StateStore::new(Arc::new(InMemorySharedCache::new()));
        let a = store.lock_equipment(&"eq-1".to_string()).await;
        let b = store.lock_equipment(&"eq-1".to_string()).await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
