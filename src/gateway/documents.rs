/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::HashMap;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, warn};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::equipment::{Equipment, EquipmentId, EquipmentKind, GroupId, LocationId};
use crate::error::ControlError;
use crate::leadlag::Group;

/// In-process read cache lifetime (§4.2).
const READ_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DocumentStoreConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

/// Raw wire shape for an equipment record. Legacy data may carry trailing
/// spaces on field names (§6); `from_raw` strips them before mapping onto
/// [`Equipment`].
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawEquipment {
    #[serde(flatten)]
    fields: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawGroup {
    #[serde(flatten)]
    fields: HashMap<String, serde_json::Value>,
}

/// C2: equipment and group records, with a 30s process-local read cache and
/// an explicitly invalidated group cache (§4.2). On a miss for an equipment
/// id the time-series store already knows about, callers get back a
/// [`Equipment::placeholder`] while an upsert is kicked off in the
/// background (§4.2, §9 "Legacy defaults").
pub struct DocumentStore {
    client: Client<HttpConnector, Full<Bytes>>,
    config: DocumentStoreConfig,
    equipment_cache: Cache<EquipmentId, Equipment>,
    group_cache: Cache<GroupId, Group>,
    member_index: Cache<EquipmentId, GroupId>,
}

impl DocumentStore {
    pub fn new(config: DocumentStoreConfig) -> Self {
        DocumentStore {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            config,
            equipment_cache: Cache::builder().time_to_live(READ_CACHE_TTL).build(),
            group_cache: Cache::builder().time_to_live(READ_CACHE_TTL).build(),
            member_index: Cache::builder().time_to_live(READ_CACHE_TTL).build(),
        }
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ControlError> {
        let url = format!("{}{path}", self.config.base_url);
        let request = Request::builder()
            .method(Method::GET)
            .uri(&url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| ControlError::InternalError {
                msg: format!("failed to build request: {e}"),
            })?;
        let response = timeout(self.config.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ControlError::Timeout(self.config.request_timeout))?
            .map_err(|e| ControlError::UpstreamUnavailable { msg: e.to_string() })?;
        if response.status() == hyper::StatusCode::NOT_FOUND {
            return Err(ControlError::NotFound {
                msg: path.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ControlError::UpstreamUnavailable {
                msg: format!("{path}: {}", response.status()),
            });
        }
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ControlError::UpstreamUnavailable { msg: e.to_string() })?
            .to_bytes();
        serde_json::from_slice(&bytes).map_err(|e| ControlError::UpstreamUnavailable {
            msg: format!("malformed document-store response: {e}"),
        })
    }

    async fn put_json(&self, path: &str, body: &serde_json::Value) -> Result<(), ControlError> {
        let url = format!("{}{path}", self.config.base_url);
        let payload = serde_json::to_vec(body).map_err(|e| ControlError::InternalError {
            msg: format!("failed to encode document: {e}"),
        })?;
        let request = Request::builder()
            .method(Method::PUT)
            .uri(&url)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| ControlError::InternalError {
                msg: format!("failed to build request: {e}"),
            })?;
        let response = timeout(self.config.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ControlError::Timeout(self.config.request_timeout))?
            .map_err(|e| ControlError::UpstreamUnavailable { msg: e.to_string() })?;
        if !response.status().is_success() {
            return Err(ControlError::UpstreamUnavailable {
                msg: format!("{path}: {}", response.status()),
            });
        }
        Ok(())
    }

    pub async fn get_equipment(&self, id: &EquipmentId) -> Result<Equipment, ControlError> {
        if let Some(cached) = self.equipment_cache.get(id).await {
            return Ok(cached);
        }
        match self.get_json(&format!("/equipment/{id}")).await {
            Ok(raw) => {
                let equipment = equipment_from_raw(id.clone(), raw)?;
                self.equipment_cache.insert(id.clone(), equipment.clone()).await;
                Ok(equipment)
            }
            Err(ControlError::NotFound { .. }) => {
                debug!("equipment {id} missing from document store, materializing placeholder");
                let placeholder = Equipment::placeholder(id.clone());
                self.equipment_cache.insert(id.clone(), placeholder.clone()).await;
                let body = serde_json::to_value(&placeholder).unwrap_or_default();
                let url = format!("{}/equipment/{id}", self.config.base_url);
                let id_clone = id.clone();
                let client = self.client.clone();
                let request_timeout = self.config.request_timeout;
                tokio::spawn(async move {
                    if let Err(err) = persist_placeholder(client, &url, request_timeout, &body).await {
                        warn!("failed to persist placeholder equipment {id_clone}: {err}");
                    }
                });
                Ok(placeholder)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list_equipment(&self) -> Result<Vec<Equipment>, ControlError> {
        let raw = self.get_json("/equipment").await?;
        let entries = raw.as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ControlError::UpstreamUnavailable {
                    msg: "equipment record missing id".to_string(),
                })?
                .to_string();
            let equipment = equipment_from_raw(id.clone(), entry)?;
            self.equipment_cache.insert(id, equipment.clone()).await;
            out.push(equipment);
        }
        Ok(out)
    }

    pub async fn upsert_equipment(&self, equipment: &Equipment) -> Result<(), ControlError> {
        let body = serde_json::to_value(equipment).map_err(|e| ControlError::InternalError {
            msg: format!("failed to encode equipment: {e}"),
        })?;
        self.put_json(&format!("/equipment/{}", equipment.id), &body).await?;
        self.equipment_cache
            .insert(equipment.id.clone(), equipment.clone())
            .await;
        Ok(())
    }

    pub async fn get_group(&self, id: &GroupId) -> Result<Group, ControlError> {
        if let Some(cached) = self.group_cache.get(id).await {
            return Ok(cached);
        }
        let raw = self.get_json(&format!("/equipment-groups/{id}")).await?;
        let group = group_from_raw(id.clone(), raw)?;
        self.cache_group(group.clone()).await;
        Ok(group)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, ControlError> {
        let raw = self.get_json("/equipment-groups").await?;
        let entries = raw.as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ControlError::UpstreamUnavailable {
                    msg: "group record missing id".to_string(),
                })?
                .to_string();
            let group = group_from_raw(id, entry)?;
            self.cache_group(group.clone()).await;
            out.push(group);
        }
        Ok(out)
    }

    /// Invalidates the cached group entry and its member index on membership
    /// change (§4.2 "explicit invalidation").
    pub async fn invalidate_group(&self, id: &GroupId) {
        self.group_cache.invalidate(id).await;
    }

    async fn cache_group(&self, group: Group) {
        for member in &group.member_ids {
            self.member_index.insert(member.clone(), group.id.clone()).await;
        }
        self.group_cache.insert(group.id.clone(), group).await;
    }

    /// Looks up the group a given equipment belongs to, used by the
    /// lead/lag resolver (§4.6).
    pub async fn find_group_for_member(&self, equipment_id: &EquipmentId) -> Result<Option<Group>, ControlError> {
        if let Some(group_id) = self.member_index.get(equipment_id).await {
            if let Some(group) = self.group_cache.get(&group_id).await {
                return Ok(Some(group));
            }
        }
        // cache miss: fall back to a full listing rather than guessing a group id
        for group in self.list_groups().await? {
            if group.member_ids.contains(equipment_id) {
                return Ok(Some(group));
            }
        }
        Ok(None)
    }
}

fn trimmed_field<'a>(raw: &'a HashMap<String, serde_json::Value>, name: &str) -> Option<&'a serde_json::Value> {
    raw.get(name).or_else(|| {
        raw.iter()
            .find(|(k, _)| k.trim_end() == name)
            .map(|(_, v)| v)
    })
}

fn str_field(raw: &HashMap<String, serde_json::Value>, name: &str) -> Option<String> {
    trimmed_field(raw, name)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

fn equipment_from_raw(id: EquipmentId, raw: serde_json::Value) -> Result<Equipment, ControlError> {
    let RawEquipment { fields } = serde_json::from_value(raw).map_err(|e| ControlError::UpstreamUnavailable {
        msg: format!("malformed equipment record: {e}"),
    })?;
    let kind_str = str_field(&fields, "kind").unwrap_or_else(|| "fan-coil".to_string());
    let kind: EquipmentKind = kind_str.parse().map_err(|_| ControlError::UnknownEquipmentKind {
        kind: kind_str.clone(),
    })?;
    let location_id = str_field(&fields, "locationId").unwrap_or_else(|| "4".to_string());
    let name = str_field(&fields, "name").unwrap_or_else(|| "Unnamed Equipment".to_string());
    let system = str_field(&fields, "system");
    let control_enabled = trimmed_field(&fields, "controlEnabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let group_id = str_field(&fields, "groupId");
    let is_lead = trimmed_field(&fields, "isLead").and_then(|v| v.as_bool());

    Ok(Equipment {
        id,
        kind,
        location_id,
        name,
        system,
        control_enabled,
        group_id,
        is_lead,
    })
}

fn group_from_raw(id: GroupId, raw: serde_json::Value) -> Result<Group, ControlError> {
    let RawGroup { fields } = serde_json::from_value(raw).map_err(|e| ControlError::UpstreamUnavailable {
        msg: format!("malformed group record: {e}"),
    })?;
    let kind_str = str_field(&fields, "kind").unwrap_or_else(|| "fan-coil".to_string());
    let kind: EquipmentKind = kind_str.parse().map_err(|_| ControlError::UnknownEquipmentKind {
        kind: kind_str.clone(),
    })?;
    let member_ids: Vec<EquipmentId> = trimmed_field(&fields, "memberIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let lead_id = str_field(&fields, "leadEquipmentId").unwrap_or_else(|| {
        member_ids.first().cloned().unwrap_or_default()
    });
    let use_lead_lag = trimmed_field(&fields, "useLeadLag")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let auto_failover = trimmed_field(&fields, "autoFailover")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let changeover_interval_days = trimmed_field(&fields, "changeoverIntervalDays")
        .and_then(|v| v.as_u64())
        .unwrap_or(7) as u32;

    Ok(Group {
        id,
        kind,
        member_ids,
        lead_id,
        use_lead_lag,
        auto_failover,
        changeover_interval_days,
        last_changeover_at: None,
    })
}

/// Fire-and-forget PUT used to materialize a placeholder equipment record
/// without holding a borrow of `&self` across the spawned task (§4.2).
async fn persist_placeholder(
    client: Client<HttpConnector, Full<Bytes>>,
    url: &str,
    request_timeout: Duration,
    body: &serde_json::Value,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(body).map_err(|e| ControlError::InternalError {
        msg: format!("failed to encode placeholder: {e}"),
    })?;
    let request = Request::builder()
        .method(Method::PUT)
        .uri(url)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| ControlError::InternalError {
            msg: format!("failed to build request: {e}"),
        })?;
    let response = timeout(request_timeout, client.request(request))
        .await
        .map_err(|_| ControlError::Timeout(request_timeout))?
        .map_err(|e| ControlError::UpstreamUnavailable { msg: e.to_string() })?;
    if !response.status().is_success() {
        return Err(ControlError::UpstreamUnavailable {
            msg: format!("{url}: {}", response.status()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_space_field_names() {
        let mut fields = HashMap::new();
        fields.insert("locationId ".to_string(), serde_json::json!("7"));
        assert_eq!(str_field(&fields, "locationId"), Some("7".to_string()));
    }

    #[test]
    fn prefers_exact_match_over_trimmed() {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), serde_json::json!("exact"));
        fields.insert("name ".to_string(), serde_json::json!("trimmed"));
        assert_eq!(str_field(&fields, "name"), Some("exact".to_string()));
    }
}
