/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::HashMap;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, trace, warn};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::time::{sleep, timeout};

use crate::control::{NeuralCommand, Value};
use crate::equipment::{EquipmentId, GroupId, LocationId};
use crate::error::ControlError;

/// Databases addressed on the time-series store (§6 "External Interfaces").
const DB_LOCATIONS: &str = "Locations";
const DB_UI_COMMANDS: &str = "UIControlCommands";
const DB_NEURAL_COMMANDS: &str = "NeuralControlCommands";
const DB_CONTROL_COMMANDS: &str = "ControlCommands";

/// Fallback window multiplier applied when a `queryRecent` comes back empty
/// (§4.1). `5m` widens to `60m` (the spec's stated "5-minute, fallback
/// 60-minute" sampling windows — ratio kept general for callers using other
/// windows).
const FALLBACK_WINDOW_MULTIPLIER: u32 = 12;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub query_timeout: Duration,
    pub write_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub deadline: Duration,
}

/// C1: reads sensor metrics and UI overrides, writes neural commands and
/// configuration snapshots (§4.1, §6). Every call is retried on network/5xx
/// failure up to `max_retries`, bounded by an overall `deadline`; 4xx surfaces
/// immediately (§7).
pub struct TimeSeriesGateway {
    client: Client<HttpConnector, Full<Bytes>>,
    config: GatewayConfig,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    rows: Vec<HashMap<String, JsonValue>>,
}

impl TimeSeriesGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        TimeSeriesGateway { client, config }
    }

    async fn post_json(&self, path: &str, body: JsonValue, call_timeout: Duration) -> Result<JsonValue, ControlError> {
        let url = format!("{}{path}", self.config.base_url);
        let payload = serde_json::to_vec(&body).map_err(|e| ControlError::InternalError {
            msg: format!("failed to encode request body: {e}"),
        })?;

        let mut attempt = 0;
        let deadline_fut = timeout(self.config.deadline, async {
            loop {
                attempt += 1;
                let request = Request::builder()
                    .method(Method::POST)
                    .uri(&url)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(payload.clone())))
                    .map_err(|e| ControlError::InternalError {
                        msg: format!("failed to build request: {e}"),
                    })?;

                let response = match timeout(call_timeout, self.client.request(request)).await {
                    Ok(Ok(resp)) => resp,
                    Ok(Err(err)) => {
                        warn!("time-series request to {url} failed (attempt {attempt}): {err}");
                        if attempt > self.config.max_retries {
                            return Err(ControlError::UpstreamUnavailable {
                                msg: err.to_string(),
                            });
                        }
                        sleep(self.config.retry_delay).await;
                        continue;
                    }
                    Err(_) => {
                        return Err(ControlError::Timeout(call_timeout));
                    }
                };

                let status = response.status();
                if status.is_client_error() {
                    let body = collect_body(response).await.unwrap_or_default();
                    return Err(ControlError::BadInput {
                        field: path.to_string(),
                        msg: format!("{status}: {body}"),
                    });
                }
                if status.is_server_error() {
                    warn!("time-series {path} returned {status} (attempt {attempt})");
                    if attempt > self.config.max_retries {
                        return Err(ControlError::UpstreamUnavailable {
                            msg: format!("persistent {status}"),
                        });
                    }
                    sleep(self.config.retry_delay).await;
                    continue;
                }

                let body = collect_body(response).await.map_err(|e| ControlError::UpstreamUnavailable {
                    msg: format!("failed to read response body: {e}"),
                })?;
                if body.is_empty() {
                    return Ok(JsonValue::Null);
                }
                return serde_json::from_str(&body).map_err(|e| ControlError::UpstreamUnavailable {
                    msg: format!("malformed response body: {e}"),
                });
            }
        });

        match deadline_fut.await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout(self.config.deadline)),
        }
    }

    /// Most-recent query for `table` scoped to one equipment, widening the
    /// window once if the first pass returns nothing (§4.1).
    pub async fn query_recent(
        &self,
        table: &str,
        equipment_id: &EquipmentId,
        location_id: &LocationId,
        window: Duration,
    ) -> Result<Vec<HashMap<String, JsonValue>>, ControlError> {
        let rows = self
            .query_recent_window(table, equipment_id, location_id, window)
            .await?;
        if !rows.is_empty() {
            return Ok(rows);
        }
        let widened = window * FALLBACK_WINDOW_MULTIPLIER;
        debug!(
            "queryRecent({table}, {equipment_id}) empty at {window:?}, retrying with fallback window {widened:?}"
        );
        self.query_recent_window(table, equipment_id, location_id, widened)
            .await
    }

    async fn query_recent_window(
        &self,
        table: &str,
        equipment_id: &EquipmentId,
        location_id: &LocationId,
        window: Duration,
    ) -> Result<Vec<HashMap<String, JsonValue>>, ControlError> {
        let q = format!(
            "SELECT * FROM \"{table}\" WHERE equipment_id = '{equipment_id}' AND location_id = '{location_id}' AND time > now() - {}s ORDER BY time DESC LIMIT 1",
            window.as_secs()
        );
        let body = serde_json::json!({ "q": q, "db": DB_LOCATIONS });
        let value = self.post_json("/query", body, self.config.query_timeout).await?;
        let response: QueryResponse = serde_json::from_value(value).unwrap_or(QueryResponse { rows: vec![] });
        Ok(response.rows)
    }

    /// Equipment ids whose most-recent metrics carry `customLogicEnabled =
    /// true`, used to extend the working set beyond doc-store-enabled
    /// equipment (§4.8 step 1).
    pub async fn custom_logic_enabled_equipment(&self) -> Result<Vec<EquipmentId>, ControlError> {
        let q = format!(
            "SELECT DISTINCT equipment_id FROM \"{DB_LOCATIONS}\" WHERE customLogicEnabled = true AND time > now() - 3600s"
        );
        let body = serde_json::json!({ "q": q, "db": DB_LOCATIONS });
        let value = self.post_json("/query", body, self.config.query_timeout).await?;
        let response: QueryResponse = serde_json::from_value(value).unwrap_or(QueryResponse { rows: vec![] });
        Ok(response
            .rows
            .into_iter()
            .filter_map(|row| row.get("equipment_id").and_then(JsonValue::as_str).map(str::to_string))
            .collect())
    }

    /// Reads the most recent UI-originated override per command name (§4.1,
    /// §4.9 step 2).
    pub async fn read_ui_commands(
        &self,
        equipment_id: &EquipmentId,
        window: Duration,
    ) -> Result<HashMap<String, Value>, ControlError> {
        let q = format!(
            "SELECT * FROM \"{DB_UI_COMMANDS}\" WHERE equipment_id = '{equipment_id}' AND time > now() - {}s ORDER BY time DESC",
            window.as_secs()
        );
        let body = serde_json::json!({ "q": q, "db": DB_UI_COMMANDS });
        let value = self.post_json("/query", body, self.config.query_timeout).await?;
        let response: QueryResponse = serde_json::from_value(value).unwrap_or(QueryResponse { rows: vec![] });

        let mut latest: HashMap<String, Value> = HashMap::new();
        for row in response.rows {
            let Some(command) = row.get("command").and_then(JsonValue::as_str) else {
                continue;
            };
            if latest.contains_key(command) {
                continue;
            }
            let value = match row.get("value") {
                Some(JsonValue::Number(n)) => Value::Number(n.as_f64().unwrap_or(0.0)),
                Some(JsonValue::Bool(b)) => Value::Bool(*b),
                Some(JsonValue::String(s)) => Value::Text(s.clone()),
                _ => continue,
            };
            latest.insert(command.to_string(), value);
        }
        Ok(latest)
    }

    /// Writes a batch of neural commands as a single line-protocol payload
    /// (§4.9 step 5, §6 "Emitted record format").
    pub async fn write_commands(&self, batch: &[NeuralCommand]) -> Result<(), ControlError> {
        if batch.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = batch.iter().map(encode_neural_command).collect();
        let payload = lines.join("\n");
        trace!("writing {} neural command line(s)", batch.len());
        self.write_line_protocol(DB_NEURAL_COMMANDS, &payload).await
    }

    /// Writes a UI-originated command to the UI-command store, one field per
    /// setting plus the command name tag (§4.10 step 1).
    pub async fn write_ui_command(
        &self,
        equipment_id: &EquipmentId,
        location_id: &LocationId,
        user_id: &str,
        command_name: &str,
        settings: &HashMap<String, Value>,
    ) -> Result<(), ControlError> {
        let mut fields: Vec<String> = settings
            .iter()
            .map(|(key, value)| format!("{key}=\"{}\"", escape_field(&value.to_wire_string())))
            .collect();
        if fields.is_empty() {
            fields.push("applied=\"true\"".to_string());
        }
        let line = format!(
            "UIControlCommands,equipment_id={equipment_id},location_id={location_id},user_id={user_id},command={command_name} {}",
            fields.join(",")
        );
        self.write_line_protocol(DB_UI_COMMANDS, &line).await
    }

    pub async fn write_configuration_snapshot(
        &self,
        equipment_id: &EquipmentId,
        snapshot: &JsonValue,
    ) -> Result<(), ControlError> {
        let line = format!(
            "ConfigurationSnapshots,equipment_id={equipment_id} payload=\"{}\"",
            escape_field(&snapshot.to_string())
        );
        self.write_line_protocol(DB_NEURAL_COMMANDS, &line).await
    }

    pub async fn write_leadlag_event(
        &self,
        group_id: &GroupId,
        new_lead_id: &EquipmentId,
        reason: &str,
        event_type: &str,
    ) -> Result<(), ControlError> {
        let line = format!(
            "ControlCommands,group_id={group_id},event_type={event_type} new_lead_id=\"{new_lead_id}\",reason=\"{}\"",
            escape_field(reason)
        );
        self.write_line_protocol(DB_CONTROL_COMMANDS, &line).await
    }

    async fn write_line_protocol(&self, db: &str, payload: &str) -> Result<(), ControlError> {
        let body = serde_json::json!({ "db": db, "lines": payload });
        self.post_json("/write", body, self.config.write_timeout).await?;
        Ok(())
    }
}

/// Every value is serialized as a quoted string regardless of native type
/// (§3 "Neural command record", §6 "value typing" design note).
fn encode_neural_command(command: &NeuralCommand) -> String {
    format!(
        "NeuralCommands,equipment_id={},location_id={},command_type={},equipment_type={},source={},status={} value=\"{}\" {}",
        command.equipment_id,
        command.location_id,
        command.command_name,
        command.equipment_kind,
        command.source.factory_name(),
        command.status,
        escape_field(&command.value.to_wire_string()),
        command.timestamp.timestamp_nanos_opt().unwrap_or(0),
    )
}

fn escape_field(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

async fn collect_body(response: hyper::Response<hyper::body::Incoming>) -> Result<String, anyhow::Error> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CommandSource, Value};
    use crate::equipment::EquipmentKind;

    #[test]
    fn neural_command_values_are_always_quoted_strings() {
        let command = NeuralCommand::new(
            "eq-1".to_string(),
            "4".to_string(),
            EquipmentKind::BoilerComfort,
            "firing",
            Value::Number(1.0),
            CommandSource::Autonomous,
        );
        let line = encode_neural_command(&command);
        assert!(line.contains("value=\"1\""));
        assert!(line.starts_with("NeuralCommands,"));
    }

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(escape_field("he said \"hi\""), "he said \\\"hi\\\"");
    }

    #[test]
    fn neural_command_line_carries_nanosecond_timestamp() {
        let command = NeuralCommand::new(
            "eq-1".to_string(),
            "4".to_string(),
            EquipmentKind::BoilerComfort,
            "firing",
            Value::Number(1.0),
            CommandSource::Autonomous,
        );
        let line = encode_neural_command(&command);
        let timestamp = line.rsplit(' ').next().unwrap();
        assert_eq!(timestamp.parse::<i64>().unwrap(), command.timestamp.timestamp_nanos_opt().unwrap());
    }
}
