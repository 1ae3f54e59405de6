//! Redfish management controller backend
//! Redfish 管理控制器后端
//!
//! Talks to the vendor resource layout of the Inspur NF5280M6 family:
//! chassis `1`, fan control through the `Oem.Fans` object of the thermal
//! resource, guarded by the thermal resource's ETag.

use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, CONTENT_TYPE, ETAG, IF_MATCH, LOCATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    BackendError, BackendResult, BoardBackend, BoardInventory, DiscreteSensor, FanReading,
    PowerReading, PowerSupplyReading, ThresholdSensor,
};

const SESSIONS_PATH: &str = "/redfish/v1/SessionService/Sessions";
const CHASSIS_PATH: &str = "/redfish/v1/Chassis/1";
const THERMAL_PATH: &str = "/redfish/v1/Chassis/1/Thermal";
const POWER_PATH: &str = "/redfish/v1/Chassis/1/Power";
const THRESHOLD_SENSORS_PATH: &str = "/redfish/v1/Chassis/1/ThresholdSensors";
const DISCRETE_SENSORS_PATH: &str = "/redfish/v1/Chassis/1/DiscreteSensors";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Debug, Clone)]
struct Session {
    token: String,
    location: Option<String>,
}

/// Session-authenticated Redfish client / 基于会话认证的 Redfish 客户端
#[derive(Debug)]
pub struct RedfishBackend {
    client: Client,
    base_url: String,
    session: Mutex<Option<Session>>,
}

/// Turn a configured host into a base URL; bare hosts default to HTTPS.
/// 将配置的主机转换为基础 URL，未带协议时默认使用 HTTPS。
pub fn base_url_for(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

impl RedfishBackend {
    /// Build the client and open a session / 创建客户端并建立会话
    pub fn connect(host: &str, user: &str, password: &str, verify_tls: bool) -> BackendResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        let backend = Self {
            client,
            base_url: base_url_for(host),
            session: Mutex::new(None),
        };
        backend.login(user, password)?;
        Ok(backend)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn login(&self, user: &str, password: &str) -> BackendResult<()> {
        let resp = self
            .client
            .post(self.url(SESSIONS_PATH))
            .json(&json!({ "UserName": user, "Password": password }))
            .send()?;
        let resp = check_status(resp, "POST", SESSIONS_PATH)?;
        let token = header_value(resp.headers(), AUTH_TOKEN_HEADER)
            .ok_or_else(|| BackendError::Missing(format!("{AUTH_TOKEN_HEADER} header")))?;
        let location = header_value(resp.headers(), LOCATION.as_str());
        info!(base_url = %self.base_url, "Redfish session established");
        *self.session.lock() = Some(Session { token, location });
        Ok(())
    }

    fn token(&self) -> BackendResult<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| BackendError::Unavailable("no Redfish session".to_string()))
    }

    fn get(&self, path: &str) -> BackendResult<Response> {
        let resp = self
            .client
            .get(self.url(path))
            .header(AUTH_TOKEN_HEADER, self.token()?)
            .send()?;
        check_status(resp, "GET", path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> BackendResult<T> {
        Ok(self.get(path)?.json::<T>()?)
    }

    fn patch_thermal(&self, etag: &str, body: Value) -> BackendResult<()> {
        debug!(body = %body, "Redfish thermal patch");
        let resp = self
            .client
            .patch(self.url(THERMAL_PATH))
            .header(AUTH_TOKEN_HEADER, self.token()?)
            .header(IF_MATCH, etag)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()?;
        check_status(resp, "PATCH", THERMAL_PATH).map(|_| ())
    }
}

fn check_status(resp: Response, method: &'static str, path: &str) -> BackendResult<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(BackendError::Status {
            method,
            path: path.to_string(),
            status: resp.status().as_u16(),
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Controllers disagree on whether readings are numbers or strings.
fn number(value: &Option<Value>) -> Option<f64> {
    match value.as_ref()? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: &Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawChassis {
    manufacturer: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawThermal {
    #[serde(default)]
    fans: Vec<RawFan>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStatus {
    state: Option<String>,
    health: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawFan {
    name: Option<String>,
    status: Option<RawStatus>,
    reading: Option<Value>,
    reading_units: Option<String>,
    oem: Option<RawFanOem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawFanOem {
    public: Option<RawFanPublic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawFanPublic {
    control_mode: Option<String>,
    speed_ratio: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPower {
    #[serde(default)]
    power_supplies: Vec<RawPowerSupply>,
    oem: Option<RawPowerOem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPowerSupply {
    power_output_watts: Option<Value>,
    power_input_watts: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPowerOem {
    public: Option<RawPowerPublic>,
}

#[derive(Debug, Deserialize)]
struct RawPowerPublic {
    #[serde(rename = "CurrentCPUPowerWatts")]
    cpu: Option<Value>,
    #[serde(rename = "CurrentMemoryPowerWatts")]
    memory: Option<Value>,
    #[serde(rename = "CurrentFANPowerWatts")]
    fan: Option<Value>,
    #[serde(rename = "TotalPower")]
    total: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSensors<T> {
    #[serde(default = "Vec::new")]
    sensors: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawThresholdSensor {
    name: Option<String>,
    status: Option<Value>,
    #[serde(rename = "unit")]
    unit: Option<String>,
    reading_value: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDiscreteSensor {
    name: Option<String>,
    status: Option<Value>,
}

impl BoardBackend for RedfishBackend {
    fn discover(&self) -> BackendResult<BoardInventory> {
        let thermal: RawThermal = self.get_json(THERMAL_PATH)?;
        let chassis: RawChassis = self.get_json(CHASSIS_PATH)?;
        Ok(BoardInventory {
            manufacturer: chassis.manufacturer.unwrap_or_default(),
            model: chassis.model.unwrap_or_default(),
            fan_count: thermal.fans.len(),
        })
    }

    fn fans(&self) -> BackendResult<Vec<FanReading>> {
        let thermal: RawThermal = self.get_json(THERMAL_PATH)?;
        Ok(thermal
            .fans
            .into_iter()
            .map(|fan| {
                let status = fan.status.unwrap_or_default();
                let public = fan.oem.and_then(|o| o.public);
                FanReading {
                    name: fan.name.unwrap_or_default(),
                    state: status.state.unwrap_or_default(),
                    health: status.health.unwrap_or_default(),
                    reading: number(&fan.reading),
                    reading_units: fan.reading_units.unwrap_or_default(),
                    control_mode: public
                        .as_ref()
                        .and_then(|p| p.control_mode.clone())
                        .unwrap_or_default(),
                    speed_ratio: public.as_ref().and_then(|p| number(&p.speed_ratio)),
                }
            })
            .collect())
    }

    fn power(&self) -> BackendResult<PowerReading> {
        let power: RawPower = self.get_json(POWER_PATH)?;
        let public = power.oem.and_then(|o| o.public);
        Ok(PowerReading {
            supplies: power
                .power_supplies
                .iter()
                .map(|s| PowerSupplyReading {
                    input_watts: number(&s.power_input_watts),
                    output_watts: number(&s.power_output_watts),
                })
                .collect(),
            cpu_watts: public.as_ref().and_then(|p| number(&p.cpu)),
            memory_watts: public.as_ref().and_then(|p| number(&p.memory)),
            fan_watts: public.as_ref().and_then(|p| number(&p.fan)),
            total_watts: public.as_ref().and_then(|p| number(&p.total)),
        })
    }

    fn threshold_sensors(&self) -> BackendResult<Vec<ThresholdSensor>> {
        let doc: RawSensors<RawThresholdSensor> = self.get_json(THRESHOLD_SENSORS_PATH)?;
        Ok(doc
            .sensors
            .into_iter()
            .map(|s| ThresholdSensor {
                name: s.name.unwrap_or_default(),
                unit: s.unit.unwrap_or_default(),
                status: text(&s.status),
                reading: number(&s.reading_value),
            })
            .collect())
    }

    fn discrete_sensors(&self) -> BackendResult<Vec<DiscreteSensor>> {
        let doc: RawSensors<RawDiscreteSensor> = self.get_json(DISCRETE_SENSORS_PATH)?;
        Ok(doc
            .sensors
            .into_iter()
            .map(|s| DiscreteSensor {
                name: s.name.unwrap_or_default(),
                status: text(&s.status),
            })
            .collect())
    }

    fn thermal_etag(&self) -> BackendResult<Option<String>> {
        let resp = self.get(THERMAL_PATH)?;
        Ok(header_value(resp.headers(), ETAG.as_str()))
    }

    fn set_fans_auto(&self, etag: &str) -> BackendResult<()> {
        self.patch_thermal(etag, json!({ "Oem": { "Fans": { "ControlMode": "Auto" } } }))
    }

    fn set_fan_speed(&self, etag: &str, fan: usize, ratio: u32) -> BackendResult<()> {
        self.patch_thermal(
            etag,
            json!({
                "Oem": {
                    "Fans": {
                        "ControlMode": "Manual",
                        "MemberId": fan,
                        "SpeedRatio": ratio,
                    }
                }
            }),
        )
    }

    fn logout(&self) -> BackendResult<()> {
        let Some(session) = self.session.lock().take() else {
            return Err(BackendError::Unavailable("no Redfish session".to_string()));
        };
        let Some(location) = session.location else {
            return Ok(());
        };
        let resp = self
            .client
            .delete(self.url(&location))
            .header(AUTH_TOKEN_HEADER, session.token)
            .send()?;
        check_status(resp, "DELETE", &location).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_for_host() {
        assert_eq!(base_url_for("10.0.0.5"), "https://10.0.0.5");
        assert_eq!(base_url_for("http://127.0.0.1:8000/"), "http://127.0.0.1:8000");
        assert_eq!(base_url_for(" https://bmc.local "), "https://bmc.local");
    }

    #[test]
    fn test_number_accepts_strings_and_null() {
        assert_eq!(number(&Some(json!(12.5))), Some(12.5));
        assert_eq!(number(&Some(json!("40"))), Some(40.0));
        assert_eq!(number(&Some(Value::Null)), None);
        assert_eq!(number(&None), None);
    }

    #[test]
    fn test_thermal_document_parsing() {
        let doc: RawThermal = serde_json::from_value(json!({
            "Fans": [{
                "Name": "FAN0_F_Speed",
                "Status": {"State": "Enabled", "Health": "OK"},
                "Reading": 4200,
                "ReadingUnits": "RPM",
                "Oem": {"Public": {"ControlMode": "Auto", "SpeedRatio": 35}}
            }]
        }))
        .unwrap();
        assert_eq!(doc.fans.len(), 1);
        let public = doc.fans[0].oem.as_ref().unwrap().public.as_ref().unwrap();
        assert_eq!(public.control_mode.as_deref(), Some("Auto"));
    }
}
