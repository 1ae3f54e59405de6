//! Baseboard management component / 基板管理组件
//!
//! Reads fans, power and sensors from the management controller and drives
//! fan speed through the thermal resource. Every control call fetches the
//! thermal entity tag once and sends it as `If-Match` with each patch.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{AttrMap, CommandTokens, ControlResult, Driver, Selector, SetupError};
use crate::agent::config::{AgentConfig, BmcConfig};
use crate::backends::redfish::RedfishBackend;
use crate::backends::{BoardBackend, BoardInventory};
use crate::constants::{attr, backend, command, component, MISSING_READING};
use crate::metrics::{GaugeFamily, InfoFamily, MetricSample};

struct BmcFamilies {
    machine_info: InfoFamily,
    fan_info: InfoFamily,
    fan_read: GaugeFamily,
    power_info: GaugeFamily,
    powersupply_power: GaugeFamily,
    threshold_sensors: InfoFamily,
    threshold_sensors_values: GaugeFamily,
    discrete_sensors: GaugeFamily,
}

impl BmcFamilies {
    fn new() -> Self {
        Self {
            machine_info: InfoFamily::new("bmc_machine_info", "Machine info in BMC", &[]),
            fan_info: InfoFamily::new("bmc_fan_info", "Fan info in BMC", &["index", "name"]),
            fan_read: GaugeFamily::new(
                "bmc_fan_read",
                "Fan read value in BMC",
                &["index", "name", "readingunits"],
            ),
            power_info: GaugeFamily::new("bmc_power_info", "Power info in BMC", &["component"]),
            powersupply_power: GaugeFamily::new(
                "bmc_powersupply_power",
                "PowerSupply info in BMC",
                &["index", "mode"],
            ),
            threshold_sensors: InfoFamily::new(
                "bmc_threshold_sensors",
                "Threshold sensors info in BMC.",
                &["name", "unit"],
            ),
            threshold_sensors_values: GaugeFamily::new(
                "bmc_threshold_sensors_values",
                "Threshold sensors data in BMC. None value will set to -1",
                &["name", "unit"],
            ),
            discrete_sensors: GaugeFamily::new(
                "bmc_discrete_sensors",
                "Discrete sensors data in BMC. 0 is Disable, 1 is Enable",
                &["name"],
            ),
        }
    }
}

/// Board management driver / 基板管理驱动
pub struct BmcDriver {
    backend: Option<Box<dyn BoardBackend>>,
    inventory: BoardInventory,
    families: BmcFamilies,
}

impl Default for BmcDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BmcDriver {
    /// Driver whose backend is chosen by `bmc.config` / 由 `bmc.config` 选择后端的驱动
    pub fn new() -> Self {
        Self {
            backend: None,
            inventory: BoardInventory::default(),
            families: BmcFamilies::new(),
        }
    }

    pub fn with_backend(backend: impl BoardBackend + 'static) -> Self {
        Self {
            backend: Some(Box::new(backend)),
            ..Self::new()
        }
    }

    fn backend_for(config: &BmcConfig) -> Result<Box<dyn BoardBackend>, SetupError> {
        match config.config.as_str() {
            backend::INSPUR_NF5280M6 => {
                let redfish = RedfishBackend::connect(
                    &config.host,
                    &config.user,
                    &config.passwd,
                    config.verify_tls,
                )?;
                Ok(Box::new(redfish))
            }
            other => Err(SetupError::UnsupportedBackend(other.to_string())),
        }
    }

    fn set_auto(&self, backend: &dyn BoardBackend, etag: &str) -> Result<(), String> {
        backend.set_fans_auto(etag).map_err(|e| {
            warn!(error = %e, "set fan control mode to auto failed");
            "bmc set auto failed".to_string()
        })
    }

    fn change_speed(
        &self,
        backend: &dyn BoardBackend,
        etag: &str,
        cursor: &mut CommandTokens<'_>,
    ) -> Result<(), String> {
        let Some([selector, speed]) = cursor.args(2) else {
            warn!("not specify fans or speed");
            return Err("bmc control failed".to_string());
        };
        let syntax_error = || "bmc change fan speed syntax error".to_string();
        let selector = Selector::parse(selector).map_err(|e| {
            warn!(error = %e, "parse error, check your syntax");
            syntax_error()
        })?;
        let ratio = speed
            .parse::<u32>()
            .ok()
            .filter(|r| *r <= 100)
            .ok_or_else(|| {
                warn!(%speed, "fan speed ratio must be a percentage");
                syntax_error()
            })?;
        let fans = selector.resolve(self.inventory.fan_count).map_err(|e| {
            warn!(error = %e, "set invalid fan index");
            "bmc fan index out of range".to_string()
        })?;
        for fan in fans {
            backend.set_fan_speed(etag, fan, ratio).map_err(|e| {
                warn!(fan, ratio, error = %e, "change fan speed failed");
                format!("bmc fan {fan} change speed failed")
            })?;
        }
        Ok(())
    }
}

fn or_missing(value: Option<f64>) -> f64 {
    value.unwrap_or(MISSING_READING)
}

impl Driver for BmcDriver {
    const NAME: &'static str = component::BMC;

    fn setup(&mut self, config: &AgentConfig) -> Result<(), SetupError> {
        if !config.bmc.enable {
            return Err(SetupError::Disabled);
        }
        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => Self::backend_for(&config.bmc)?,
        };
        let backend = self.backend.insert(backend);
        let inventory = match backend.discover() {
            Ok(inventory) => inventory,
            Err(e) => {
                if let Err(logout) = backend.logout() {
                    debug!(error = %logout, "logout after failed discovery");
                }
                return Err(e.into());
            }
        };
        info!(
            manufacturer = %inventory.manufacturer,
            model = %inventory.model,
            fans = inventory.fan_count,
            "management controller discovered"
        );
        self.inventory = inventory;
        Ok(())
    }

    fn teardown(&self) {
        if let Some(backend) = self.backend.as_deref() {
            if let Err(e) = backend.logout() {
                warn!(error = %e, "management controller logout failed");
            }
        }
        debug!("BMC component exit");
    }

    fn get_attrs(&self, names: &[String]) -> AttrMap {
        let mut attrs = AttrMap::new();
        let Some(backend) = self.backend.as_deref() else {
            return attrs;
        };
        for name in names {
            match name.as_str() {
                attr::CAUTO => {
                    if self.inventory.fan_count == 0 {
                        warn!("no fans");
                        continue;
                    }
                    match backend.fans() {
                        Ok(fans) => match fans.first() {
                            Some(fan) => {
                                attrs.insert(name.clone(), Value::Bool(fan.control_mode == "Auto"));
                            }
                            None => warn!("no fans"),
                        },
                        Err(e) => warn!(error = %e, "unable to read fan control mode"),
                    }
                }
                attr::FANNUMS => {
                    attrs.insert(name.clone(), Value::from(self.inventory.fan_count));
                }
                other => warn!(attr = other, "unknown BMC get attr config"),
            }
        }
        attrs
    }

    fn update(&self) -> Vec<MetricSample> {
        let Some(backend) = self.backend.as_deref() else {
            return Vec::new();
        };
        let f = &self.families;
        let mut samples = vec![f.machine_info.sample::<&str>(
            &[],
            &[
                ("manufacturer", self.inventory.manufacturer.clone()),
                ("model", self.inventory.model.clone()),
            ],
        )];

        match backend.fans() {
            Ok(fans) => {
                let mut reads = Vec::with_capacity(fans.len());
                for (i, fan) in fans.into_iter().enumerate() {
                    let idx = i.to_string();
                    reads.push(f.fan_read.sample(
                        &[idx.as_str(), fan.name.as_str(), fan.reading_units.as_str()],
                        or_missing(fan.reading),
                    ));
                    let speed_ratio = fan
                        .speed_ratio
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "None".to_string());
                    samples.push(f.fan_info.sample(
                        &[idx.as_str(), fan.name.as_str()],
                        &[
                            ("state", fan.state),
                            ("health", fan.health),
                            ("controlmode", fan.control_mode),
                            ("speedratio", speed_ratio),
                        ],
                    ));
                }
                samples.extend(reads);
            }
            Err(e) => warn!(error = %e, "unable to read fans"),
        }

        match backend.power() {
            Ok(power) => {
                for (component, watts) in [
                    ("cpu", power.cpu_watts),
                    ("mem", power.memory_watts),
                    ("fan", power.fan_watts),
                    ("total", power.total_watts),
                ] {
                    samples.push(f.power_info.sample(&[component], or_missing(watts)));
                }
                for (i, supply) in power.supplies.iter().enumerate() {
                    let idx = i.to_string();
                    samples.push(
                        f.powersupply_power
                            .sample(&[idx.as_str(), "input"], or_missing(supply.input_watts)),
                    );
                    samples.push(
                        f.powersupply_power
                            .sample(&[idx.as_str(), "output"], or_missing(supply.output_watts)),
                    );
                }
            }
            Err(e) => warn!(error = %e, "unable to read power"),
        }

        match backend.threshold_sensors() {
            Ok(sensors) => {
                let mut values = Vec::with_capacity(sensors.len());
                for sensor in sensors {
                    let labels = [sensor.name.as_str(), sensor.unit.as_str()];
                    values.push(
                        f.threshold_sensors_values
                            .sample(&labels, or_missing(sensor.reading)),
                    );
                    samples.push(
                        f.threshold_sensors
                            .sample(&labels, &[("status", sensor.status.clone())]),
                    );
                }
                samples.extend(values);
            }
            Err(e) => warn!(error = %e, "unable to read threshold sensors"),
        }

        match backend.discrete_sensors() {
            Ok(sensors) => {
                for sensor in sensors {
                    let value = if sensor.status == "Enable" { 1.0 } else { 0.0 };
                    samples.push(f.discrete_sensors.sample(&[sensor.name.as_str()], value));
                }
            }
            Err(e) => warn!(error = %e, "unable to read discrete sensors"),
        }

        samples
    }

    fn control(&self, tokens: &[String]) -> ControlResult {
        let Some(backend) = self.backend.as_deref() else {
            return ControlResult::error("bmc control failed");
        };
        if tokens.is_empty() {
            return ControlResult::success("bmc control success");
        }
        let etag = match backend.thermal_etag() {
            Ok(Some(etag)) => etag,
            Ok(None) => return ControlResult::error("Could not get If-Match"),
            Err(e) => {
                warn!(error = %e, "unable to fetch thermal resource");
                return ControlResult::error("Could not get If-Match");
            }
        };
        let mut cursor = CommandTokens::new(tokens);
        while let Some(op) = cursor.next_op() {
            let outcome = match op {
                command::SET_AUTO => self.set_auto(backend, &etag),
                command::CHANGE_SPEED => self.change_speed(backend, &etag, &mut cursor),
                other => {
                    warn!(op = other, "unknown BMC control command");
                    Err("bmc control failed".to_string())
                }
            };
            if let Err(message) = outcome {
                return ControlResult::error(message);
            }
        }
        ControlResult::success("bmc control success")
    }
}
