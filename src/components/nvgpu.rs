//! NVIDIA accelerator component / NVIDIA 加速器组件

use std::cell::RefCell;
use std::collections::HashSet;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{AttrMap, CommandTokens, ControlResult, Driver, Selector, SetupError};
use crate::agent::config::AgentConfig;
#[cfg(feature = "nvml")]
use crate::backends::nvml::NvmlBackend;
use crate::backends::{
    AcceleratorBackend, AcceleratorInventory, BackendResult, ClockDomain, ClockKind,
    TemperatureSensorKind,
};
use crate::constants::{attr, backend, command, component, MISSING_READING};
use crate::metrics::{GaugeFamily, InfoFamily, MetricSample};

struct NvgpuFamilies {
    sysinfo: InfoFamily,
    gpuinfo: InfoFamily,
    fan_speed: GaugeFamily,
    appclk: GaugeFamily,
    clk: GaugeFamily,
    compute_mode: InfoFamily,
    perf: GaugeFamily,
    persis_mode: InfoFamily,
    power: GaugeFamily,
    util: GaugeFamily,
    temp: GaugeFamily,
    mem: GaugeFamily,
}

impl NvgpuFamilies {
    fn new() -> Self {
        Self {
            sysinfo: InfoFamily::new("nvgpu_sysinfo", "NVGPU System information from nvml.", &[]),
            gpuinfo: InfoFamily::new("nvgpu_gpuinfo", "NVGPU information from nvml.", &["index"]),
            fan_speed: GaugeFamily::new(
                "nvgpu_fan_speed",
                "NVGPU Fan Speed from nvml. (percentage)",
                &["index", "fan", "mode"],
            ),
            appclk: GaugeFamily::new(
                "nvgpu_appclk",
                "NVGPU Applications Clock information from nvml. (MHz)",
                &["index", "type"],
            ),
            clk: GaugeFamily::new(
                "nvgpu_clk",
                "NVGPU Clock information from nvml. (MHz)",
                &["index", "type", "id"],
            ),
            compute_mode: InfoFamily::new(
                "nvgpu_compute_mode",
                "NVGPU Compute Mode information from nvml.",
                &["index"],
            ),
            perf: GaugeFamily::new(
                "nvgpu_perf",
                "NVGPU Performance State information from nvml. Value indicates P<value>",
                &["index"],
            ),
            persis_mode: InfoFamily::new(
                "nvgpu_persis_mode",
                "NVGPU Persistence Mode information from nvml.",
                &["index"],
            ),
            power: GaugeFamily::new(
                "nvgpu_power",
                "NVGPU Power information from nvml (milliwatt).",
                &["index", "mode"],
            ),
            util: GaugeFamily::new(
                "nvgpu_util",
                "NVGPU Utilization Rates information from nvml. (percentage)",
                &["index", "type"],
            ),
            temp: GaugeFamily::new(
                "nvgpu_temp",
                "NVGPU Temperature information from nvml in Celsius format.",
                &["index", "type"],
            ),
            mem: GaugeFamily::new("nvgpu_mem", "NVGPU Memory from nvml (bytes).", &["index", "mode"]),
        }
    }
}

/// Reads a device may not support; skipped after their first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OptionalRead {
    AppClock(ClockDomain),
    Clock(ClockDomain, ClockKind),
    Temperature(TemperatureSensorKind),
}

/// Accelerator driver / 加速器驱动
pub struct NvgpuDriver {
    backend: RefCell<Option<Box<dyn AcceleratorBackend>>>,
    inventory: AcceleratorInventory,
    families: NvgpuFamilies,
    skipped: RefCell<HashSet<(usize, OptionalRead)>>,
}

impl Default for NvgpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NvgpuDriver {
    /// Driver whose backend is chosen by `nvgpu.config` / 由 `nvgpu.config` 选择后端的驱动
    pub fn new() -> Self {
        Self {
            backend: RefCell::new(None),
            inventory: AcceleratorInventory::default(),
            families: NvgpuFamilies::new(),
            skipped: RefCell::new(HashSet::new()),
        }
    }

    pub fn with_backend(backend: impl AcceleratorBackend + 'static) -> Self {
        Self {
            backend: RefCell::new(Some(Box::new(backend))),
            ..Self::new()
        }
    }

    fn backend_for(variant: &str) -> Result<Box<dyn AcceleratorBackend>, SetupError> {
        match variant {
            #[cfg(feature = "nvml")]
            backend::NVML => Ok(Box::new(NvmlBackend::new())),
            other => Err(SetupError::UnsupportedBackend(other.to_string())),
        }
    }

    /// Runs `read` unless it already failed for this device.
    fn optional_read(
        &self,
        index: usize,
        what: OptionalRead,
        read: impl FnOnce() -> BackendResult<u32>,
    ) -> Option<u32> {
        if self.skipped.borrow().contains(&(index, what)) {
            return None;
        }
        match read() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(index, read = ?what, error = %e, "GPU reading not supported, will skip it");
                self.skipped.borrow_mut().insert((index, what));
                None
            }
        }
    }

    fn change_pl(&self, backend: &dyn AcceleratorBackend, cursor: &mut CommandTokens<'_>) -> Result<(), String> {
        let Some([selector, watts]) = cursor.args(2) else {
            warn!("change nvgpu powerlimit command wrong");
            return Err("nvgpu control failed".to_string());
        };
        let syntax_error = || "nvgpu change pl syntax error".to_string();
        let selector = Selector::parse(selector).map_err(|e| {
            warn!(error = %e, "parse error, check your syntax");
            syntax_error()
        })?;
        let milliwatts = watts
            .parse::<u32>()
            .ok()
            .and_then(|w| w.checked_mul(1000))
            .ok_or_else(|| {
                warn!(%watts, "power limit is not a whole number of watts");
                syntax_error()
            })?;
        let targets = selector
            .resolve(self.inventory.devices.len())
            .map_err(|e| {
                warn!(error = %e, "set invalid NVGPU index");
                "set nvgpu index out of range".to_string()
            })?;
        for index in targets {
            backend.set_power_limit(index, milliwatts).map_err(|e| {
                warn!(index, milliwatts, error = %e, "change NVGPU powerlimit failed");
                format!("nvgpu {index} change pl failed")
            })?;
        }
        Ok(())
    }
}

impl Driver for NvgpuDriver {
    const NAME: &'static str = component::NVGPU;

    fn setup(&mut self, config: &AgentConfig) -> Result<(), SetupError> {
        if !config.nvgpu.enable {
            return Err(SetupError::Disabled);
        }
        let slot = self.backend.get_mut();
        let backend = match slot.take() {
            Some(backend) => backend,
            None => Self::backend_for(&config.nvgpu.config)?,
        };
        let backend = slot.insert(backend);
        let inventory = match backend.discover() {
            Ok(inventory) => inventory,
            Err(e) => {
                if let Err(shutdown) = backend.shutdown() {
                    debug!(error = %shutdown, "no accelerator handle to release");
                }
                return Err(e.into());
            }
        };
        info!(
            gpus = inventory.devices.len(),
            driver = %inventory.driver_version,
            cuda = %inventory.cuda_version,
            "accelerators discovered"
        );
        self.inventory = inventory;
        self.skipped.get_mut().clear();
        Ok(())
    }

    fn teardown(&self) {
        if let Some(backend) = self.backend.borrow_mut().as_mut() {
            if let Err(e) = backend.shutdown() {
                warn!(error = %e, "accelerator shutdown failed");
            }
        }
        debug!("NVGPU component exit");
    }

    fn get_attrs(&self, names: &[String]) -> AttrMap {
        let mut attrs = AttrMap::new();
        for name in names {
            match name.as_str() {
                attr::PLC => {
                    // Per-device power limit constraints
                    let plc: Vec<Value> = self
                        .inventory
                        .devices
                        .iter()
                        .map(|d| match d.power_constraints {
                            Some(c) => json!([c.min_mw, c.max_mw]),
                            None => Value::Null,
                        })
                        .collect();
                    attrs.insert(name.clone(), Value::Array(plc));
                }
                other => warn!(attr = other, "unknown NVGPU get attr command"),
            }
        }
        attrs
    }

    fn update(&self) -> Vec<MetricSample> {
        let guard = self.backend.borrow();
        let Some(backend) = guard.as_deref() else {
            return Vec::new();
        };
        let f = &self.families;
        let inv = &self.inventory;

        let mut sysinfo = vec![f.sysinfo.sample::<&str>(
            &[],
            &[
                ("driver_v", inv.driver_version.clone()),
                ("cuda_v", inv.cuda_version.clone()),
                ("nvml_v", inv.library_version.clone()),
            ],
        )];
        let mut gpuinfo = Vec::new();
        let mut fans = Vec::new();
        let mut appclk = Vec::new();
        let mut clk = Vec::new();
        let mut compute_mode = Vec::new();
        let mut perf = Vec::new();
        let mut persis_mode = Vec::new();
        let mut power = Vec::new();
        let mut util = Vec::new();
        let mut temp = Vec::new();
        let mut mem = Vec::new();

        for (i, device) in inv.devices.iter().enumerate() {
            let idx = i.to_string();
            let idx = idx.as_str();

            match backend.identity(i) {
                Ok(id) => gpuinfo.push(f.gpuinfo.sample(
                    &[idx],
                    &[("uuid", id.uuid), ("name", id.name), ("bus_type", id.bus_type)],
                )),
                Err(e) => warn!(index = i, error = %e, "unable to read GPU identity"),
            }

            for fan in 0..device.fan_count {
                let fan_label = fan.to_string();
                match backend.fan_speed(i, fan) {
                    Ok(speed) => fans.push(f.fan_speed.sample(
                        &[idx, fan_label.as_str(), "current"],
                        speed as f64,
                    )),
                    Err(e) => warn!(index = i, fan, error = %e, "unable to read GPU fan speed"),
                }
                if let Some((min, max)) = device.fan_speed_range {
                    fans.push(f.fan_speed.sample(&[idx, fan_label.as_str(), "min"], min as f64));
                    fans.push(f.fan_speed.sample(&[idx, fan_label.as_str(), "max"], max as f64));
                }
            }

            for domain in ClockDomain::ALL {
                let read = OptionalRead::AppClock(domain);
                if let Some(mhz) = self.optional_read(i, read, || backend.applications_clock(i, domain)) {
                    appclk.push(f.appclk.sample(&[idx, domain.label()], mhz as f64));
                }
                for kind in ClockKind::ALL {
                    let read = OptionalRead::Clock(domain, kind);
                    if let Some(mhz) = self.optional_read(i, read, || backend.clock(i, domain, kind)) {
                        clk.push(f.clk.sample(&[idx, domain.label(), kind.label()], mhz as f64));
                    }
                }
            }

            match backend.compute_mode(i) {
                Ok(mode) => compute_mode.push(
                    f.compute_mode
                        .sample(&[idx], &[("mode", mode.label().to_string())]),
                ),
                Err(e) => warn!(index = i, error = %e, "unable to read GPU compute mode"),
            }

            match backend.performance_state(i) {
                Ok(state) => perf.push(f.perf.sample(
                    &[idx],
                    state.map_or(MISSING_READING, |p| p as f64),
                )),
                Err(e) => warn!(index = i, error = %e, "unable to read GPU performance state"),
            }

            match backend.persistence_mode(i) {
                Ok(enabled) => {
                    let mode = if enabled { "ON" } else { "OFF" };
                    persis_mode.push(f.persis_mode.sample(&[idx], &[("mode", mode.to_string())]));
                }
                Err(e) => warn!(index = i, error = %e, "unable to read GPU persistence mode"),
            }

            if let Some(c) = device.power_constraints {
                power.push(f.power.sample(&[idx, "min"], c.min_mw as f64));
                power.push(f.power.sample(&[idx, "max"], c.max_mw as f64));
            }
            match backend.power_usage(i) {
                Ok(mw) => power.push(f.power.sample(&[idx, "usage"], mw as f64)),
                Err(e) => warn!(index = i, error = %e, "unable to read GPU power usage"),
            }
            match backend.enforced_power_limit(i) {
                Ok(mw) => power.push(f.power.sample(&[idx, "enforce_limit"], mw as f64)),
                Err(e) => warn!(index = i, error = %e, "unable to read GPU enforced power limit"),
            }

            match backend.utilization(i) {
                Ok(u) => {
                    util.push(f.util.sample(&[idx, "GPU"], u.gpu as f64));
                    util.push(f.util.sample(&[idx, "MEMORY"], u.memory as f64));
                }
                Err(e) => warn!(index = i, error = %e, "unable to read GPU utilization"),
            }

            for sensor in TemperatureSensorKind::ALL {
                let read = OptionalRead::Temperature(sensor);
                if let Some(t) = self.optional_read(i, read, || backend.temperature(i, sensor)) {
                    temp.push(f.temp.sample(&[idx, sensor.label()], t as f64));
                }
            }

            match backend.memory(i) {
                Ok(m) => {
                    mem.push(f.mem.sample(&[idx, "total"], m.total as f64));
                    mem.push(f.mem.sample(&[idx, "free"], m.free as f64));
                    mem.push(f.mem.sample(&[idx, "used"], m.used as f64));
                }
                Err(e) => warn!(index = i, error = %e, "unable to read GPU memory"),
            }
        }

        for batch in [
            gpuinfo,
            fans,
            appclk,
            clk,
            compute_mode,
            perf,
            persis_mode,
            power,
            util,
            temp,
            mem,
        ] {
            sysinfo.extend(batch);
        }
        sysinfo
    }

    fn control(&self, tokens: &[String]) -> ControlResult {
        let guard = self.backend.borrow();
        let Some(backend) = guard.as_deref() else {
            return ControlResult::error("nvgpu control failed");
        };
        let mut cursor = CommandTokens::new(tokens);
        while let Some(op) = cursor.next_op() {
            let outcome = match op {
                command::CHANGE_PL => self.change_pl(backend, &mut cursor),
                other => {
                    warn!(op = other, "unknown NVGPU control command");
                    Err("nvgpu control failed".to_string())
                }
            };
            if let Err(message) = outcome {
                return ControlResult::error(message);
            }
        }
        ControlResult::success("nvgpu control success")
    }
}
