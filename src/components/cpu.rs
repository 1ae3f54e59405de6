//! Processor frequency scaling component / 处理器频率调节组件
//!
//! Telemetry comes from cpufreq sysfs and `/proc`; control writes the
//! scaling governor and, for pinned frequencies, `scaling_setspeed`.

use std::cell::RefCell;

use serde_json::json;
use tracing::{debug, info, warn};

use super::{AttrMap, CommandTokens, ControlResult, Driver, Selector, SetupError};
use crate::agent::config::AgentConfig;
use crate::backends::sysfs::SysfsCpuFreq;
use crate::backends::{CpuFreqBackend, CpuFreqCapabilities, CpuTimes, CpuTimesTable};
use crate::constants::{attr, command, component, USERSPACE_GOVERNOR};
use crate::metrics::{GaugeFamily, InfoFamily, MetricSample};

/// Kernel clock ticks per second for `/proc/stat` / `/proc/stat` 的时钟频率
const USER_HZ: f64 = 100.0;

struct CpuFamilies {
    freqs: GaugeFamily,
    utils: GaugeFamily,
    scaling_govs: InfoFamily,
    seconds_total: GaugeFamily,
    loadavg: GaugeFamily,
}

impl CpuFamilies {
    fn new() -> Self {
        Self {
            freqs: GaugeFamily::new("cpu_freqs", "CPU frequencies in kHz", &["cpu", "mode"]),
            utils: GaugeFamily::new("cpu_utils", "CPU utilization in percentage", &["cpu"]),
            scaling_govs: InfoFamily::new(
                "cpu_scaling_govs",
                "Current scaling governors",
                &["cpu"],
            ),
            seconds_total: GaugeFamily::new(
                "cpu_seconds_total",
                "Seconds the CPUs spent in each mode.",
                &["cpu", "mode"],
            ),
            loadavg: GaugeFamily::new("cpu_loadavg", "Load average", &["m"]),
        }
    }
}

/// cpufreq driver / cpufreq 驱动
pub struct CpuDriver {
    backend: Option<Box<dyn CpuFreqBackend>>,
    capabilities: CpuFreqCapabilities,
    previous_times: RefCell<Option<CpuTimesTable>>,
    families: CpuFamilies,
}

impl Default for CpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDriver {
    /// Driver that reads the host's sysfs once set up / 启动后读取本机 sysfs 的驱动
    pub fn new() -> Self {
        Self {
            backend: None,
            capabilities: CpuFreqCapabilities::default(),
            previous_times: RefCell::new(None),
            families: CpuFamilies::new(),
        }
    }

    /// Driver over an explicit backend / 使用指定后端的驱动
    pub fn with_backend(backend: impl CpuFreqBackend + 'static) -> Self {
        Self {
            backend: Some(Box::new(backend)),
            ..Self::new()
        }
    }

    fn change_gov(&self, backend: &dyn CpuFreqBackend, cursor: &mut CommandTokens<'_>) -> Result<(), String> {
        let Some([selector, governor]) = cursor.args(2) else {
            warn!("change cpu gov command wrong");
            return Err("cpu control failed".to_string());
        };
        if !self.capabilities.available_governors.contains(governor) {
            return Err(format!("no chosen governors {governor}"));
        }
        let targets = self.targets(selector, "cpu change gov syntax error")?;
        for cpu in targets {
            backend.set_governor(cpu, governor).map_err(|e| {
                warn!(cpu, %governor, error = %e, "failed to set scaling governor");
                format!("cpu {cpu} change gov failed")
            })?;
        }
        Ok(())
    }

    fn change_freq(&self, backend: &dyn CpuFreqBackend, cursor: &mut CommandTokens<'_>) -> Result<(), String> {
        let Some([selector, frequency]) = cursor.args(2) else {
            warn!("change cpu freq command wrong");
            return Err("cpu control failed".to_string());
        };
        let caps = &self.capabilities;
        if !caps.available_frequencies.contains(frequency)
            || !caps.available_governors.iter().any(|g| g == USERSPACE_GOVERNOR)
        {
            return Err(format!("no chosen freq {frequency} or gov userspace"));
        }
        let targets = self.targets(selector, "cpu change freq syntax error")?;
        for cpu in targets {
            backend
                .set_governor(cpu, USERSPACE_GOVERNOR)
                .and_then(|_| backend.set_speed(cpu, frequency))
                .map_err(|e| {
                    warn!(cpu, %frequency, error = %e, "failed to pin cpu frequency");
                    format!("cpu {cpu} change freq failed")
                })?;
        }
        Ok(())
    }

    fn targets(&self, selector: &str, syntax_error: &str) -> Result<Vec<usize>, String> {
        let selector = Selector::parse(selector).map_err(|e| {
            warn!(error = %e, "parse error, check your syntax");
            syntax_error.to_string()
        })?;
        selector
            .resolve(self.capabilities.cpu_count)
            .map_err(|e| {
                warn!(error = %e, "cpu selector out of range");
                "cpu index out of range".to_string()
            })
    }
}

/// Busy percentage between two samples, `None` without elapsed ticks.
fn utilization(previous: &CpuTimes, current: &CpuTimes) -> Option<f64> {
    let total = current.total().saturating_sub(previous.total());
    if total == 0 {
        return None;
    }
    let idle = current
        .idle_total()
        .saturating_sub(previous.idle_total())
        .min(total);
    Some(100.0 * (total - idle) as f64 / total as f64)
}

impl Driver for CpuDriver {
    const NAME: &'static str = component::CPU;

    fn setup(&mut self, config: &AgentConfig) -> Result<(), SetupError> {
        if !config.cpu.enable {
            return Err(SetupError::Disabled);
        }
        let backend = self
            .backend
            .get_or_insert_with(|| Box::new(SysfsCpuFreq::default()) as Box<dyn CpuFreqBackend>);
        let capabilities = backend.discover()?;
        info!(
            cpus = capabilities.cpu_count,
            driver = %capabilities.scaling_driver,
            governors = ?capabilities.available_governors,
            "cpufreq discovered"
        );
        // Baseline so the first scrape already reports utilization.
        match backend.cpu_times() {
            Ok(times) => *self.previous_times.get_mut() = Some(times),
            Err(e) => debug!(error = %e, "no cpu times baseline"),
        }
        self.capabilities = capabilities;
        Ok(())
    }

    fn teardown(&self) {
        debug!("CPU component exit");
    }

    fn get_attrs(&self, names: &[String]) -> AttrMap {
        let mut attrs = AttrMap::new();
        for name in names {
            match name.as_str() {
                attr::CPUFREQS => {
                    let caps = &self.capabilities;
                    attrs.insert(
                        name.clone(),
                        json!({
                            "ava_governors": caps.available_governors,
                            "ava_freqs": caps.available_frequencies,
                            "cpunums": caps.cpu_count,
                        }),
                    );
                }
                other => debug!(attr = other, "unknown cpu attribute"),
            }
        }
        attrs
    }

    fn update(&self) -> Vec<MetricSample> {
        let Some(backend) = self.backend.as_deref() else {
            return Vec::new();
        };
        let f = &self.families;
        let count = self.capabilities.cpu_count;

        let mut freqs = Vec::with_capacity(count * 3);
        let mut govs = Vec::with_capacity(count);
        for cpu in 0..count {
            match backend.frequency(cpu) {
                Ok(freq) => {
                    let id = cpu.to_string();
                    freqs.push(f.freqs.sample(&[id.as_str(), "current"], freq.current));
                    freqs.push(f.freqs.sample(&[id.as_str(), "min"], freq.min));
                    freqs.push(f.freqs.sample(&[id.as_str(), "max"], freq.max));
                }
                Err(e) => warn!(cpu, error = %e, "unable to read cpu frequency"),
            }
            match backend.governor(cpu) {
                Ok(governor) => {
                    govs.push(f.scaling_govs.sample(&[cpu], &[("governors", governor)]))
                }
                Err(e) => warn!(cpu, error = %e, "unable to read scaling governor"),
            }
        }

        let mut utils = Vec::with_capacity(count);
        let mut seconds = Vec::with_capacity(count * 8);
        match backend.cpu_times() {
            Ok(times) => {
                let mut previous = self.previous_times.borrow_mut();
                for cpu in 0..count {
                    let Some(t) = times.get(&cpu) else {
                        warn!(cpu, "no /proc/stat row for cpu, is it offline?");
                        continue;
                    };
                    let id = cpu.to_string();
                    if let Some(u) = previous
                        .as_ref()
                        .and_then(|p| p.get(&cpu))
                        .and_then(|p| utilization(p, t))
                    {
                        utils.push(f.utils.sample(&[id.as_str()], u));
                    }
                    for (mode, ticks) in [
                        ("user", t.user),
                        ("nice", t.nice),
                        ("system", t.system),
                        ("idle", t.idle),
                        ("iowait", t.iowait),
                        ("irq", t.irq),
                        ("softirq", t.softirq),
                        ("steal", t.steal),
                    ] {
                        seconds.push(
                            f.seconds_total
                                .sample(&[id.as_str(), mode], ticks as f64 / USER_HZ),
                        );
                    }
                }
                *previous = Some(times);
            }
            Err(e) => warn!(error = %e, "unable to read cpu times"),
        }

        let mut loadavg = Vec::with_capacity(3);
        match backend.load_average() {
            Ok(avgs) => {
                for (m, v) in ["1", "5", "15"].into_iter().zip(avgs) {
                    loadavg.push(f.loadavg.sample(&[m], v));
                }
            }
            Err(e) => warn!(error = %e, "unable to read load average"),
        }

        freqs
            .into_iter()
            .chain(utils)
            .chain(govs)
            .chain(seconds)
            .chain(loadavg)
            .collect()
    }

    fn control(&self, tokens: &[String]) -> ControlResult {
        let Some(backend) = self.backend.as_deref() else {
            return ControlResult::error("cpu control failed");
        };
        let mut cursor = CommandTokens::new(tokens);
        while let Some(op) = cursor.next_op() {
            let outcome = match op {
                command::CHANGE_GOV => self.change_gov(backend, &mut cursor),
                command::CHANGE_FREQ => self.change_freq(backend, &mut cursor),
                other => {
                    warn!(op = other, "unknown CPU control command");
                    Err("cpu control failed".to_string())
                }
            };
            if let Err(message) = outcome {
                return ControlResult::error(message);
            }
        }
        ControlResult::success("cpu control success")
    }
}
