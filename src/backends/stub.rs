//! In-memory backends for tests and hardware-less runs
//! 用于测试和无硬件运行的内存后端
//!
//! Every stub records its writes into a shared log so callers can observe
//! exactly which sub-resources a control command touched. Reads can be made
//! slow to expose overlapping critical sections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    AcceleratorBackend, AcceleratorDevice, AcceleratorInventory, BackendError, BackendResult,
    BoardBackend, BoardInventory, ClockDomain, ClockKind, ComputeMode, CpuFreqBackend,
    CpuFreqCapabilities, CpuFrequency, CpuTimes, CpuTimesTable, DeviceIdentity, DeviceMemory,
    DeviceUtilization, DiscreteSensor, FanReading, PowerConstraints, PowerReading,
    PowerSupplyReading, TemperatureSensorKind, ThresholdSensor,
};

/// Shared ordered record of backend writes / 共享的后端写入记录
pub type WriteLog = Arc<Mutex<Vec<String>>>;

/// Tracks how many callers are inside a backend call at once
/// 统计同时处于后端调用中的调用者数量
#[derive(Debug, Clone, Default)]
pub struct OverlapMeter {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl OverlapMeter {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Highest number of concurrent callers observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn injected(what: &str) -> BackendError {
    BackendError::Unavailable(format!("injected failure: {what}"))
}

// ---------------------------------------------------------------------------

/// cpufreq stub / cpufreq 桩
#[derive(Debug, Clone)]
pub struct StubCpuFreq {
    pub capabilities: CpuFreqCapabilities,
    pub fail_discovery: bool,
    pub fail_write_on: Option<usize>,
    /// CPUs missing from the tick counters.
    pub offline: Vec<usize>,
    pub writes: WriteLog,
    pub overlap: OverlapMeter,
    ticks: Arc<AtomicUsize>,
}

impl StubCpuFreq {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            capabilities: CpuFreqCapabilities {
                cpu_count,
                scaling_driver: "stub-cpufreq".to_string(),
                available_governors: vec![
                    "performance".to_string(),
                    "powersave".to_string(),
                    "userspace".to_string(),
                ],
                available_frequencies: vec!["2400000".to_string(), "1800000".to_string()],
            },
            fail_discovery: false,
            fail_write_on: None,
            offline: Vec::new(),
            writes: WriteLog::default(),
            overlap: OverlapMeter::default(),
            ticks: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl CpuFreqBackend for StubCpuFreq {
    fn discover(&self) -> BackendResult<CpuFreqCapabilities> {
        if self.fail_discovery {
            return Err(injected("cpufreq discovery"));
        }
        Ok(self.capabilities.clone())
    }

    fn frequency(&self, _cpu: usize) -> BackendResult<CpuFrequency> {
        Ok(CpuFrequency {
            current: 1_800_000.0,
            min: 800_000.0,
            max: 2_400_000.0,
        })
    }

    fn governor(&self, _cpu: usize) -> BackendResult<String> {
        Ok("powersave".to_string())
    }

    fn cpu_times(&self) -> BackendResult<CpuTimesTable> {
        self.overlap.enter();
        // Each call advances the counters so utilisation has a delta.
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        Ok((0..self.capabilities.cpu_count)
            .filter(|cpu| !self.offline.contains(cpu))
            .map(|cpu| {
                let times = CpuTimes {
                    user: 50 * tick,
                    system: 25 * tick,
                    idle: 25 * tick,
                    ..Default::default()
                };
                (cpu, times)
            })
            .collect())
    }

    fn load_average(&self) -> BackendResult<[f64; 3]> {
        Ok([0.5, 0.25, 0.125])
    }

    fn set_governor(&self, cpu: usize, governor: &str) -> BackendResult<()> {
        if self.fail_write_on == Some(cpu) {
            return Err(injected("scaling_governor write"));
        }
        self.writes.lock().push(format!("cpu{cpu}/scaling_governor={governor}"));
        Ok(())
    }

    fn set_speed(&self, cpu: usize, frequency: &str) -> BackendResult<()> {
        if self.fail_write_on == Some(cpu) {
            return Err(injected("scaling_setspeed write"));
        }
        self.writes.lock().push(format!("cpu{cpu}/scaling_setspeed={frequency}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Accelerator stub / 加速器桩
#[derive(Debug, Clone)]
pub struct StubAccelerator {
    pub inventory: AcceleratorInventory,
    pub fail_discovery: bool,
    pub fail_set_on: Option<usize>,
    /// Clock domains the device refuses to report.
    pub unsupported_clocks: Vec<ClockDomain>,
    /// Number of refused clock reads so far.
    pub clock_failures: Arc<AtomicUsize>,
    pub writes: WriteLog,
    pub shutdowns: Arc<AtomicUsize>,
}

impl StubAccelerator {
    pub fn new(device_count: usize) -> Self {
        Self {
            inventory: AcceleratorInventory {
                driver_version: "550.54.15".to_string(),
                cuda_version: "12.4".to_string(),
                library_version: "12.550.54.15".to_string(),
                devices: (0..device_count)
                    .map(|_| AcceleratorDevice {
                        fan_count: 1,
                        fan_speed_range: Some((30, 100)),
                        power_constraints: Some(PowerConstraints {
                            min_mw: 100_000,
                            max_mw: 300_000,
                        }),
                    })
                    .collect(),
            },
            fail_discovery: false,
            fail_set_on: None,
            unsupported_clocks: Vec::new(),
            clock_failures: Arc::new(AtomicUsize::new(0)),
            writes: WriteLog::default(),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn check_index(&self, index: usize) -> BackendResult<()> {
        if index < self.inventory.devices.len() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!("no device {index}")))
        }
    }

    fn check_clock(&self, index: usize, domain: ClockDomain) -> BackendResult<()> {
        self.check_index(index)?;
        if self.unsupported_clocks.contains(&domain) {
            self.clock_failures.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unavailable(format!(
                "{} clock not supported",
                domain.label()
            )));
        }
        Ok(())
    }
}

fn application_clock_mhz(domain: ClockDomain) -> u32 {
    match domain {
        ClockDomain::Graphics | ClockDomain::Sm => 1410,
        ClockDomain::Memory => 1215,
        ClockDomain::Video => 1275,
    }
}

impl AcceleratorBackend for StubAccelerator {
    fn discover(&mut self) -> BackendResult<AcceleratorInventory> {
        if self.fail_discovery {
            return Err(injected("accelerator discovery"));
        }
        Ok(self.inventory.clone())
    }

    fn identity(&self, index: usize) -> BackendResult<DeviceIdentity> {
        self.check_index(index)?;
        Ok(DeviceIdentity {
            uuid: format!("GPU-0000000{index}"),
            name: "Stub Accelerator".to_string(),
            bus_type: "PCIE".to_string(),
        })
    }

    fn fan_speed(&self, index: usize, _fan: u32) -> BackendResult<u32> {
        self.check_index(index)?;
        Ok(40)
    }

    fn power_usage(&self, index: usize) -> BackendResult<u32> {
        self.check_index(index)?;
        Ok(150_000)
    }

    fn enforced_power_limit(&self, index: usize) -> BackendResult<u32> {
        self.check_index(index)?;
        Ok(250_000)
    }

    fn utilization(&self, index: usize) -> BackendResult<DeviceUtilization> {
        self.check_index(index)?;
        Ok(DeviceUtilization { gpu: 80, memory: 30 })
    }

    fn applications_clock(&self, index: usize, domain: ClockDomain) -> BackendResult<u32> {
        self.check_clock(index, domain)?;
        Ok(application_clock_mhz(domain))
    }

    fn clock(&self, index: usize, domain: ClockDomain, kind: ClockKind) -> BackendResult<u32> {
        self.check_clock(index, domain)?;
        let base = application_clock_mhz(domain);
        Ok(match kind {
            ClockKind::Current => base / 2,
            ClockKind::AppTarget | ClockKind::AppDefault => base,
            ClockKind::CustomerBoostMax => base + 300,
        })
    }

    fn compute_mode(&self, index: usize) -> BackendResult<ComputeMode> {
        self.check_index(index)?;
        Ok(ComputeMode::Default)
    }

    fn performance_state(&self, index: usize) -> BackendResult<Option<u32>> {
        self.check_index(index)?;
        Ok(Some(0))
    }

    fn persistence_mode(&self, index: usize) -> BackendResult<bool> {
        self.check_index(index)?;
        Ok(true)
    }

    fn temperature(&self, index: usize, _sensor: TemperatureSensorKind) -> BackendResult<u32> {
        self.check_index(index)?;
        Ok(65)
    }

    fn memory(&self, index: usize) -> BackendResult<DeviceMemory> {
        self.check_index(index)?;
        Ok(DeviceMemory {
            total: 16 << 30,
            free: 12 << 30,
            used: 4 << 30,
        })
    }

    fn set_power_limit(&self, index: usize, milliwatts: u32) -> BackendResult<()> {
        self.check_index(index)?;
        if self.fail_set_on == Some(index) {
            return Err(injected("power limit write"));
        }
        self.writes.lock().push(format!("gpu{index}/power_limit={milliwatts}"));
        Ok(())
    }

    fn shutdown(&mut self) -> BackendResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Board management stub / 基板管理桩
#[derive(Debug, Clone)]
pub struct StubBoard {
    pub fan_count: usize,
    pub etag: Option<String>,
    pub fail_discovery: bool,
    pub fail_fan: Option<usize>,
    pub control_mode: String,
    pub writes: WriteLog,
    pub etag_fetches: Arc<AtomicUsize>,
    pub logouts: Arc<AtomicUsize>,
}

impl StubBoard {
    pub fn new(fan_count: usize) -> Self {
        Self {
            fan_count,
            etag: Some("W/\"1700000000\"".to_string()),
            fail_discovery: false,
            fail_fan: None,
            control_mode: "Auto".to_string(),
            writes: WriteLog::default(),
            etag_fetches: Arc::new(AtomicUsize::new(0)),
            logouts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl BoardBackend for StubBoard {
    fn discover(&self) -> BackendResult<BoardInventory> {
        if self.fail_discovery {
            return Err(injected("board discovery"));
        }
        Ok(BoardInventory {
            manufacturer: "Inspur".to_string(),
            model: "NF5280M6".to_string(),
            fan_count: self.fan_count,
        })
    }

    fn fans(&self) -> BackendResult<Vec<FanReading>> {
        Ok((0..self.fan_count)
            .map(|i| FanReading {
                name: format!("FAN{i}_F_Speed"),
                state: "Enabled".to_string(),
                health: "OK".to_string(),
                reading: Some(4200.0),
                reading_units: "RPM".to_string(),
                control_mode: self.control_mode.clone(),
                speed_ratio: Some(35.0),
            })
            .collect())
    }

    fn power(&self) -> BackendResult<PowerReading> {
        Ok(PowerReading {
            supplies: vec![PowerSupplyReading {
                input_watts: Some(420.0),
                output_watts: Some(400.0),
            }],
            cpu_watts: Some(180.0),
            memory_watts: Some(40.0),
            fan_watts: Some(30.0),
            total_watts: Some(420.0),
        })
    }

    fn threshold_sensors(&self) -> BackendResult<Vec<ThresholdSensor>> {
        Ok(vec![
            ThresholdSensor {
                name: "Inlet_Temp".to_string(),
                unit: "deg_c".to_string(),
                status: "ok".to_string(),
                reading: Some(24.0),
            },
            ThresholdSensor {
                name: "PSU1_Temp".to_string(),
                unit: "deg_c".to_string(),
                status: "na".to_string(),
                reading: None,
            },
        ])
    }

    fn discrete_sensors(&self) -> BackendResult<Vec<DiscreteSensor>> {
        Ok(vec![
            DiscreteSensor {
                name: "CPU0_Status".to_string(),
                status: "Enable".to_string(),
            },
            DiscreteSensor {
                name: "PSU_Redundant".to_string(),
                status: "Disable".to_string(),
            },
        ])
    }

    fn thermal_etag(&self) -> BackendResult<Option<String>> {
        self.etag_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.etag.clone())
    }

    fn set_fans_auto(&self, etag: &str) -> BackendResult<()> {
        self.writes.lock().push(format!("auto if-match={etag}"));
        Ok(())
    }

    fn set_fan_speed(&self, etag: &str, fan: usize, ratio: u32) -> BackendResult<()> {
        if self.fail_fan == Some(fan) {
            return Err(injected("fan speed patch"));
        }
        self.writes
            .lock()
            .push(format!("fan{fan}={ratio} if-match={etag}"));
        Ok(())
    }

    fn logout(&self) -> BackendResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
