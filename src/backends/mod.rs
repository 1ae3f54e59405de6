//! Hardware backends behind the components
//! 组件背后的硬件后端
//!
//! Each component talks to its hardware through one narrow trait: a
//! discovery call made once during setup, independently failable reads used
//! by `update`, and failable writes used by `control`.
//! 每个组件通过一个窄接口访问硬件：启动时发现一次、独立可失败的读取、可失败的写入。

pub mod redfish;
pub mod stub;
pub mod sysfs;

#[cfg(feature = "nvml")]
pub mod nvml;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

/// Backend call failure / 后端调用失败
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {what}: {value:?}")]
    Parse { what: String, value: String },

    #[error("NVML error: {0}")]
    Nvml(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {path} returned status {status}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
    },

    #[error("missing field: {0}")]
    Missing(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

// ---------------------------------------------------------------------------
// CPU frequency scaling / CPU 频率调节
// ---------------------------------------------------------------------------

/// Stable cpufreq capabilities discovered at setup / 启动时发现的 cpufreq 能力
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuFreqCapabilities {
    pub cpu_count: usize,
    pub scaling_driver: String,
    pub available_governors: Vec<String>,
    /// Empty when the driver does not publish a frequency table.
    pub available_frequencies: Vec<String>,
}

/// Frequencies of one CPU in kHz / 单个 CPU 的频率（kHz）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuFrequency {
    pub current: f64,
    pub min: f64,
    pub max: f64,
}

/// Per-CPU tick counters from `/proc/stat` / `/proc/stat` 中的每 CPU 计数
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

/// Tick counters keyed by CPU id. Offline CPUs have no entry.
/// 按 CPU 编号索引的计数，离线 CPU 不出现。
pub type CpuTimesTable = BTreeMap<usize, CpuTimes>;

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }
}

pub trait CpuFreqBackend: Send {
    fn discover(&self) -> BackendResult<CpuFreqCapabilities>;

    fn frequency(&self, cpu: usize) -> BackendResult<CpuFrequency>;

    fn governor(&self, cpu: usize) -> BackendResult<String>;

    fn cpu_times(&self) -> BackendResult<CpuTimesTable>;

    fn load_average(&self) -> BackendResult<[f64; 3]>;

    fn set_governor(&self, cpu: usize, governor: &str) -> BackendResult<()>;

    fn set_speed(&self, cpu: usize, frequency: &str) -> BackendResult<()>;
}

// ---------------------------------------------------------------------------
// Accelerators / 加速器
// ---------------------------------------------------------------------------

/// Power limit constraints in milliwatts / 功率限制范围（毫瓦）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerConstraints {
    pub min_mw: u32,
    pub max_mw: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorDevice {
    pub fan_count: u32,
    /// Allowed fan speed range in percent, shared by every fan of the device.
    pub fan_speed_range: Option<(u32, u32)>,
    /// `None` when the device refuses to report constraints.
    pub power_constraints: Option<PowerConstraints>,
}

/// Result of accelerator discovery / 加速器发现结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceleratorInventory {
    pub driver_version: String,
    pub cuda_version: String,
    pub library_version: String,
    pub devices: Vec<AcceleratorDevice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub uuid: String,
    pub name: String,
    /// `PCIE`, `PCI`, `FPCI`, `AGP` or `UNKNOWN`
    pub bus_type: String,
}

/// Clock domain of an accelerator / 加速器时钟域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    Graphics,
    Sm,
    Memory,
    Video,
}

impl ClockDomain {
    pub const ALL: [Self; 4] = [Self::Graphics, Self::Sm, Self::Memory, Self::Video];

    pub fn label(self) -> &'static str {
        match self {
            Self::Graphics => "GRAPHICS",
            Self::Sm => "SM",
            Self::Memory => "MEM",
            Self::Video => "VIDEO",
        }
    }
}

/// Which clock value of a domain to read / 读取时钟域的哪一个值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockKind {
    Current,
    AppTarget,
    AppDefault,
    CustomerBoostMax,
}

impl ClockKind {
    pub const ALL: [Self; 4] = [
        Self::Current,
        Self::AppTarget,
        Self::AppDefault,
        Self::CustomerBoostMax,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Current => "CURRENT",
            Self::AppTarget => "APP CLOCK TARGET",
            Self::AppDefault => "APP CLOCK DEFAULT",
            Self::CustomerBoostMax => "CUSTOMER BOOST MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    Default,
    ExclusiveThread,
    Prohibited,
    ExclusiveProcess,
    Unknown,
}

impl ComputeMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::ExclusiveThread => "EXCLUSIVE THREAD",
            Self::Prohibited => "PROHIBITED",
            Self::ExclusiveProcess => "EXCLUSIVE PROCESS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// On-board temperature sensor / 板载温度传感器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemperatureSensorKind {
    Gpu,
}

impl TemperatureSensorKind {
    /// Every sensor the management library can address.
    pub const ALL: [Self; 1] = [Self::Gpu];

    pub fn label(self) -> &'static str {
        match self {
            Self::Gpu => "GPU",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceUtilization {
    pub gpu: u32,
    pub memory: u32,
}

/// Memory in bytes / 显存（字节）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceMemory {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

pub trait AcceleratorBackend: Send {
    fn discover(&mut self) -> BackendResult<AcceleratorInventory>;

    fn identity(&self, index: usize) -> BackendResult<DeviceIdentity>;

    fn fan_speed(&self, index: usize, fan: u32) -> BackendResult<u32>;

    fn power_usage(&self, index: usize) -> BackendResult<u32>;

    fn enforced_power_limit(&self, index: usize) -> BackendResult<u32>;

    fn utilization(&self, index: usize) -> BackendResult<DeviceUtilization>;

    /// Application clock of a domain in MHz.
    fn applications_clock(&self, index: usize, domain: ClockDomain) -> BackendResult<u32>;

    /// Clock of a domain in MHz.
    fn clock(&self, index: usize, domain: ClockDomain, kind: ClockKind) -> BackendResult<u32>;

    fn compute_mode(&self, index: usize) -> BackendResult<ComputeMode>;

    /// P-state number, `None` when the device reports it as unknown.
    fn performance_state(&self, index: usize) -> BackendResult<Option<u32>>;

    fn persistence_mode(&self, index: usize) -> BackendResult<bool>;

    fn temperature(&self, index: usize, sensor: TemperatureSensorKind) -> BackendResult<u32>;

    fn memory(&self, index: usize) -> BackendResult<DeviceMemory>;

    fn set_power_limit(&self, index: usize, milliwatts: u32) -> BackendResult<()>;

    /// Release the library handle. Calling it twice is an error, not a panic.
    fn shutdown(&mut self) -> BackendResult<()>;
}

// ---------------------------------------------------------------------------
// Baseboard management / 基板管理
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardInventory {
    pub manufacturer: String,
    pub model: String,
    pub fan_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanReading {
    pub name: String,
    pub state: String,
    pub health: String,
    pub reading: Option<f64>,
    pub reading_units: String,
    pub control_mode: String,
    pub speed_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerSupplyReading {
    pub input_watts: Option<f64>,
    pub output_watts: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerReading {
    pub supplies: Vec<PowerSupplyReading>,
    pub cpu_watts: Option<f64>,
    pub memory_watts: Option<f64>,
    pub fan_watts: Option<f64>,
    pub total_watts: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSensor {
    pub name: String,
    pub unit: String,
    pub status: String,
    pub reading: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscreteSensor {
    pub name: String,
    pub status: String,
}

pub trait BoardBackend: Send {
    fn discover(&self) -> BackendResult<BoardInventory>;

    fn fans(&self) -> BackendResult<Vec<FanReading>>;

    fn power(&self) -> BackendResult<PowerReading>;

    fn threshold_sensors(&self) -> BackendResult<Vec<ThresholdSensor>>;

    fn discrete_sensors(&self) -> BackendResult<Vec<DiscreteSensor>>;

    /// Entity tag of the thermal resource, `None` when the controller sends none.
    fn thermal_etag(&self) -> BackendResult<Option<String>>;

    fn set_fans_auto(&self, etag: &str) -> BackendResult<()>;

    fn set_fan_speed(&self, etag: &str, fan: usize, ratio: u32) -> BackendResult<()>;

    fn logout(&self) -> BackendResult<()>;
}
