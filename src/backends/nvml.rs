//! NVIDIA Management Library backend
//! NVIDIA 管理库后端

use nvml_wrapper::enum_wrappers::device::{
    Clock, ClockId, ComputeMode as NvmlComputeMode, PerformanceState, TemperatureSensor,
};
use nvml_wrapper::enums::device::BusType;
use nvml_wrapper::{Device, Nvml};
use tracing::warn;

use super::{
    AcceleratorBackend, AcceleratorDevice, AcceleratorInventory, BackendError, BackendResult,
    ClockDomain, ClockKind, ComputeMode, DeviceIdentity, DeviceMemory, DeviceUtilization,
    PowerConstraints, TemperatureSensorKind,
};

fn nvml_err(e: nvml_wrapper::error::NvmlError) -> BackendError {
    BackendError::Nvml(e.to_string())
}

fn clock_type(domain: ClockDomain) -> Clock {
    match domain {
        ClockDomain::Graphics => Clock::Graphics,
        ClockDomain::Sm => Clock::SM,
        ClockDomain::Memory => Clock::Memory,
        ClockDomain::Video => Clock::Video,
    }
}

fn clock_id(kind: ClockKind) -> ClockId {
    match kind {
        ClockKind::Current => ClockId::Current,
        ClockKind::AppTarget => ClockId::TargetAppClock,
        ClockKind::AppDefault => ClockId::DefaultAppClock,
        ClockKind::CustomerBoostMax => ClockId::CustomerMaxBoost,
    }
}

fn temperature_sensor(sensor: TemperatureSensorKind) -> TemperatureSensor {
    match sensor {
        TemperatureSensorKind::Gpu => TemperatureSensor::Gpu,
    }
}

fn bus_label(bus: BusType) -> &'static str {
    match bus {
        BusType::Pcie => "PCIE",
        BusType::Pci => "PCI",
        BusType::Fpci => "FPCI",
        BusType::Agp => "AGP",
        _ => "UNKNOWN",
    }
}

#[allow(unreachable_patterns)]
fn compute_mode(mode: NvmlComputeMode) -> ComputeMode {
    match mode {
        NvmlComputeMode::Default => ComputeMode::Default,
        NvmlComputeMode::ExclusiveThread => ComputeMode::ExclusiveThread,
        NvmlComputeMode::Prohibited => ComputeMode::Prohibited,
        NvmlComputeMode::ExclusiveProcess => ComputeMode::ExclusiveProcess,
        _ => ComputeMode::Unknown,
    }
}

fn pstate_number(state: PerformanceState) -> Option<u32> {
    use PerformanceState::*;
    let n = match state {
        Zero => 0,
        One => 1,
        Two => 2,
        Three => 3,
        Four => 4,
        Five => 5,
        Six => 6,
        Seven => 7,
        Eight => 8,
        Nine => 9,
        Ten => 10,
        Eleven => 11,
        Twelve => 12,
        Thirteen => 13,
        Fourteen => 14,
        Fifteen => 15,
        _ => return None,
    };
    Some(n)
}

/// NVML handle, loaded lazily at discovery / 在发现阶段加载的 NVML 句柄
#[derive(Default)]
pub struct NvmlBackend {
    nvml: Option<Nvml>,
}

impl NvmlBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self) -> BackendResult<&Nvml> {
        self.nvml
            .as_ref()
            .ok_or_else(|| BackendError::Unavailable("NVML not initialized".to_string()))
    }

    fn device(&self, index: usize) -> BackendResult<Device<'_>> {
        let index = u32::try_from(index).map_err(|_| BackendError::Parse {
            what: "device index".to_string(),
            value: index.to_string(),
        })?;
        self.handle()?.device_by_index(index).map_err(nvml_err)
    }
}

impl AcceleratorBackend for NvmlBackend {
    fn discover(&mut self) -> BackendResult<AcceleratorInventory> {
        if self.nvml.is_none() {
            self.nvml = Some(Nvml::init().map_err(nvml_err)?);
        }
        let nvml = self.handle()?;

        let cuda = nvml.sys_cuda_driver_version().map_err(nvml_err)?;
        let mut inventory = AcceleratorInventory {
            driver_version: nvml.sys_driver_version().map_err(nvml_err)?,
            cuda_version: format!("{}.{}", cuda / 1000, cuda % 1000 / 10),
            library_version: nvml.sys_nvml_version().map_err(nvml_err)?,
            devices: Vec::new(),
        };

        let count = nvml.device_count().map_err(nvml_err)?;
        for i in 0..count {
            let device = nvml.device_by_index(i).map_err(nvml_err)?;
            let fan_count = device.num_fans().unwrap_or_else(|e| {
                warn!(index = i, error = %e, "unable to read GPU fan count");
                0
            });
            let fan_speed_range = if fan_count > 0 {
                device.min_max_fan_speed().map_or_else(
                    |e| {
                        warn!(index = i, error = %e, "unable to read GPU fan speed range");
                        None
                    },
                    Some,
                )
            } else {
                warn!(index = i, "GPU has no fan");
                None
            };
            let power_constraints = match device.power_management_limit_constraints() {
                Ok(c) => Some(PowerConstraints {
                    min_mw: c.min_limit,
                    max_mw: c.max_limit,
                }),
                Err(e) => {
                    warn!(index = i, error = %e, "unable to get GPU power limit constraints");
                    None
                }
            };
            inventory.devices.push(AcceleratorDevice {
                fan_count,
                fan_speed_range,
                power_constraints,
            });
        }
        Ok(inventory)
    }

    fn identity(&self, index: usize) -> BackendResult<DeviceIdentity> {
        let device = self.device(index)?;
        Ok(DeviceIdentity {
            uuid: device.uuid().map_err(nvml_err)?,
            name: device.name().map_err(nvml_err)?,
            bus_type: bus_label(device.bus_type().map_err(nvml_err)?).to_string(),
        })
    }

    fn fan_speed(&self, index: usize, fan: u32) -> BackendResult<u32> {
        self.device(index)?.fan_speed(fan).map_err(nvml_err)
    }

    fn power_usage(&self, index: usize) -> BackendResult<u32> {
        self.device(index)?.power_usage().map_err(nvml_err)
    }

    fn enforced_power_limit(&self, index: usize) -> BackendResult<u32> {
        self.device(index)?.enforced_power_limit().map_err(nvml_err)
    }

    fn utilization(&self, index: usize) -> BackendResult<DeviceUtilization> {
        let u = self.device(index)?.utilization_rates().map_err(nvml_err)?;
        Ok(DeviceUtilization {
            gpu: u.gpu,
            memory: u.memory,
        })
    }

    fn applications_clock(&self, index: usize, domain: ClockDomain) -> BackendResult<u32> {
        self.device(index)?
            .applications_clock(clock_type(domain))
            .map_err(nvml_err)
    }

    fn clock(&self, index: usize, domain: ClockDomain, kind: ClockKind) -> BackendResult<u32> {
        self.device(index)?
            .clock(clock_type(domain), clock_id(kind))
            .map_err(nvml_err)
    }

    fn compute_mode(&self, index: usize) -> BackendResult<ComputeMode> {
        let mode = self.device(index)?.compute_mode().map_err(nvml_err)?;
        Ok(compute_mode(mode))
    }

    fn performance_state(&self, index: usize) -> BackendResult<Option<u32>> {
        let state = self.device(index)?.performance_state().map_err(nvml_err)?;
        Ok(pstate_number(state))
    }

    fn persistence_mode(&self, index: usize) -> BackendResult<bool> {
        self.device(index)?
            .is_in_persistent_mode()
            .map_err(nvml_err)
    }

    fn temperature(&self, index: usize, sensor: TemperatureSensorKind) -> BackendResult<u32> {
        self.device(index)?
            .temperature(temperature_sensor(sensor))
            .map_err(nvml_err)
    }

    fn memory(&self, index: usize) -> BackendResult<DeviceMemory> {
        let m = self.device(index)?.memory_info().map_err(nvml_err)?;
        Ok(DeviceMemory {
            total: m.total,
            free: m.free,
            used: m.used,
        })
    }

    fn set_power_limit(&self, index: usize, milliwatts: u32) -> BackendResult<()> {
        let mut device = self.device(index)?;
        device
            .set_power_management_limit(milliwatts)
            .map_err(nvml_err)
    }

    fn shutdown(&mut self) -> BackendResult<()> {
        match self.nvml.take() {
            Some(nvml) => nvml.shutdown().map_err(nvml_err),
            None => Err(BackendError::Unavailable(
                "NVML not initialized, no need to shutdown".to_string(),
            )),
        }
    }
}
