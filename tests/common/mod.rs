//! Shared helpers for integration tests
//! 集成测试共享工具

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use powerall::agent::config::AgentConfig;
use powerall::backends::stub::{StubAccelerator, StubBoard, StubCpuFreq};
use powerall::components::bmc::BmcDriver;
use powerall::components::cpu::CpuDriver;
use powerall::components::nvgpu::NvgpuDriver;
use powerall::components::{ComponentRegistry, Guarded};
use tempfile::TempDir;

/// Stub backends kept by the test to observe writes / 测试持有的桩后端，用于观察写入
#[derive(Clone)]
pub struct Stubs {
    pub cpu: StubCpuFreq,
    pub gpu: StubAccelerator,
    pub board: StubBoard,
}

impl Stubs {
    pub fn new(cpus: usize, gpus: usize, fans: usize) -> Self {
        Self {
            cpu: StubCpuFreq::new(cpus),
            gpu: StubAccelerator::new(gpus),
            board: StubBoard::new(fans),
        }
    }

    /// Registry over clones of these stubs, set up with `config`
    pub fn registry(&self, config: &AgentConfig) -> Arc<ComponentRegistry> {
        let mut registry = ComponentRegistry::new();
        registry.register(Guarded::new(CpuDriver::with_backend(self.cpu.clone())));
        registry.register(Guarded::new(NvgpuDriver::with_backend(self.gpu.clone())));
        registry.register(Guarded::new(BmcDriver::with_backend(self.board.clone())));
        registry.setup_all(config);
        Arc::new(registry)
    }
}

pub fn tokens(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

/// Fake `/sys/devices/system/cpu` and `/proc` trees / 伪造的 sysfs 与 procfs 目录
pub struct FakeHost {
    pub dir: TempDir,
}

impl FakeHost {
    pub fn new(cpus: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let cpu_root = dir.path().join("cpu");
        for i in 0..cpus {
            let freq = cpu_root.join(format!("cpu{i}")).join("cpufreq");
            fs::create_dir_all(&freq).unwrap();
            fs::write(freq.join("scaling_driver"), "acpi-cpufreq\n").unwrap();
            fs::write(
                freq.join("scaling_available_governors"),
                "performance powersave userspace\n",
            )
            .unwrap();
            fs::write(
                freq.join("scaling_available_frequencies"),
                "2400000 2000000 1600000\n",
            )
            .unwrap();
            fs::write(freq.join("scaling_governor"), "powersave\n").unwrap();
            fs::write(freq.join("scaling_setspeed"), "<unsupported>\n").unwrap();
            fs::write(freq.join("scaling_cur_freq"), "1800000\n").unwrap();
            fs::write(freq.join("scaling_min_freq"), "800000\n").unwrap();
            fs::write(freq.join("scaling_max_freq"), "2400000\n").unwrap();
        }

        let proc_root = dir.path().join("proc");
        fs::create_dir_all(&proc_root).unwrap();
        let mut stat = String::from("cpu  0 0 0 0 0 0 0 0 0 0\n");
        for i in 0..cpus {
            stat.push_str(&format!("cpu{i} 300 0 100 600 0 0 0 0 0 0\n"));
        }
        fs::write(proc_root.join("stat"), stat).unwrap();
        fs::write(proc_root.join("loadavg"), "1.00 0.50 0.25 1/300 4242\n").unwrap();
        Self { dir }
    }

    pub fn cpu_root(&self) -> PathBuf {
        self.dir.path().join("cpu")
    }

    pub fn proc_root(&self) -> PathBuf {
        self.dir.path().join("proc")
    }

    /// Replace `/proc/stat`, e.g. to drop rows of offline CPUs
    pub fn write_proc_stat(&self, content: &str) {
        fs::write(self.proc_root().join("stat"), content).unwrap();
    }

    pub fn read(&self, cpu: usize, file: &str) -> String {
        read_trimmed(&self.cpu_root().join(format!("cpu{cpu}/cpufreq/{file}")))
    }
}

fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path).unwrap().trim().to_string()
}
