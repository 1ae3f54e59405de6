//! Linux cpufreq backend over sysfs and procfs
//! 基于 sysfs 和 procfs 的 Linux cpufreq 后端

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{
    BackendError, BackendResult, CpuFreqBackend, CpuFreqCapabilities, CpuFrequency, CpuTimes,
    CpuTimesTable,
};

pub const DEFAULT_SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";
pub const DEFAULT_PROCFS_ROOT: &str = "/proc";

/// cpufreq access rooted at configurable sysfs/procfs directories
/// 以可配置的 sysfs/procfs 目录为根的 cpufreq 访问
#[derive(Debug, Clone)]
pub struct SysfsCpuFreq {
    cpu_root: PathBuf,
    proc_root: PathBuf,
}

impl Default for SysfsCpuFreq {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_CPU_ROOT, DEFAULT_PROCFS_ROOT)
    }
}

impl SysfsCpuFreq {
    pub fn new(cpu_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            cpu_root: cpu_root.into(),
            proc_root: proc_root.into(),
        }
    }

    fn cpufreq_file(&self, cpu: usize, file: &str) -> PathBuf {
        self.cpu_root
            .join(format!("cpu{cpu}"))
            .join("cpufreq")
            .join(file)
    }

    fn count_cpus(&self) -> BackendResult<usize> {
        let entries = fs::read_dir(&self.cpu_root).map_err(|source| BackendError::Io {
            path: self.cpu_root.clone(),
            source,
        })?;
        let count = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix("cpu"))
                    .map(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
                    .unwrap_or(false)
            })
            .count();
        Ok(count)
    }
}

fn read_trimmed(path: &Path) -> BackendResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| BackendError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn write_value(path: &Path, value: &str) -> BackendResult<()> {
    debug!(path = %path.display(), value, "sysfs write");
    fs::write(path, value.as_bytes()).map_err(|source| BackendError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_f64(what: &str, value: &str) -> BackendResult<f64> {
    value.trim().parse::<f64>().map_err(|_| BackendError::Parse {
        what: what.to_string(),
        value: value.to_string(),
    })
}

/// Parse the `cpuN` lines of `/proc/stat` / 解析 `/proc/stat` 中的 `cpuN` 行
pub fn parse_proc_stat(content: &str) -> BackendResult<CpuTimesTable> {
    let mut times = CpuTimesTable::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        let Some(id) = label.strip_prefix("cpu").filter(|id| !id.is_empty()) else {
            continue;
        };
        let Ok(id) = id.parse::<usize>() else {
            continue;
        };
        let ticks = fields
            .take(8)
            .map(|f| {
                f.parse::<u64>().map_err(|_| BackendError::Parse {
                    what: format!("/proc/stat {label}"),
                    value: f.to_string(),
                })
            })
            .collect::<BackendResult<Vec<u64>>>()?;
        let tick = |i: usize| ticks.get(i).copied().unwrap_or(0);
        times.insert(
            id,
            CpuTimes {
                user: tick(0),
                nice: tick(1),
                system: tick(2),
                idle: tick(3),
                iowait: tick(4),
                irq: tick(5),
                softirq: tick(6),
                steal: tick(7),
            },
        );
    }
    Ok(times)
}

impl CpuFreqBackend for SysfsCpuFreq {
    fn discover(&self) -> BackendResult<CpuFreqCapabilities> {
        let cpu_count = self.count_cpus()?;
        if cpu_count == 0 {
            return Err(BackendError::Unavailable(format!(
                "no cpu directories under {}",
                self.cpu_root.display()
            )));
        }
        let scaling_driver = read_trimmed(&self.cpufreq_file(0, "scaling_driver"))?;
        let available_governors = read_trimmed(&self.cpufreq_file(0, "scaling_available_governors"))?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let freqs_path = self.cpufreq_file(0, "scaling_available_frequencies");
        let available_frequencies = if freqs_path.exists() {
            read_trimmed(&freqs_path)?
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        Ok(CpuFreqCapabilities {
            cpu_count,
            scaling_driver,
            available_governors,
            available_frequencies,
        })
    }

    fn frequency(&self, cpu: usize) -> BackendResult<CpuFrequency> {
        let read = |file: &str| -> BackendResult<f64> {
            let raw = read_trimmed(&self.cpufreq_file(cpu, file))?;
            parse_f64(file, &raw)
        };
        Ok(CpuFrequency {
            current: read("scaling_cur_freq")?,
            min: read("scaling_min_freq")?,
            max: read("scaling_max_freq")?,
        })
    }

    fn governor(&self, cpu: usize) -> BackendResult<String> {
        read_trimmed(&self.cpufreq_file(cpu, "scaling_governor"))
    }

    fn cpu_times(&self) -> BackendResult<CpuTimesTable> {
        let content = read_trimmed(&self.proc_root.join("stat"))?;
        parse_proc_stat(&content)
    }

    fn load_average(&self) -> BackendResult<[f64; 3]> {
        let content = read_trimmed(&self.proc_root.join("loadavg"))?;
        let mut fields = content.split_whitespace();
        let mut next = || -> BackendResult<f64> {
            let field = fields
                .next()
                .ok_or_else(|| BackendError::Missing("loadavg field".to_string()))?;
            parse_f64("loadavg", field)
        };
        Ok([next()?, next()?, next()?])
    }

    fn set_governor(&self, cpu: usize, governor: &str) -> BackendResult<()> {
        write_value(&self.cpufreq_file(cpu, "scaling_governor"), governor)
    }

    fn set_speed(&self, cpu: usize, frequency: &str) -> BackendResult<()> {
        write_value(&self.cpufreq_file(cpu, "scaling_setspeed"), frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_tree(cpus: usize, with_freq_table: bool) -> TempDir {
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
            if with_freq_table {
                fs::write(
                    freq.join("scaling_available_frequencies"),
                    "2400000 2000000 1600000 \n",
                )
                .unwrap();
            }
            fs::write(freq.join("scaling_governor"), "powersave\n").unwrap();
            fs::write(freq.join("scaling_cur_freq"), "1800000\n").unwrap();
            fs::write(freq.join("scaling_min_freq"), "800000\n").unwrap();
            fs::write(freq.join("scaling_max_freq"), "2400000\n").unwrap();
        }
        // Non-cpu entries must not be counted / 非 cpu 目录不应被计数
        fs::create_dir_all(cpu_root.join("cpufreq")).unwrap();
        fs::create_dir_all(cpu_root.join("cpuidle")).unwrap();

        let proc_root = dir.path().join("proc");
        fs::create_dir_all(&proc_root).unwrap();
        fs::write(
            proc_root.join("stat"),
            "cpu  20 0 20 200 0 0 0 0 0 0\ncpu0 10 0 10 100 0 0 0 0 0 0\ncpu1 10 0 10 100 0 0 0 0 0 0\nintr 1 2 3\n",
        )
        .unwrap();
        fs::write(proc_root.join("loadavg"), "0.52 0.58 0.59 1/467 12345\n").unwrap();
        dir
    }

    fn backend(dir: &TempDir) -> SysfsCpuFreq {
        SysfsCpuFreq::new(dir.path().join("cpu"), dir.path().join("proc"))
    }

    #[test]
    fn test_discover_capabilities() {
        let dir = fake_tree(2, true);
        let caps = backend(&dir).discover().unwrap();
        assert_eq!(caps.cpu_count, 2);
        assert_eq!(caps.scaling_driver, "acpi-cpufreq");
        assert_eq!(
            caps.available_governors,
            vec!["performance", "powersave", "userspace"]
        );
        assert_eq!(caps.available_frequencies, vec!["2400000", "2000000", "1600000"]);
    }

    #[test]
    fn test_discover_without_frequency_table() {
        let dir = fake_tree(1, false);
        let caps = backend(&dir).discover().unwrap();
        assert!(caps.available_frequencies.is_empty());
    }

    #[test]
    fn test_discover_fails_without_cpufreq() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("cpu").join("cpu0")).unwrap();
        let err = backend(&dir).discover().unwrap_err();
        assert!(matches!(err, BackendError::Io { .. }));
    }

    #[test]
    fn test_reads() {
        let dir = fake_tree(2, true);
        let b = backend(&dir);
        let freq = b.frequency(1).unwrap();
        assert_eq!(freq.current, 1_800_000.0);
        assert_eq!(freq.min, 800_000.0);
        assert_eq!(b.governor(0).unwrap(), "powersave");
        assert_eq!(b.load_average().unwrap(), [0.52, 0.58, 0.59]);
        let times = b.cpu_times().unwrap();
        assert_eq!(times.len(), 2);
        assert_eq!(times[&0].idle, 100);
    }

    #[test]
    fn test_writes_land_in_sysfs_files() {
        let dir = fake_tree(2, true);
        let b = backend(&dir);
        b.set_governor(1, "userspace").unwrap();
        b.set_speed(1, "2000000").unwrap();
        let freq = dir.path().join("cpu/cpu1/cpufreq");
        assert_eq!(fs::read_to_string(freq.join("scaling_governor")).unwrap(), "userspace");
        assert_eq!(fs::read_to_string(freq.join("scaling_setspeed")).unwrap(), "2000000");
    }

    #[test]
    fn test_parse_proc_stat_keys_by_cpu_id() {
        let times = parse_proc_stat("cpu1 1 2 3 4 5 6 7 8\ncpu0 8 7 6 5 4 3 2 1\n").unwrap();
        assert_eq!(times[&0].user, 8);
        assert_eq!(times[&1].steal, 8);
        assert_eq!(times[&1].total(), 36);
    }

    #[test]
    fn test_parse_proc_stat_with_offline_cpu() {
        let times =
            parse_proc_stat("cpu  10 0 0 10 0 0 0 0\ncpu0 100 0 0 0\ncpu2 900 0 0 0\n").unwrap();
        assert_eq!(times.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(times[&2].user, 900);
        assert!(!times.contains_key(&1));
    }
}
