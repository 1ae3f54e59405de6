//! Ordered component registry / 有序组件注册表
//!
//! Built once at startup, set up before serving, then shared read-only.

use tracing::{debug, info};

use super::bmc::BmcDriver;
use super::cpu::CpuDriver;
use super::nvgpu::NvgpuDriver;
use super::{Component, Guarded};
use crate::agent::config::AgentConfig;

/// Name-ordered collection of components / 按注册顺序排列的组件集合
#[derive(Default)]
pub struct ComponentRegistry {
    components: Vec<Box<dyn Component>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// cpu, nvgpu and bmc with backends chosen from configuration
    /// 由配置选择后端的 cpu、nvgpu 和 bmc
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Guarded::new(CpuDriver::new()));
        registry.register(Guarded::new(NvgpuDriver::new()));
        registry.register(Guarded::new(BmcDriver::new()));
        registry
    }

    /// Append a component. A later component with an existing name replaces
    /// the earlier one in place.
    pub fn register(&mut self, component: impl Component + 'static) {
        let component: Box<dyn Component> = Box::new(component);
        match self
            .components
            .iter_mut()
            .find(|c| c.name() == component.name())
        {
            Some(slot) => *slot = component,
            None => self.components.push(component),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Component> {
        self.components
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }

    /// Names in registration order / 按注册顺序的名称
    pub fn names(&self) -> Vec<&'static str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Component> {
        self.components.iter().map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Set up every component in order / 按顺序启动所有组件
    pub fn setup_all(&mut self, config: &AgentConfig) {
        for component in self.components.iter_mut() {
            component.setup(config);
        }
        let enabled: Vec<_> = self
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.name())
            .collect();
        info!(?enabled, "components set up");
    }

    /// Tear down every component in reverse order / 逆序关闭所有组件
    pub fn teardown_all(&self) {
        for component in self.components.iter().rev() {
            component.teardown();
        }
    }

    /// Concatenated update output of every component, in registration order.
    /// 按注册顺序拼接所有组件的 update 输出。
    pub fn scrape(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for component in self.iter() {
            let bytes = component.update();
            if bytes.is_empty() {
                debug!(component = component.name(), "component produced no samples");
                continue;
            }
            out.extend_from_slice(&bytes);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::stub::{StubAccelerator, StubBoard, StubCpuFreq};
    use crate::components::Phase;

    fn stubbed(cpus: usize, gpus: usize, fans: usize) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register(Guarded::new(CpuDriver::with_backend(StubCpuFreq::new(cpus))));
        registry.register(Guarded::new(NvgpuDriver::with_backend(StubAccelerator::new(gpus))));
        registry.register(Guarded::new(BmcDriver::with_backend(StubBoard::new(fans))));
        registry
    }

    #[test]
    fn test_registration_order() {
        let registry = ComponentRegistry::standard();
        assert_eq!(registry.names(), vec!["cpu", "nvgpu", "bmc"]);
        assert!(registry.get("cpu").is_some());
        assert!(registry.get("disk").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = stubbed(2, 1, 2);
        registry.register(Guarded::new(CpuDriver::with_backend(StubCpuFreq::new(8))));
        assert_eq!(registry.names(), vec!["cpu", "nvgpu", "bmc"]);
    }

    #[test]
    fn test_scrape_concatenates_in_order() {
        let mut registry = stubbed(2, 1, 2);
        registry.setup_all(&AgentConfig::default());
        let text = String::from_utf8(registry.scrape()).unwrap();
        let cpu = text.find("cpu_freqs").unwrap();
        let gpu = text.find("nvgpu_power").unwrap();
        let bmc = text.find("bmc_fan_read").unwrap();
        assert!(cpu < gpu && gpu < bmc);
    }

    #[test]
    fn test_scrape_skips_disabled() {
        let mut registry = stubbed(2, 1, 2);
        let mut config = AgentConfig::default();
        config.nvgpu.enable = false;
        registry.setup_all(&config);
        assert_eq!(registry.get("nvgpu").unwrap().phase(), Phase::Disabled);
        let text = String::from_utf8(registry.scrape()).unwrap();
        assert!(!text.contains("nvgpu_"));
        assert!(text.contains("cpu_freqs"));
    }

    #[test]
    fn test_teardown_all() {
        let mut registry = stubbed(1, 1, 1);
        registry.setup_all(&AgentConfig::default());
        registry.teardown_all();
        assert!(registry.iter().all(|c| c.phase() == Phase::TornDown));
    }
}
