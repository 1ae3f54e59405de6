//! Lifecycle and concurrency guard around a driver
//! 驱动的生命周期与并发保护
//!
//! Every call first checks whether setup left the component enabled, then
//! takes the component's re-entrant lock. The lock belongs to the component,
//! so different components never wait on each other.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::ReentrantMutex;
use tracing::{debug, info, warn};

use super::{AttrMap, Component, ControlResult, Driver, Phase};
use crate::agent::config::AgentConfig;
use crate::metrics;

/// A driver plus its enabled flag and lock / 驱动及其启用标志与锁
pub struct Guarded<D: Driver> {
    driver: ReentrantMutex<D>,
    set_up: bool,
    enabled: bool,
    torn_down: AtomicBool,
}

impl<D: Driver> Guarded<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: ReentrantMutex::new(driver),
            set_up: false,
            enabled: false,
            torn_down: AtomicBool::new(false),
        }
    }

    fn serving(&self) -> bool {
        self.enabled && !self.torn_down.load(Ordering::Acquire)
    }

    fn unsupported(&self) -> ControlResult {
        ControlResult::error(format!("No {} config choose", D::NAME))
    }

    /// Run `f` while holding the component lock.
    ///
    /// The lock is re-entrant, so `f` may call back into this component from
    /// the same thread.
    pub fn exclusive<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        let driver = self.driver.lock();
        f(&driver)
    }
}

impl<D: Driver + 'static> Component for Guarded<D> {
    fn name(&self) -> &'static str {
        D::NAME
    }

    fn setup(&mut self, config: &AgentConfig) {
        if self.set_up {
            warn!(component = D::NAME, "setup called twice, ignoring");
            return;
        }
        self.set_up = true;
        match self.driver.get_mut().setup(config) {
            Ok(()) => {
                self.enabled = true;
                info!(component = D::NAME, "component ready");
            }
            Err(e) => {
                self.enabled = false;
                warn!(component = D::NAME, reason = %e, "component disabled");
            }
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.enabled {
            debug!(component = D::NAME, "nothing acquired, skipping teardown");
            return;
        }
        let driver = self.driver.lock();
        driver.teardown();
        info!(component = D::NAME, "component torn down");
    }

    fn phase(&self) -> Phase {
        if self.torn_down.load(Ordering::Acquire) {
            Phase::TornDown
        } else if !self.set_up {
            Phase::Created
        } else if self.enabled {
            Phase::Serving
        } else {
            Phase::Disabled
        }
    }

    fn update(&self) -> Vec<u8> {
        if !self.serving() {
            return Vec::new();
        }
        let driver = self.driver.lock();
        let samples = driver.update();
        match metrics::encode(&samples) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(component = D::NAME, error = %e, "failed to encode samples");
                Vec::new()
            }
        }
    }

    fn get_attrs(&self, names: &[String]) -> AttrMap {
        if !self.serving() {
            return AttrMap::new();
        }
        let driver = self.driver.lock();
        driver.get_attrs(names)
    }

    fn control(&self, tokens: &[String]) -> ControlResult {
        if !self.serving() {
            return self.unsupported();
        }
        let driver = self.driver.lock();
        let result = driver.control(tokens);
        debug!(component = D::NAME, ?tokens, ?result, "control finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::SetupError;
    use crate::metrics::GaugeFamily;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct Counters {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
    }

    struct CountingDriver {
        fail_setup: bool,
        counters: Counters,
    }

    impl CountingDriver {
        fn new(fail_setup: bool) -> (Self, Counters) {
            let counters = Counters::default();
            (
                Self {
                    fail_setup,
                    counters: counters.clone(),
                },
                counters,
            )
        }
    }

    impl Driver for CountingDriver {
        const NAME: &'static str = "counting";

        fn setup(&mut self, _config: &AgentConfig) -> Result<(), SetupError> {
            if self.fail_setup {
                Err(SetupError::UnsupportedBackend("bogus".to_string()))
            } else {
                Ok(())
            }
        }

        fn teardown(&self) {
            self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
        }

        fn get_attrs(&self, names: &[String]) -> AttrMap {
            names
                .iter()
                .map(|n| (n.clone(), serde_json::Value::Bool(true)))
                .collect()
        }

        fn update(&self) -> Vec<crate::metrics::MetricSample> {
            let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            vec![GaugeFamily::new("counting_value", "Counting value", &["i"]).sample(&["0"], 1.0)]
        }

        fn control(&self, _tokens: &[String]) -> ControlResult {
            ControlResult::success("counting control success")
        }
    }

    fn ready(fail_setup: bool) -> (Guarded<CountingDriver>, Counters) {
        let (driver, counters) = CountingDriver::new(fail_setup);
        let mut guarded = Guarded::new(driver);
        guarded.setup(&AgentConfig::default());
        (guarded, counters)
    }

    #[test]
    fn test_phase_transitions() {
        let (driver, _) = CountingDriver::new(false);
        let mut guarded = Guarded::new(driver);
        assert_eq!(guarded.phase(), Phase::Created);
        guarded.setup(&AgentConfig::default());
        assert_eq!(guarded.phase(), Phase::Serving);
        guarded.teardown();
        assert_eq!(guarded.phase(), Phase::TornDown);
    }

    #[test]
    fn test_update_before_setup_is_empty() {
        let (driver, _) = CountingDriver::new(false);
        let guarded = Guarded::new(driver);
        assert!(guarded.update().is_empty());
    }

    #[test]
    fn test_soft_disabled_component() {
        let (guarded, counters) = ready(true);
        assert_eq!(guarded.phase(), Phase::Disabled);
        for _ in 0..3 {
            assert!(guarded.update().is_empty());
            assert!(guarded.get_attrs(&["x".to_string()]).is_empty());
            assert_eq!(
                guarded.control(&["anything".to_string()]),
                ControlResult::error("No counting config choose")
            );
        }
        guarded.teardown();
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_teardown_runs_once() {
        let (guarded, counters) = ready(false);
        guarded.teardown();
        guarded.teardown();
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
        assert!(guarded.update().is_empty());
    }

    #[test]
    fn test_calls_are_serialized() {
        let (guarded, counters) = ready(false);
        let guarded = Arc::new(guarded);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let g = Arc::clone(&guarded);
                thread::spawn(move || g.update())
            })
            .collect();
        for h in handles {
            assert!(!h.join().unwrap().is_empty());
        }
        assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_is_reentrant() {
        let (guarded, _) = ready(false);
        let (inner_update, inner_attrs) = guarded.exclusive(|_| {
            (guarded.update(), guarded.get_attrs(&["cauto".to_string()]))
        });
        assert!(String::from_utf8(inner_update).unwrap().contains("counting_value"));
        assert_eq!(inner_attrs.get("cauto"), Some(&serde_json::Value::Bool(true)));
    }
}
