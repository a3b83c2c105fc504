use prometheus::{CounterVec, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("empty prometheus registry")]
    EmptyRegistry,
    #[error("register collector: {0}")]
    Register(#[from] prometheus::Error),
}

/// Call counters labelled by `{module, function}`.
#[derive(Clone)]
pub struct CallMetrics {
    call: CounterVec,
    slow_call: CounterVec,
    panic_call: CounterVec,
}

fn counter(name: &str, help: &str) -> Result<CounterVec, prometheus::Error> {
    CounterVec::new(Opts::new(name, help).namespace("mvc"), &["module", "function"])
}

impl CallMetrics {
    /// Create the counters and register them on `registry`.
    pub fn register(registry: &Registry) -> Result<Self, MetricError> {
        let metrics = Self {
            call: counter("module_call", "module calls")?,
            slow_call: counter("slow_module_call", "slow module calls")?,
            panic_call: counter("panic_module_panic_call", "panicked module calls")?,
        };

        registry.register(Box::new(metrics.call.clone()))?;
        registry.register(Box::new(metrics.slow_call.clone()))?;
        registry.register(Box::new(metrics.panic_call.clone()))?;
        Ok(metrics)
    }

    pub fn call(&self, module: &str, function: &str) {
        self.call.with_label_values(&[module, function]).inc();
    }

    pub fn slow_call(&self, module: &str, function: &str) {
        self.slow_call.with_label_values(&[module, function]).inc();
    }

    pub fn panic_call(&self, module: &str, function: &str) {
        self.panic_call.with_label_values(&[module, function]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_namespaced() {
        let registry = Registry::new();
        let m = CallMetrics::register(&registry).unwrap();
        m.call("say", "hello");
        m.call("say", "hello");
        m.slow_call("say", "slow");
        m.panic_call("say", "tryPanic");

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"mvc_module_call".to_string()));
        assert!(names.contains(&"mvc_slow_module_call".to_string()));
        assert!(names.contains(&"mvc_panic_module_panic_call".to_string()));
        assert_eq!(m.call.with_label_values(&["say", "hello"]).get(), 2.0);
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        CallMetrics::register(&registry).unwrap();
        assert!(matches!(
            CallMetrics::register(&registry),
            Err(MetricError::Register(_))
        ));
    }
}
