//! Test components shared by the integration tests: a ticking counter, a
//! passthrough, and a summation sink, wired the same way real telemetry
//! components are.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flow_core::component::{
    ArgumentsError, Component, ComponentArguments, ComponentError, OnStateChange, Options,
    Registration,
};
use flow_core::ComponentRegistry;
use flow_runtime::Flow;
use flow_syntax::Value;
use prometheus::IntCounter;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Counters observing component lifecycles from the outside.
#[derive(Clone, Default)]
pub struct Probe {
    pub counter_builds: Arc<AtomicUsize>,
    pub run_starts: Arc<AtomicUsize>,
    pub run_exits: Arc<AtomicUsize>,
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct CounterArguments {
    #[serde(with = "humantime_serde")]
    period: Duration,
    max: i64,
}

impl Default for CounterArguments {
    fn default() -> Self {
        Self { period: Duration::from_millis(10), max: 10 }
    }
}

impl ComponentArguments for CounterArguments {
    fn validate(&self) -> Result<(), ArgumentsError> {
        if self.max <= 0 {
            return Err(ArgumentsError::Validation(format!(
                "max must be positive, got {}",
                self.max
            )));
        }
        Ok(())
    }
}

struct Counter {
    args: Mutex<CounterArguments>,
    count: AtomicI64,
    ticks: IntCounter,
    on_state_change: OnStateChange,
    probe: Probe,
}

#[async_trait]
impl Component for Counter {
    async fn run(&self, ctx: CancellationToken) -> Result<(), ComponentError> {
        self.probe.run_starts.fetch_add(1, Ordering::SeqCst);
        loop {
            let (period, max) = {
                let args = self.args.lock().unwrap();
                (args.period, args.max)
            };
            if self.count.load(Ordering::SeqCst) >= max {
                ctx.cancelled().await;
                break;
            }
            tokio::select! {
                () = ctx.cancelled() => break,
                () = tokio::time::sleep(period) => {
                    let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                    self.ticks.inc();
                    (self.on_state_change)(json!({ "out": n }));
                }
            }
        }
        self.probe.run_exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        *self.args.lock().unwrap() = flow_core::component::decode_arguments(args)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
struct PassthroughArguments {
    input: Value,
}

impl ComponentArguments for PassthroughArguments {}

struct Passthrough {
    on_state_change: OnStateChange,
    probe: Probe,
}

#[async_trait]
impl Component for Passthrough {
    async fn run(&self, ctx: CancellationToken) -> Result<(), ComponentError> {
        self.probe.run_starts.fetch_add(1, Ordering::SeqCst);
        ctx.cancelled().await;
        self.probe.run_exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        let args: PassthroughArguments = flow_core::component::decode_arguments(args)?;
        (self.on_state_change)(json!({ "out": args.input }));
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SummationArguments {
    input: i64,
}

impl ComponentArguments for SummationArguments {}

struct Summation {
    sum: AtomicI64,
    on_state_change: OnStateChange,
    probe: Probe,
}

impl Summation {
    fn add(&self, input: i64) {
        let sum = self.sum.fetch_add(input, Ordering::SeqCst) + input;
        (self.on_state_change)(json!({ "sum": sum, "last_added": input }));
    }
}

#[async_trait]
impl Component for Summation {
    async fn run(&self, ctx: CancellationToken) -> Result<(), ComponentError> {
        self.probe.run_starts.fetch_add(1, Ordering::SeqCst);
        ctx.cancelled().await;
        self.probe.run_exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        let args: SummationArguments = flow_core::component::decode_arguments(args)?;
        self.add(args.input);
        Ok(())
    }
}

/// Registry with the three pipeline test components.
pub fn test_components(probe: &Probe) -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();

    let counter_probe = probe.clone();
    registry
        .register(Registration::new(
            "counter",
            move |opts: Options, args: CounterArguments| {
                counter_probe.counter_builds.fetch_add(1, Ordering::SeqCst);
                let ticks = IntCounter::new("counter_ticks_total", "Ticks emitted")
                    .map_err(|e| ComponentError::Runtime(e.to_string()))?;
                opts.registerer
                    .register(ticks.clone())
                    .map_err(|e| ComponentError::Runtime(e.to_string()))?;
                (opts.on_state_change)(json!({ "out": 0 }));
                Ok(Counter {
                    args: Mutex::new(args),
                    count: AtomicI64::new(0),
                    ticks,
                    on_state_change: opts.on_state_change.clone(),
                    probe: counter_probe.clone(),
                })
            },
        ))
        .unwrap();

    let passthrough_probe = probe.clone();
    registry
        .register(Registration::new(
            "passthrough",
            move |opts: Options, args: PassthroughArguments| {
                (opts.on_state_change)(json!({ "out": args.input }));
                Ok(Passthrough {
                    on_state_change: opts.on_state_change.clone(),
                    probe: passthrough_probe.clone(),
                })
            },
        ))
        .unwrap();

    let summation_probe = probe.clone();
    registry
        .register(Registration::new(
            "summation",
            move |opts: Options, args: SummationArguments| {
                let component = Summation {
                    sum: AtomicI64::new(0),
                    on_state_change: opts.on_state_change.clone(),
                    probe: summation_probe.clone(),
                };
                component.add(args.input);
                Ok(component)
            },
        ))
        .unwrap();

    registry
}

/// A controller over the test components, plus its shared registry.
pub fn test_controller(probe: &Probe) -> (Flow, prometheus::Registry) {
    let registry = prometheus::Registry::new();
    let flow = Flow::new(flow_runtime::Options {
        registry: registry.clone(),
        components: test_components(probe),
        data_path: std::env::temp_dir().join("flow-tests"),
        ..flow_runtime::Options::default()
    });
    (flow, registry)
}

/// Poll until `check` passes or three seconds elapse.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 3s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The `last_added` export of a summation node, if published.
pub async fn last_added(flow: &Flow, id: &str) -> Option<i64> {
    flow.get_export(id).await?.get("last_added")?.as_i64()
}
