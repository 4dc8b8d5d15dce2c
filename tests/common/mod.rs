// Not every test binary uses every helper.
#![allow(dead_code)]

pub mod fault_injection;

use durable_sequence::providers::in_memory::InMemoryInstanceStore;
use durable_sequence::runtime::activity::{ActivityContext, ActivityRegistryBuilder};
use durable_sequence::runtime::{Runtime, RuntimeOptions};
use durable_sequence::{ActivityRegistry, InstanceStatusView};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Runtime over a fresh in-memory store.
pub fn runtime_with(activities: ActivityRegistry) -> (Arc<Runtime>, Arc<InMemoryInstanceStore>) {
    let store = Arc::new(InMemoryInstanceStore::new());
    let rt = Runtime::start_with_options(store.clone(), activities, fast_options());
    (rt, store)
}

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        activity_timeout: Some(Duration::from_secs(5)),
        wait_poll_interval: Duration::from_millis(2),
        ..RuntimeOptions::default()
    }
}

/// Poll status until `predicate` holds or `timeout_ms` elapses.
pub async fn wait_for_status<F>(rt: &Runtime, instance: &str, predicate: F, timeout_ms: u64) -> Option<InstanceStatusView>
where
    F: Fn(&InstanceStatusView) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(view) = rt.get_orchestration_status(instance).await {
            if predicate(&view) {
                return Some(view);
            }
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Activity that blocks until the test opens the gate once per call.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `n` blocked (or future) calls through.
    pub fn open(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Register `name` as an echo activity that waits for the gate.
    pub fn register(&self, builder: ActivityRegistryBuilder, name: &str) -> ActivityRegistryBuilder {
        let permits = self.permits.clone();
        builder.register(name, move |_ctx: ActivityContext, input: String| {
            let permits = permits.clone();
            async move {
                let permit = permits.acquire().await.map_err(|e| e.to_string())?;
                permit.forget();
                Ok::<String, String>(format!("gated:{input}"))
            }
        })
    }
}

/// Activity names and inputs in the order they were invoked.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ctx: &ActivityContext, input: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.activity_name().to_string(), input.to_string()));
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn inputs_for(&self, name: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, i)| i)
            .collect()
    }

    /// `SayHello` plus a `FailingActivity`, both recorded in this log.
    pub fn hello_registry(&self) -> ActivityRegistryBuilder {
        let hello_log = self.clone();
        let fail_log = self.clone();
        ActivityRegistry::builder()
            .register("SayHello", move |ctx: ActivityContext, name: String| {
                let log = hello_log.clone();
                async move {
                    log.record(&ctx, &name);
                    Ok(format!("Hello {name}!"))
                }
            })
            .register("FailingActivity", move |ctx: ActivityContext, input: String| {
                let log = fail_log.clone();
                async move {
                    log.record(&ctx, &input);
                    Err("simulated failure".to_string())
                }
            })
    }
}
