//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Install a global fmt subscriber honouring `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One captured event.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub message: String,
    /// The `call` field of primitive-call events
    pub call: Option<String>,
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Captured>>>,
}

struct Fields(Captured);

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "call" {
            self.0.call = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.0.message = format!("{value:?}"),
            "call" => self.0.call = Some(format!("{value:?}")),
            _ => {}
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for Recorder {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields(Captured::default());
        event.record(&mut fields);
        self.events.lock().unwrap().push(fields.0);
    }
}

/// Events emitted on this thread while `f` runs.
pub fn capture<R>(f: impl FnOnce() -> R) -> (R, Vec<Captured>) {
    let recorder = Recorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    let out = tracing::subscriber::with_default(subscriber, f);
    let events = recorder.events.lock().unwrap().clone();
    (out, events)
}

/// Primitive calls among `events`, in order.
pub fn calls(events: &[Captured]) -> Vec<String> {
    events.iter().filter_map(|e| e.call.clone()).collect()
}
