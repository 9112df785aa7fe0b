use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

/// Fire-and-forget analytics channel. The shell forwards these to whatever
/// product-analytics backend it is wired to; the core never waits for them
/// and their loss is acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryOperation {
    Counter {
        name: String,
        delta: u64,
    },
    Event {
        name: String,
        attributes: Vec<(String, String)>,
    },
    Gauge {
        name: String,
        value: u64,
    },
    Warn {
        name: String,
        message: String,
    },
    Error {
        name: String,
        message: String,
    },
}

impl Operation for TelemetryOperation {
    type Output = ();
}

pub struct Telemetry<Ev> {
    context: CapabilityContext<TelemetryOperation, Ev>,
}

impl<Ev> Clone for Telemetry<Ev> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<Ev> Capability<Ev> for Telemetry<Ev> {
    type Operation = TelemetryOperation;
    type MappedSelf<MappedEv> = Telemetry<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static,
    {
        Telemetry::new(self.context.map_event(f))
    }
}

impl<Ev> Telemetry<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<TelemetryOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn counter(&self, name: &str, delta: u64) {
        self.notify(TelemetryOperation::Counter {
            name: name.to_string(),
            delta,
        });
    }

    pub fn event(&self, name: &str, attributes: &[(&str, &str)]) {
        self.notify(TelemetryOperation::Event {
            name: name.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
    }

    pub fn gauge(&self, name: &str, value: u64) {
        self.notify(TelemetryOperation::Gauge {
            name: name.to_string(),
            value,
        });
    }

    pub fn warn(&self, name: &str, message: &str) {
        self.notify(TelemetryOperation::Warn {
            name: name.to_string(),
            message: message.to_string(),
        });
    }

    pub fn error(&self, name: &str, message: &str) {
        self.notify(TelemetryOperation::Error {
            name: name.to_string(),
            message: message.to_string(),
        });
    }

    fn notify(&self, operation: TelemetryOperation) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(operation).await;
        });
    }
}
