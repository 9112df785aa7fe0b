mod http;
mod kv;
mod telemetry;

pub use self::http::{
    Http, HttpError, HttpHeaders, HttpMethod, HttpOperation, HttpOutput, HttpRequest,
    HttpResponse, HttpResult, RequestBuilder, ValidatedUrl,
};
pub use self::kv::{KeyNamespace, KvCapability, KvError, KvKey, KvResult};
pub use self::telemetry::{Telemetry, TelemetryOperation};

pub use crux_core::render::Render;
pub use crux_kv::KeyValue;

use crate::Event;

/// The `Effect` derive names each generated variant after the capability type
/// in the field; this alias keeps the key-value variant `Kv` rather than
/// `KeyValue`.
pub type Kv<Ev> = KeyValue<Ev>;

pub type AppHttp = Http<Event>;
pub type AppKv = KeyValue<Event>;
pub type AppRender = Render<Event>;
pub type AppTelemetry = Telemetry<Event>;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),
}

#[derive(crux_core::macros::Effect)]
#[effect(app = "crate::App")]
pub struct Capabilities {
    pub http: Http<Event>,
    pub kv: Kv<Event>,
    pub render: Render<Event>,
    pub telemetry: Telemetry<Event>,
}

impl Capabilities {
    pub fn http(&self) -> &AppHttp {
        &self.http
    }

    pub fn kv(&self) -> &AppKv {
        &self.kv
    }

    pub fn render(&self) -> &AppRender {
        &self.render
    }

    pub fn telemetry(&self) -> &AppTelemetry {
        &self.telemetry
    }
}
