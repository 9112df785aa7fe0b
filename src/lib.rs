#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod offline_store;
pub mod outbox;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub use app::App;
pub use capabilities::{Capabilities, Effect};
pub use crux_core::{render::Render, App as CruxApp};
pub use offline_store::OfflineStore;
pub use outbox::{
    EntryDraft, MoodIntensity, MoodRef, Outbox, OutboxEntry, PendingWrite, Tag, ValidationError,
    WriteError, WriteState,
};

pub const STORE_KEY_VERSION: u32 = 1;
pub const MAX_TITLE_LENGTH: usize = 100;
pub const MAX_CONTENT_LENGTH: usize = 50_000;
pub const MAX_TAGS_PER_ENTRY: usize = 10;
pub const MAX_TAG_LENGTH: usize = 30;
pub const OUTBOX_HIGH_WATER: usize = 1_000;
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 1_000;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const JITTER_MAX_MS: u64 = 1_000;
pub const CONTENT_PREVIEW_LENGTH: usize = 80;
pub const CREATE_ENTRY_TIMEOUT: Duration = Duration::from_secs(30);
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
pub const EMBEDDINGS_TIMEOUT: Duration = Duration::from_secs(15);
pub const ENTRIES_PATH: &str = "/rest/v1/entries";
pub const EMBEDDINGS_PATH: &str = "/functions/v1/generate-embeddings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Storage,
    Serialization,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Conflict | Self::RateLimited | Self::Storage => {
                ErrorSeverity::Transient
            }
            Self::Serialization | Self::InvalidState | Self::Internal => ErrorSeverity::Fatal,
            Self::Authentication | Self::Validation | Self::NotFound | Self::Unknown => {
                ErrorSeverity::Permanent
            }
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Storage | Self::Conflict
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Your entry is saved and will sync when you're back online."
                    .into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested entry could not be found.".into(),
            ErrorKind::Conflict => {
                "This change conflicts with a recent update. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => "Too many requests. Please wait a moment.".into(),
            ErrorKind::Storage => {
                "Unable to save locally. Your journal will only be kept in memory this session."
                    .into()
            }
            ErrorKind::Serialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::InvalidState => "Please sign in before writing an entry.".into(),
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;

// --- Typed identifiers ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(EntryId);
typed_id!(MoodId);
typed_id!(PromptId);
typed_id!(OpId);
typed_id!(LocalOpId);
typed_id!(IdempotencyKey);

impl OpId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl LocalOpId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl IdempotencyKey {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Calendar date of this instant in UTC.
    #[must_use]
    pub fn utc_date(self) -> NaiveDate {
        chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.0 as i64)
            .map(|dt| dt.date_naive())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn to_rfc3339(self) -> String {
        chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.0 as i64)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

// --- Wire types ---

/// A journal entry as the remote store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content_text: String,
    #[serde(default)]
    pub mood_id: Option<MoodId>,
    #[serde(default)]
    pub mood_intensity: Option<u8>,
    #[serde(default)]
    pub prompt_id: Option<PromptId>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub entry_date: NaiveDate,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Insert payload for the remote `entries` table. The temporary local id is
/// deliberately absent; the server mints the real one.
#[derive(Debug, Serialize)]
struct InsertEntryRequest<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    content_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mood_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mood_intensity: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_id: Option<&'a str>,
    tags: Vec<&'a str>,
    entry_date: NaiveDate,
    is_favorite: bool,
    created_at: String,
    updated_at: String,
}

impl<'a> InsertEntryRequest<'a> {
    fn from_write(write: &'a PendingWrite) -> Self {
        Self {
            user_id: write.user_id.as_str(),
            title: write.title.as_deref(),
            content_text: &write.content,
            mood_id: write.mood.as_ref().map(|m| m.id.as_str()),
            mood_intensity: write.mood.as_ref().map(|m| m.intensity.value()),
            prompt_id: write.prompt_id.as_ref().map(PromptId::as_str),
            tags: write.tags.iter().map(Tag::as_str).collect(),
            entry_date: write.entry_date,
            is_favorite: write.is_favorite,
            created_at: write.created_at.to_rfc3339(),
            updated_at: write.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    #[serde(rename = "entryId")]
    entry_id: &'a str,
}

// --- Flush coordinator state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushTrigger {
    ConnectivityRestored,
    Manual,
    EntryCreated,
    Startup,
}

impl FlushTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectivityRestored => "connectivity_restored",
            Self::Manual => "manual",
            Self::EntryCreated => "entry_created",
            Self::Startup => "startup",
        }
    }
}

/// One pass over the queue snapshot taken when the pass started.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushPass {
    pub remaining: std::collections::VecDeque<OpId>,
    pub succeeded: usize,
    pub failed: usize,
    pub trigger: FlushTrigger,
    pub started_at: UnixTimeMs,
}

/// `Idle -> Flushing -> Idle`. Set synchronously before the first request of
/// a pass is issued; a trigger that arrives while `Flushing` is dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FlushState {
    #[default]
    Idle,
    Flushing(FlushPass),
}

impl FlushState {
    #[must_use]
    pub const fn is_flushing(&self) -> bool {
        matches!(self, Self::Flushing(_))
    }
}

/// Aggregate outcome of the most recent flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub succeeded: usize,
    pub failed: usize,
    pub trigger: FlushTrigger,
    pub completed_at: UnixTimeMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToastKind {
    Success,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToastMessage {
    pub message: String,
    pub kind: ToastKind,
}

// --- Model ---

pub struct Model {
    pub user_id: Option<UserId>,
    pub auth_token: Option<String>,
    pub api_base: String,
    pub entries: Vec<ServerEntry>,
    pub offline_store: OfflineStore,
    pub network_online: bool,
    pub flush: FlushState,
    pub last_flush: Option<FlushReport>,
    pub is_refreshing: bool,
    pub persistence_degraded: bool,
    pub active_error: Option<AppError>,
    pub active_toast: Option<ToastMessage>,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            user_id: None,
            auth_token: None,
            api_base: String::new(),
            entries: Vec::new(),
            offline_store: OfflineStore::new(),
            // No connectivity signal yet means offline: the outbox fails
            // closed and keeps queuing until the shell says otherwise.
            network_online: false,
            flush: FlushState::Idle,
            last_flush: None,
            is_refreshing: false,
            persistence_degraded: false,
            active_error: None,
            active_toast: None,
        }
    }
}

impl Model {
    pub fn set_error(&mut self, error: AppError) {
        self.active_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.active_error = None;
    }

    pub fn show_toast(&mut self, message: impl Into<String>, kind: ToastKind) {
        self.active_toast = Some(ToastMessage {
            message: message.into(),
            kind,
        });
    }

    pub fn clear_toast(&mut self) {
        self.active_toast = None;
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

// --- Events ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // Session
    SessionStarted {
        user_id: UserId,
        auth_token: String,
        api_base: String,
    },
    SessionEnded,

    // Connectivity & sync
    NetworkStatusChanged {
        online: bool,
    },
    SyncNowRequested,
    OutboxFlushRequested {
        trigger: FlushTrigger,
    },
    EntryInsertResponse {
        op_id: OpId,
        result: Box<capabilities::HttpResult>,
    },
    EmbeddingsIndexResponse {
        entry_id: EntryId,
        result: Box<capabilities::HttpResult>,
    },

    // Entries
    EntryCreateRequested(Box<EntryDraft>),
    RefreshRequested,
    RefreshResponse(Box<capabilities::HttpResult>),
    FailedWritesDiscarded,

    // Persistence
    StoreRestoreRequested,
    StoreRestoreLoaded {
        result: Box<Result<Option<Vec<u8>>, capabilities::KvError>>,
    },
    StorePersisted {
        result: Box<Result<(), capabilities::KvError>>,
    },

    // UI
    ErrorCleared,
    ToastCleared,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded => "session_ended",
            Self::NetworkStatusChanged { .. } => "network_status_changed",
            Self::SyncNowRequested => "sync_now_requested",
            Self::OutboxFlushRequested { .. } => "outbox_flush_requested",
            Self::EntryInsertResponse { .. } => "entry_insert_response",
            Self::EmbeddingsIndexResponse { .. } => "embeddings_index_response",
            Self::EntryCreateRequested(_) => "entry_create_requested",
            Self::RefreshRequested => "refresh_requested",
            Self::RefreshResponse(_) => "refresh_response",
            Self::FailedWritesDiscarded => "failed_writes_discarded",
            Self::StoreRestoreRequested => "store_restore_requested",
            Self::StoreRestoreLoaded { .. } => "store_restore_loaded",
            Self::StorePersisted { .. } => "store_persisted",
            Self::ErrorCleared => "error_cleared",
            Self::ToastCleared => "toast_cleared",
        }
    }
}

// --- View model ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryListItem {
    pub id: String,
    pub title: Option<String>,
    pub preview: String,
    pub entry_date: NaiveDate,
    pub tags: Vec<String>,
    pub mood: Option<MoodRef>,
    pub is_favorite: bool,
    pub is_local: bool,
    /// Present only for not-yet-synced entries; drives the ambient
    /// "pending sync" indicator next to the item.
    pub sync_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.user_facing_message(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewModel {
    pub entries: Vec<EntryListItem>,
    pub pending_sync_count: usize,
    pub failed_sync_count: usize,
    pub is_syncing: bool,
    pub is_refreshing: bool,
    pub network_online: bool,
    pub persistence_degraded: bool,
    pub last_flush: Option<FlushReport>,
    pub error: Option<UserFacingError>,
    pub toast: Option<ToastMessage>,
}

pub mod app {
    use super::*;
    use crate::capabilities::{Capabilities, HttpError, HttpResult, KeyNamespace, KvError, KvKey};
    use crate::offline_store::OfflineStore;
    use crate::outbox::{OutboxEntry, PendingWrite, WriteError};
    use std::collections::VecDeque;
    use tracing::{debug, info, warn};

    #[derive(Default)]
    pub struct App;

    impl App {
        fn store_key(user_id: &UserId) -> Result<KvKey, KvError> {
            // Hash the user id so raw account identifiers never appear in
            // shell storage keys.
            let hash = blake3::hash(user_id.as_str().as_bytes());
            KvKey::new(
                KeyNamespace::Outbox,
                format!("journal_store_v{}_{}", STORE_KEY_VERSION, &hash.to_hex()[..16]),
            )
        }

        fn api_url(model: &Model, path: &str) -> String {
            format!("{}{}", model.api_base.trim_end_matches('/'), path)
        }

        /// Best-effort write-through of the offline store. Failures degrade to
        /// in-memory operation for the session; they are logged, never thrown.
        fn persist_store(model: &mut Model, caps: &Capabilities) {
            let Some(user_id) = &model.user_id else {
                caps.telemetry()
                    .error("persist_no_user", "cannot persist store without a session");
                return;
            };

            let key = match Self::store_key(user_id) {
                Ok(key) => key,
                Err(e) => {
                    caps.telemetry().error("persist_bad_key", &e.to_string());
                    return;
                }
            };

            let bytes = match model.offline_store.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode offline store");
                    caps.telemetry()
                        .error("persist_encode_failed", &e.to_string());
                    model.persistence_degraded = true;
                    return;
                }
            };

            caps.telemetry()
                .gauge("offline_store_bytes", bytes.len() as u64);

            caps.kv().set(key.raw(), bytes, |result| Event::StorePersisted {
                result: Box::new(result.map(|_| ()).map_err(KvError::from)),
            });
        }

        fn request_store_restore(model: &Model, caps: &Capabilities) {
            let Some(user_id) = &model.user_id else {
                return;
            };
            let key = match Self::store_key(user_id) {
                Ok(key) => key,
                Err(e) => {
                    caps.telemetry().error("restore_bad_key", &e.to_string());
                    return;
                }
            };
            caps.kv().get(key.raw(), |result| Event::StoreRestoreLoaded {
                result: Box::new(result.map_err(KvError::from)),
            });
        }

        fn send_insert_request(entry: &OutboxEntry, model: &Model, caps: &Capabilities) {
            let body = InsertEntryRequest::from_write(&entry.write);
            let op_id = entry.op_id.clone();

            let mut builder = caps
                .http()
                .post(&Self::api_url(model, ENTRIES_PATH))
                .header("Accept", "application/vnd.pgrst.object+json")
                .header("Prefer", "return=representation")
                .header("Idempotency-Key", entry.idempotency_key.as_str())
                .timeout(CREATE_ENTRY_TIMEOUT)
                .json(&body);

            if let Some(token) = &model.auth_token {
                builder = builder.header("Authorization", &format!("Bearer {token}"));
            }

            builder.send(move |result| Event::EntryInsertResponse {
                op_id,
                result: Box::new(result),
            });
        }

        /// Downstream semantic-search indexing. Best-effort by design: a
        /// committed entry is never rolled back because indexing failed.
        fn send_embeddings_request(entry_id: &EntryId, model: &Model, caps: &Capabilities) {
            let body = EmbeddingsRequest {
                entry_id: entry_id.as_str(),
            };
            let entry_id = entry_id.clone();

            let mut builder = caps
                .http()
                .post(&Self::api_url(model, EMBEDDINGS_PATH))
                .timeout(EMBEDDINGS_TIMEOUT)
                .json(&body);

            if let Some(token) = &model.auth_token {
                builder = builder.header("Authorization", &format!("Bearer {token}"));
            }

            builder.send(move |result| Event::EmbeddingsIndexResponse {
                entry_id,
                result: Box::new(result),
            });
        }

        fn send_refresh_request(model: &Model, caps: &Capabilities) {
            let Some(user_id) = &model.user_id else {
                return;
            };
            let url = format!(
                "{}?select=*&user_id=eq.{}&order=entry_date.desc",
                Self::api_url(model, ENTRIES_PATH),
                user_id
            );

            let mut builder = caps.http().get(&url).timeout(REFRESH_TIMEOUT);
            if let Some(token) = &model.auth_token {
                builder = builder.header("Authorization", &format!("Bearer {token}"));
            }

            builder.send(|result| Event::RefreshResponse(Box::new(result)));
        }

        fn classify_insert_result(result: &HttpResult) -> Result<ServerEntry, WriteError> {
            match result {
                Ok(response) if response.is_success() => response
                    .json::<ServerEntry>()
                    .map_err(|e| WriteError::invalid_response(e.to_string())),
                Ok(response) => {
                    let message = serde_json::from_slice::<ApiErrorResponse>(&response.body)
                        .ok()
                        .map(|e| e.message)
                        .filter(|m| !m.is_empty());
                    Err(WriteError::http_status(response.status, message))
                }
                Err(HttpError::Timeout { .. }) => Err(WriteError::timeout()),
                Err(HttpError::Network { message }) => Err(WriteError::network(message.clone())),
                Err(e) => Err(WriteError::invalid_response(e.to_string())),
            }
        }

        /// Issues the next insert of the current pass, or ends the pass when
        /// the snapshot is exhausted (or connectivity dropped mid-pass).
        fn dispatch_next(model: &mut Model, caps: &Capabilities) {
            loop {
                let next = match &mut model.flush {
                    FlushState::Idle => return,
                    FlushState::Flushing(pass) => {
                        if !model.network_online {
                            // Whatever was not attempted stays queued for the
                            // next rising edge.
                            pass.remaining.clear();
                            None
                        } else {
                            pass.remaining.pop_front()
                        }
                    }
                };

                let Some(op_id) = next else {
                    Self::finish_pass(model, caps);
                    return;
                };

                let now = UnixTimeMs::now();
                let entry = match model.offline_store.outbox.get_mut(&op_id) {
                    Some(entry) => {
                        entry.mark_in_flight(now);
                        entry.clone()
                    }
                    // Discarded since the snapshot was taken; skip it.
                    None => continue,
                };

                caps.telemetry().event(
                    "outbox_attempt",
                    &[
                        ("op_id", entry.op_id.as_str()),
                        ("attempt", &entry.attempt_count.to_string()),
                    ],
                );
                Self::send_insert_request(&entry, model, caps);
                return;
            }
        }

        fn finish_pass(model: &mut Model, caps: &Capabilities) {
            let FlushState::Flushing(pass) = std::mem::take(&mut model.flush) else {
                return;
            };

            let now = UnixTimeMs::now();
            if pass.succeeded > 0 {
                model.offline_store.last_sync_ms = Some(now.0);
            }

            info!(
                succeeded = pass.succeeded,
                failed = pass.failed,
                trigger = pass.trigger.as_str(),
                "outbox flush pass complete"
            );
            caps.telemetry().event(
                "outbox_flush_complete",
                &[
                    ("succeeded", &pass.succeeded.to_string()),
                    ("failed", &pass.failed.to_string()),
                    ("trigger", pass.trigger.as_str()),
                ],
            );

            model.last_flush = Some(FlushReport {
                succeeded: pass.succeeded,
                failed: pass.failed,
                trigger: pass.trigger,
                completed_at: now,
            });
            caps.render().render();
        }

        fn build_list_items(model: &Model) -> Vec<EntryListItem> {
            let mut items =
                Vec::with_capacity(model.offline_store.outbox.len() + model.entries.len());

            for entry in model.offline_store.outbox.iter() {
                let sync_status = match &entry.state {
                    WriteState::Queued {
                        next_attempt_at: None,
                    } => "Pending sync",
                    WriteState::Queued {
                        next_attempt_at: Some(_),
                    } => "Sync retry scheduled",
                    WriteState::InFlight { .. } => "Syncing...",
                    WriteState::Failed { .. } => "Sync failed",
                };

                items.push(EntryListItem {
                    id: entry.write.local_id.as_str().to_string(),
                    title: entry.write.title.clone(),
                    preview: entry.write.content_preview(CONTENT_PREVIEW_LENGTH),
                    entry_date: entry.write.entry_date,
                    tags: entry.write.tags.iter().map(ToString::to_string).collect(),
                    mood: entry.write.mood.clone(),
                    is_favorite: entry.write.is_favorite,
                    is_local: true,
                    sync_status: Some(sync_status.to_string()),
                });
            }

            for entry in &model.entries {
                let preview = if entry.content_text.len() <= CONTENT_PREVIEW_LENGTH {
                    entry.content_text.clone()
                } else {
                    let mut cut = CONTENT_PREVIEW_LENGTH;
                    while cut > 0 && !entry.content_text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    format!("{}...", &entry.content_text[..cut])
                };

                let mood = match (&entry.mood_id, entry.mood_intensity) {
                    (Some(id), intensity) => MoodIntensity::new(
                        intensity.unwrap_or(outbox::DEFAULT_MOOD_INTENSITY),
                    )
                    .ok()
                    .map(|intensity| MoodRef {
                        id: id.clone(),
                        intensity,
                    }),
                    (None, _) => None,
                };

                items.push(EntryListItem {
                    id: entry.id.as_str().to_string(),
                    title: entry.title.clone(),
                    preview,
                    entry_date: entry.entry_date,
                    tags: entry.tags.clone(),
                    mood,
                    is_favorite: entry.is_favorite,
                    is_local: false,
                    sync_status: None,
                });
            }

            // Stable sort: pending items stay ahead of synced ones that share
            // an entry date.
            items.sort_by(|a, b| b.entry_date.cmp(&a.entry_date));
            items
        }
    }

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
            caps.telemetry()
                .counter(&format!("event.{}", event.name()), 1);

            match event {
                Event::SessionStarted {
                    user_id,
                    auth_token,
                    api_base,
                } => {
                    model.user_id = Some(user_id);
                    model.auth_token = Some(auth_token);
                    model.api_base = api_base;
                    model.entries.clear();
                    model.offline_store = OfflineStore::new();
                    model.flush = FlushState::Idle;

                    self.update(Event::StoreRestoreRequested, model, caps);
                    caps.render().render();
                }

                Event::SessionEnded => {
                    model.user_id = None;
                    model.auth_token = None;
                    model.entries.clear();
                    model.offline_store = OfflineStore::new();
                    model.flush = FlushState::Idle;
                    model.last_flush = None;
                    model.active_error = None;
                    model.active_toast = None;
                    caps.render().render();
                }

                Event::NetworkStatusChanged { online } => {
                    let was_offline = !model.network_online;
                    model.network_online = online;

                    caps.telemetry()
                        .event("network_changed", &[("online", &online.to_string())]);

                    if online && was_offline {
                        self.update(
                            Event::OutboxFlushRequested {
                                trigger: FlushTrigger::ConnectivityRestored,
                            },
                            model,
                            caps,
                        );
                        if model.is_authenticated() {
                            self.update(Event::RefreshRequested, model, caps);
                        }
                    }
                    caps.render().render();
                }

                Event::SyncNowRequested => {
                    if !model.network_online {
                        model.show_toast("No internet connection", ToastKind::Warning);
                        caps.render().render();
                        return;
                    }
                    self.update(
                        Event::OutboxFlushRequested {
                            trigger: FlushTrigger::Manual,
                        },
                        model,
                        caps,
                    );
                }

                Event::OutboxFlushRequested { trigger } => {
                    if !model.network_online {
                        debug!("flush requested while offline; keeping queue");
                        return;
                    }
                    if !model.is_authenticated() {
                        return;
                    }
                    if model.flush.is_flushing() {
                        // At-most-one-flush: the trigger is dropped, not
                        // queued. Callers re-trigger once the pass is idle.
                        caps.telemetry().counter("outbox_flush_dropped", 1);
                        return;
                    }

                    let now = UnixTimeMs::now();
                    let remaining: VecDeque<OpId> =
                        model.offline_store.outbox.ready_ids(now).into();
                    if remaining.is_empty() {
                        return;
                    }

                    info!(
                        queued = remaining.len(),
                        trigger = trigger.as_str(),
                        "starting outbox flush pass"
                    );
                    model.flush = FlushState::Flushing(FlushPass {
                        remaining,
                        succeeded: 0,
                        failed: 0,
                        trigger,
                        started_at: now,
                    });
                    caps.render().render();
                    Self::dispatch_next(model, caps);
                }

                Event::EntryInsertResponse { op_id, result } => {
                    let now = UnixTimeMs::now();

                    match Self::classify_insert_result(&result) {
                        Ok(server_entry) => {
                            // Removal happens only here: the remote store has
                            // acknowledged the write.
                            if model.offline_store.outbox.dequeue(&op_id).is_some() {
                                if let FlushState::Flushing(pass) = &mut model.flush {
                                    pass.succeeded += 1;
                                }
                            }

                            model.entries.retain(|e| e.id != server_entry.id);
                            model.entries.push(server_entry.clone());

                            caps.telemetry()
                                .event("entry_synced", &[("server_id", server_entry.id.as_str())]);

                            Self::persist_store(model, caps);
                            Self::send_embeddings_request(&server_entry.id, model, caps);
                        }
                        Err(write_error) => {
                            warn!(
                                op_id = op_id.as_str(),
                                code = %write_error.code,
                                retryable = write_error.retryable,
                                "outbox write attempt failed"
                            );
                            caps.telemetry().event(
                                "entry_sync_failed",
                                &[
                                    ("op_id", op_id.as_str()),
                                    ("code", &write_error.code),
                                    ("retryable", &write_error.retryable.to_string()),
                                ],
                            );

                            if let Some(entry) = model.offline_store.outbox.get_mut(&op_id) {
                                entry.mark_failed(write_error, now);
                            }
                            if let FlushState::Flushing(pass) = &mut model.flush {
                                pass.failed += 1;
                            }
                            Self::persist_store(model, caps);
                        }
                    }

                    caps.render().render();
                    Self::dispatch_next(model, caps);
                }

                Event::EmbeddingsIndexResponse { entry_id, result } => {
                    // Fire-and-forget side channel: outcomes are logged and
                    // nothing else. The committed entry stands either way.
                    match *result {
                        Ok(response) if response.is_success() => {
                            caps.telemetry()
                                .counter("embeddings_indexed", 1);
                        }
                        Ok(response) => {
                            caps.telemetry().warn(
                                "embeddings_index_failed",
                                &format!("{} for entry {entry_id}", response.status),
                            );
                        }
                        Err(e) => {
                            caps.telemetry()
                                .warn("embeddings_index_failed", &e.to_string());
                        }
                    }
                }

                Event::EntryCreateRequested(draft) => {
                    let Some(user_id) = model.user_id.clone() else {
                        model.set_error(AppError::new(
                            ErrorKind::InvalidState,
                            "cannot create an entry without a session",
                        ));
                        caps.render().render();
                        return;
                    };

                    let now = UnixTimeMs::now();
                    let write = match PendingWrite::from_draft(*draft, &user_id, now) {
                        Ok(write) => write,
                        Err(e) => {
                            model.set_error(e.into());
                            caps.render().render();
                            return;
                        }
                    };

                    let entry = OutboxEntry::new(write, now);
                    caps.telemetry()
                        .event("entry_queued", &[("op_id", entry.op_id.as_str())]);

                    model.offline_store.outbox.enqueue(entry);
                    Self::persist_store(model, caps);

                    model.show_toast("Entry saved", ToastKind::Success);
                    caps.render().render();

                    if model.network_online {
                        self.update(
                            Event::OutboxFlushRequested {
                                trigger: FlushTrigger::EntryCreated,
                            },
                            model,
                            caps,
                        );
                    }
                }

                Event::RefreshRequested => {
                    if !model.network_online || !model.is_authenticated() || model.is_refreshing {
                        return;
                    }
                    model.is_refreshing = true;
                    Self::send_refresh_request(model, caps);
                    caps.render().render();
                }

                Event::RefreshResponse(result) => {
                    model.is_refreshing = false;
                    match *result {
                        Ok(response) if response.is_success() => {
                            match response.json::<Vec<ServerEntry>>() {
                                Ok(entries) => {
                                    model.entries = entries;
                                    caps.telemetry().event(
                                        "entries_refreshed",
                                        &[("count", &model.entries.len().to_string())],
                                    );
                                }
                                Err(e) => {
                                    caps.telemetry()
                                        .error("refresh_parse_failed", &e.to_string());
                                }
                            }
                        }
                        Ok(response) => {
                            caps.telemetry()
                                .warn("refresh_failed", &response.status.to_string());
                            model.show_toast("Couldn't refresh your journal", ToastKind::Warning);
                        }
                        Err(e) => {
                            caps.telemetry().warn("refresh_error", &e.to_string());
                        }
                    }
                    caps.render().render();
                }

                Event::FailedWritesDiscarded => {
                    let removed = model.offline_store.outbox.discard_failed();
                    if removed > 0 {
                        caps.telemetry()
                            .event("failed_writes_discarded", &[("count", &removed.to_string())]);
                        Self::persist_store(model, caps);
                        model.show_toast(
                            format!("Discarded {removed} unsyncable entries"),
                            ToastKind::Info,
                        );
                    }
                    caps.render().render();
                }

                Event::StoreRestoreRequested => {
                    Self::request_store_restore(model, caps);
                }

                Event::StoreRestoreLoaded { result } => {
                    match *result {
                        Ok(bytes) => {
                            model.offline_store = OfflineStore::restore(bytes.as_deref());
                            caps.telemetry().event(
                                "store_restored",
                                &[(
                                    "queued",
                                    &model.offline_store.outbox.len().to_string(),
                                )],
                            );
                        }
                        Err(e) => {
                            // An unreadable device store degrades to an empty
                            // in-memory queue; never a startup failure.
                            warn!(error = %e, "offline store load failed");
                            caps.telemetry().error("store_load_failed", &e.to_string());
                            model.offline_store = OfflineStore::new();
                        }
                    }
                    caps.render().render();

                    if model.network_online && !model.offline_store.outbox.is_empty() {
                        self.update(
                            Event::OutboxFlushRequested {
                                trigger: FlushTrigger::Startup,
                            },
                            model,
                            caps,
                        );
                    }
                }

                Event::StorePersisted { result } => match *result {
                    Ok(()) => {
                        model.persistence_degraded = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "offline store write failed; in-memory only");
                        caps.telemetry().error("persist_failed", &e.to_string());
                        model.persistence_degraded = true;
                    }
                },

                Event::ErrorCleared => {
                    model.clear_error();
                    caps.render().render();
                }

                Event::ToastCleared => {
                    model.clear_toast();
                    caps.render().render();
                }
            }
        }

        fn view(&self, model: &Model) -> ViewModel {
            ViewModel {
                entries: Self::build_list_items(model),
                pending_sync_count: model.offline_store.outbox.pending_count(),
                failed_sync_count: model.offline_store.outbox.failed_count(),
                is_syncing: model.flush.is_flushing(),
                is_refreshing: model.is_refreshing,
                network_online: model.network_online,
                persistence_degraded: model.persistence_degraded,
                last_flush: model.last_flush,
                error: model.active_error.as_ref().map(UserFacingError::from),
                toast: model.active_toast.clone(),
            }
        }
    }
}
