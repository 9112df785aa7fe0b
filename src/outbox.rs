use std::collections::VecDeque;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    IdempotencyKey, LocalOpId, MoodId, OpId, PromptId, UnixTimeMs, UserId, BASE_RETRY_DELAY_MS,
    JITTER_MAX_MS, MAX_CONTENT_LENGTH, MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY_MS, MAX_TAGS_PER_ENTRY,
    MAX_TAG_LENGTH, MAX_TITLE_LENGTH, OUTBOX_HIGH_WATER,
};

pub const DEFAULT_MOOD_INTENSITY: u8 = 3;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("entry content cannot be empty")]
    EmptyContent,

    #[error("entry content exceeds {max} bytes (got {len})")]
    ContentTooLong { len: usize, max: usize },

    #[error("title exceeds {max} bytes (got {len})")]
    TitleTooLong { len: usize, max: usize },

    #[error("too many tags: {count} exceeds maximum of {max}")]
    TooManyTags { count: usize, max: usize },

    #[error("invalid tag '{tag}': {reason}")]
    InvalidTag { tag: String, reason: &'static str },

    #[error("mood intensity {0} is out of range [1, 5]")]
    InvalidMoodIntensity(u8),

    #[error("mood intensity given without a mood")]
    IntensityWithoutMood,
}

/// Validated mood intensity on the app's 1-5 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodIntensity(u8);

impl MoodIntensity {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ValidationError::InvalidMoodIntensity(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

/// A mood reference and its intensity travel together; an intensity can never
/// exist without the mood it qualifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodRef {
    pub id: MoodId,
    pub intensity: MoodIntensity,
}

/// Validated tag: 1-30 bytes, alphanumeric plus space, '-' and '_'.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(String);

impl Tag {
    pub fn new(tag: impl Into<String>) -> Result<Self, ValidationError> {
        let tag = tag.into().trim().to_string();
        if tag.is_empty() {
            return Err(ValidationError::InvalidTag {
                tag,
                reason: "tag cannot be empty",
            });
        }
        if tag.len() > MAX_TAG_LENGTH {
            return Err(ValidationError::InvalidTag {
                tag,
                reason: "tag is too long",
            });
        }
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidTag {
                tag,
                reason: "tag contains invalid characters",
            });
        }
        Ok(Self(tag))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw entry input as it arrives from the shell's editor screen. Nothing here
/// is trusted; `PendingWrite::from_draft` is the validation boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub title: Option<String>,
    pub content: String,
    pub mood_id: Option<MoodId>,
    pub mood_intensity: Option<u8>,
    pub prompt_id: Option<PromptId>,
    pub tags: Vec<String>,
    pub entry_date: Option<NaiveDate>,
    pub is_favorite: bool,
}

/// A snapshot of a journal entry that has not yet been accepted by the remote
/// store. Constructed only through `from_draft`, so every instance holds
/// schema-valid data.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub local_id: LocalOpId,
    pub user_id: UserId,
    pub title: Option<String>,
    pub content: String,
    pub mood: Option<MoodRef>,
    pub prompt_id: Option<PromptId>,
    pub tags: Vec<Tag>,
    pub entry_date: NaiveDate,
    pub is_favorite: bool,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

impl PendingWrite {
    pub fn from_draft(
        draft: EntryDraft,
        user_id: &UserId,
        now: UnixTimeMs,
    ) -> Result<Self, ValidationError> {
        let content = draft.content;
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if content.len() > MAX_CONTENT_LENGTH {
            return Err(ValidationError::ContentTooLong {
                len: content.len(),
                max: MAX_CONTENT_LENGTH,
            });
        }

        if let Some(title) = &draft.title {
            if title.len() > MAX_TITLE_LENGTH {
                return Err(ValidationError::TitleTooLong {
                    len: title.len(),
                    max: MAX_TITLE_LENGTH,
                });
            }
        }

        if draft.tags.len() > MAX_TAGS_PER_ENTRY {
            return Err(ValidationError::TooManyTags {
                count: draft.tags.len(),
                max: MAX_TAGS_PER_ENTRY,
            });
        }
        let mut tags: Vec<Tag> = Vec::with_capacity(draft.tags.len());
        for raw in draft.tags {
            let tag = Tag::new(raw)?;
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let mood = match (draft.mood_id, draft.mood_intensity) {
            (Some(id), intensity) => Some(MoodRef {
                id,
                intensity: MoodIntensity::new(intensity.unwrap_or(DEFAULT_MOOD_INTENSITY))?,
            }),
            (None, Some(_)) => return Err(ValidationError::IntensityWithoutMood),
            (None, None) => None,
        };

        Ok(Self {
            local_id: LocalOpId::generate(),
            user_id: user_id.clone(),
            title: draft.title,
            content,
            mood,
            prompt_id: draft.prompt_id,
            tags,
            entry_date: draft.entry_date.unwrap_or_else(|| now.utc_date()),
            is_favorite: draft.is_favorite,
            created_at: now,
            updated_at: now,
        })
    }

    #[must_use]
    pub fn content_preview(&self, max_len: usize) -> String {
        if self.content.len() <= max_len {
            return self.content.clone();
        }
        let mut cut = max_len;
        while cut > 0 && !self.content.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &self.content[..cut])
    }
}

// Journal content is sensitive user data; keep it out of Debug output.
impl fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWrite")
            .field("local_id", &self.local_id)
            .field("user_id", &self.user_id)
            .field("title_present", &self.title.is_some())
            .field("content_len", &self.content.len())
            .field("mood", &self.mood)
            .field("prompt_id", &self.prompt_id)
            .field("tags", &self.tags.len())
            .field("entry_date", &self.entry_date)
            .field("is_favorite", &self.is_favorite)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Outcome of a failed insert attempt, classified at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteError {
    pub code: String,
    pub message: Option<String>,
    pub http_status: Option<u16>,
    pub retryable: bool,
}

impl WriteError {
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            code: "NETWORK_ERROR".into(),
            message: Some(message.into()),
            http_status: None,
            retryable: true,
        }
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self {
            code: "TIMEOUT".into(),
            message: None,
            http_status: None,
            retryable: true,
        }
    }

    #[must_use]
    pub fn http_status(status: u16, message: Option<String>) -> Self {
        // 408/429 and 5xx are worth retrying; other 4xx mean the record
        // itself was rejected and will never be accepted as-is.
        let retryable = status == 408 || status == 429 || (500..600).contains(&status);
        Self {
            code: format!("HTTP_{status}"),
            message,
            http_status: Some(status),
            retryable,
        }
    }

    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_RESPONSE".into(),
            message: Some(message.into()),
            http_status: None,
            retryable: false,
        }
    }
}

/// Delivery state of a queued write.
///
/// `Queued` doubles as the retry state: a write that failed a transient
/// attempt goes back to `Queued` with a `next_attempt_at` in the future.
/// `Failed` is terminal and only ever left by an explicit discard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteState {
    Queued { next_attempt_at: Option<UnixTimeMs> },
    InFlight { started_at: UnixTimeMs },
    Failed { failed_at: UnixTimeMs },
}

impl WriteState {
    #[must_use]
    pub const fn state_name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::InFlight { .. } => "in_flight",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A `PendingWrite` plus everything the flush coordinator needs to deliver it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub op_id: OpId,
    pub idempotency_key: IdempotencyKey,
    pub write: PendingWrite,
    pub enqueued_at: UnixTimeMs,
    pub state: WriteState,
    pub attempt_count: u32,
    pub last_error: Option<WriteError>,
}

impl OutboxEntry {
    #[must_use]
    pub fn new(write: PendingWrite, now: UnixTimeMs) -> Self {
        Self {
            op_id: OpId::generate(),
            // Generated once and reused on every retry so the backend can
            // deduplicate a write whose response we never saw.
            idempotency_key: IdempotencyKey::generate(),
            write,
            enqueued_at: now,
            state: WriteState::Queued {
                next_attempt_at: None,
            },
            attempt_count: 0,
            last_error: None,
        }
    }

    #[must_use]
    pub fn is_ready(&self, now: UnixTimeMs) -> bool {
        match &self.state {
            WriteState::Queued { next_attempt_at } => {
                next_attempt_at.map_or(true, |at| !now.is_before(at))
            }
            WriteState::InFlight { .. } | WriteState::Failed { .. } => false,
        }
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.state, WriteState::Failed { .. })
    }

    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self.state, WriteState::InFlight { .. })
    }

    pub fn mark_in_flight(&mut self, now: UnixTimeMs) {
        self.state = WriteState::InFlight { started_at: now };
        self.attempt_count += 1;
        self.write.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: WriteError, now: UnixTimeMs) {
        if !error.retryable || self.attempt_count >= MAX_RETRY_ATTEMPTS {
            self.state = WriteState::Failed { failed_at: now };
        } else {
            let delay = retry_delay_ms(self.attempt_count, generate_jitter());
            self.state = WriteState::Queued {
                next_attempt_at: Some(now.add_millis(delay)),
            };
        }
        self.last_error = Some(error);
        self.write.updated_at = now;
    }
}

/// Exponential backoff, capped, with caller-supplied jitter.
#[must_use]
pub fn retry_delay_ms(attempt: u32, jitter_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BASE_RETRY_DELAY_MS.saturating_mul(1u64 << exponent);
    base.min(MAX_RETRY_DELAY_MS).saturating_add(jitter_ms)
}

#[must_use]
pub fn generate_jitter() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..=JITTER_MAX_MS)
}

/// The ordered queue of writes not yet confirmed by the remote store.
/// Insertion order is retry order; an entry leaves the queue only when its
/// remote insert succeeds or the user discards it after a terminal failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outbox {
    entries: VecDeque<OutboxEntry>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a write. Infallible: an outbox that refused writes would have
    /// to drop journal entries on the floor. Growth past the high-water mark
    /// is logged instead.
    pub fn enqueue(&mut self, entry: OutboxEntry) {
        self.entries.push_back(entry);
        if self.entries.len() > OUTBOX_HIGH_WATER {
            warn!(
                len = self.entries.len(),
                "outbox is unusually deep; device may have been offline for a long time"
            );
        }
    }

    /// Removes the entry with `op_id`. Idempotent: unknown ids are a no-op.
    pub fn dequeue(&mut self, op_id: &OpId) -> Option<OutboxEntry> {
        let index = self.entries.iter().position(|e| &e.op_id == op_id)?;
        self.entries.remove(index)
    }

    #[must_use]
    pub fn get(&self, op_id: &OpId) -> Option<&OutboxEntry> {
        self.entries.iter().find(|e| &e.op_id == op_id)
    }

    #[must_use]
    pub fn get_mut(&mut self, op_id: &OpId) -> Option<&mut OutboxEntry> {
        self.entries.iter_mut().find(|e| &e.op_id == op_id)
    }

    /// Ids of entries eligible for a delivery attempt, in insertion order.
    /// This is the snapshot a flush pass works through.
    #[must_use]
    pub fn ready_ids(&self, now: UnixTimeMs) -> Vec<OpId> {
        self.entries
            .iter()
            .filter(|e| e.is_ready(now))
            .map(|e| e.op_id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.entries.iter()
    }

    /// Writes still awaiting sync (everything that has not terminally failed).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_failed()).count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_failed()).count()
    }

    /// Restart recovery: an attempt that was in flight when the process died
    /// never reported an outcome, so the entry goes back to the queue.
    pub fn reset_in_flight(&mut self) {
        for entry in &mut self.entries {
            if entry.is_in_flight() {
                entry.state = WriteState::Queued {
                    next_attempt_at: None,
                };
            }
        }
    }

    /// Drops terminally failed entries. Returns how many were removed.
    pub fn discard_failed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_failed());
        before - self.entries.len()
    }
}
