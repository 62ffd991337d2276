use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Kind of a tracked forum topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Search,
    Event,
    Info,
}

impl std::fmt::Display for TopicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicKind::Search => write!(f, "search"),
            TopicKind::Event => write!(f, "event"),
            TopicKind::Info => write!(f, "info"),
        }
    }
}

/// Kinds of detected topic mutations recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    TopicNew,
    StatusChange,
    TitleChange,
    CommentNew,
    InforgCommentNew,
    FirstPostChange,
    FieldTripNew,
    FieldTripChange,
    CoordsChange,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::TopicNew => write!(f, "topic_new"),
            ChangeKind::StatusChange => write!(f, "status_change"),
            ChangeKind::TitleChange => write!(f, "title_change"),
            ChangeKind::CommentNew => write!(f, "comment_new"),
            ChangeKind::InforgCommentNew => write!(f, "inforg_comment_new"),
            ChangeKind::FirstPostChange => write!(f, "first_post_change"),
            ChangeKind::FieldTripNew => write!(f, "field_trip_new"),
            ChangeKind::FieldTripChange => write!(f, "field_trip_change"),
            ChangeKind::CoordsChange => write!(f, "coords_change"),
        }
    }
}

/// Notification categories a subscriber can opt into.
///
/// `All` is the wildcard; `TitleChanges` is a diagnostics category only
/// fanned out to testers and admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    All,
    NewTopics,
    StatusChanges,
    TitleChanges,
    Comments,
    InforgComments,
    FirstPostChanges,
    FieldTrips,
    CoordsChanges,
    BotNews,
}

impl NotificationCategory {
    /// The category a change kind is fanned out under.
    pub fn for_kind(kind: ChangeKind) -> NotificationCategory {
        match kind {
            ChangeKind::TopicNew => NotificationCategory::NewTopics,
            ChangeKind::StatusChange => NotificationCategory::StatusChanges,
            ChangeKind::TitleChange => NotificationCategory::TitleChanges,
            ChangeKind::CommentNew => NotificationCategory::Comments,
            ChangeKind::InforgCommentNew => NotificationCategory::InforgComments,
            ChangeKind::FirstPostChange => NotificationCategory::FirstPostChanges,
            ChangeKind::FieldTripNew | ChangeKind::FieldTripChange => {
                NotificationCategory::FieldTrips
            }
            ChangeKind::CoordsChange => NotificationCategory::CoordsChanges,
        }
    }

    /// Diagnostics categories are delivered to testers and admins only.
    pub fn is_diagnostic(self) -> bool {
        matches!(self, NotificationCategory::TitleChanges)
    }
}

impl std::fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationCategory::All => write!(f, "all"),
            NotificationCategory::NewTopics => write!(f, "new_topics"),
            NotificationCategory::StatusChanges => write!(f, "status_changes"),
            NotificationCategory::TitleChanges => write!(f, "title_changes"),
            NotificationCategory::Comments => write!(f, "comments"),
            NotificationCategory::InforgComments => write!(f, "inforg_comments"),
            NotificationCategory::FirstPostChanges => write!(f, "first_post_changes"),
            NotificationCategory::FieldTrips => write!(f, "field_trips"),
            NotificationCategory::CoordsChanges => write!(f, "coords_changes"),
            NotificationCategory::BotNews => write!(f, "bot_news"),
        }
    }
}

/// Processing lifecycle of a change-log row. Exactly one terminal
/// transition per event, performed by the notification maker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ProcessingState {
    Unprocessed,
    InProgress,
    Done,
    Ignored,
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingState::Unprocessed => write!(f, "unprocessed"),
            ProcessingState::InProgress => write!(f, "in_progress"),
            ProcessingState::Done => write!(f, "done"),
            ProcessingState::Ignored => write!(f, "ignored"),
        }
    }
}

/// Kind of one queued message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationKind {
    Text,
    Location,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Text => write!(f, "text"),
            NotificationKind::Location => write!(f, "location"),
        }
    }
}

/// Subscriber role; testers and admins receive diagnostics categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SubscriberRole {
    Member,
    Tester,
    Admin,
}

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub lat: f64,
    pub lon: f64,
}

/// A declared subscriber age band, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBand {
    pub min: u32,
    pub max: u32,
}

impl AgeBand {
    /// Whether this band overlaps a topic's declared age range.
    /// A missing bound on the topic side means "unbounded".
    pub fn overlaps(self, topic_min: Option<i32>, topic_max: Option<i32>) -> bool {
        let tmin = topic_min.unwrap_or(0).max(0) as u32;
        let tmax = topic_max.map_or(u32::MAX, |m| m.max(0) as u32);
        self.min <= tmax && self.max >= tmin
    }
}

/// A tracked topic's attributes, joined onto every change event.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    pub topic_id: i64,
    pub kind: TopicKind,
    pub title: String,
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub age_min: Option<i32>,
    pub age_max: Option<i32>,
    pub region: String,
}

impl Topic {
    pub fn coords(&self) -> Option<Coords> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coords { lat, lon }),
            _ => None,
        }
    }
}

/// Kind-specific change payload, validated once at ingestion.
///
/// The change log stores the raw jsonb object; [`ChangePayload::from_kind`]
/// is the single place it is parsed. Downstream code matches on the enum
/// and never re-inspects raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangePayload {
    None,
    StatusChange {
        old: Option<String>,
        new: String,
    },
    TitleChange {
        old: Option<String>,
        new: String,
    },
    CommentNew {
        count: u32,
    },
    InforgComment {
        author: Option<String>,
        excerpt: Option<String>,
    },
    FirstPostChange {
        deletions: Vec<String>,
        additions: Vec<String>,
        freeform_message: Option<String>,
        old_coords: Option<Coords>,
        new_coords: Option<Coords>,
    },
    CoordsChange {
        old: Option<Coords>,
        new: Coords,
    },
    FieldTrip {
        summary: String,
    },
}

#[derive(Debug, Deserialize)]
struct OldNewRaw {
    old: Option<String>,
    new: String,
}

#[derive(Debug, Deserialize)]
struct CommentRaw {
    #[serde(default = "one")]
    count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct InforgRaw {
    author: Option<String>,
    excerpt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FirstPostRaw {
    #[serde(default)]
    deletions: Vec<String>,
    #[serde(default)]
    additions: Vec<String>,
    freeform_message: Option<String>,
    old_coords: Option<Coords>,
    new_coords: Option<Coords>,
}

#[derive(Debug, Deserialize)]
struct CoordsChangeRaw {
    old: Option<Coords>,
    new: Coords,
}

#[derive(Debug, Deserialize)]
struct FieldTripRaw {
    summary: String,
}

impl ChangePayload {
    /// Parse the raw jsonb payload of a change-log row according to its kind.
    pub fn from_kind(kind: ChangeKind, raw: &serde_json::Value) -> Result<Self, AppError> {
        let payload = match kind {
            ChangeKind::TopicNew => ChangePayload::None,
            ChangeKind::StatusChange => {
                let raw: OldNewRaw = parse(kind, raw)?;
                ChangePayload::StatusChange {
                    old: raw.old,
                    new: raw.new,
                }
            }
            ChangeKind::TitleChange => {
                let raw: OldNewRaw = parse(kind, raw)?;
                ChangePayload::TitleChange {
                    old: raw.old,
                    new: raw.new,
                }
            }
            ChangeKind::CommentNew => {
                let raw: CommentRaw = parse(kind, raw)?;
                ChangePayload::CommentNew { count: raw.count }
            }
            ChangeKind::InforgCommentNew => {
                let raw: InforgRaw = parse(kind, raw)?;
                ChangePayload::InforgComment {
                    author: raw.author,
                    excerpt: raw.excerpt,
                }
            }
            ChangeKind::FirstPostChange => {
                let raw: FirstPostRaw = parse(kind, raw)?;
                ChangePayload::FirstPostChange {
                    deletions: raw.deletions,
                    additions: raw.additions,
                    freeform_message: raw.freeform_message,
                    old_coords: raw.old_coords,
                    new_coords: raw.new_coords,
                }
            }
            ChangeKind::FieldTripNew | ChangeKind::FieldTripChange => {
                let raw: FieldTripRaw = parse(kind, raw)?;
                ChangePayload::FieldTrip {
                    summary: raw.summary,
                }
            }
            ChangeKind::CoordsChange => {
                let raw: CoordsChangeRaw = parse(kind, raw)?;
                ChangePayload::CoordsChange {
                    old: raw.old,
                    new: raw.new,
                }
            }
        };
        Ok(payload)
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    kind: ChangeKind,
    raw: &serde_json::Value,
) -> Result<T, AppError> {
    serde_json::from_value(raw.clone())
        .map_err(|e| AppError::Payload(format!("malformed {} payload: {}", kind, e)))
}

/// One enriched change event: a change-log row plus its topic attributes,
/// payload already validated.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: i64,
    pub topic_id: i64,
    pub kind: ChangeKind,
    pub payload: ChangePayload,
    pub detected_at: DateTime<Utc>,
    pub topic: Topic,
}

impl ChangeEvent {
    pub fn category(&self) -> NotificationCategory {
        NotificationCategory::for_kind(self.kind)
    }

    /// Whether this event is a transition into a terminal search status
    /// (stop / found-alive / found-dead / completed).
    pub fn is_terminal_status_change(&self) -> bool {
        match &self.payload {
            ChangePayload::StatusChange { new, .. } => is_terminal_status(new),
            _ => false,
        }
    }
}

/// Terminal status phrases as the forum renders them.
const TERMINAL_STATUSES: [&str; 5] = ["СТОП", "Стоп", "Завершен", "НЖ", "НП"];

pub fn is_terminal_status(status: &str) -> bool {
    let status = status.trim();
    TERMINAL_STATUSES.iter().any(|t| status.starts_with(t))
}

/// A subscriber row: notification preferences owned by the preferences
/// subsystem, read-only here apart from the `active` flag.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscriber {
    pub user_id: i64,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub radius_km: Option<f64>,
    pub regions: Vec<String>,
    pub topic_kinds: Vec<String>,
    pub age_bands: serde_json::Value,
    pub categories: Vec<String>,
    pub follow_whitelist: bool,
    pub role: SubscriberRole,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn home_coords(&self) -> Option<Coords> {
        match (self.home_lat, self.home_lon) {
            (Some(lat), Some(lon)) => Some(Coords { lat, lon }),
            _ => None,
        }
    }

    /// Declared age bands, parsed from jsonb. A malformed value logs a
    /// warning and acts as "no restriction" for this subscriber.
    pub fn parsed_age_bands(&self) -> Vec<AgeBand> {
        match serde_json::from_value(self.age_bands.clone()) {
            Ok(bands) => bands,
            Err(e) => {
                tracing::warn!(user_id = self.user_id, error = %e, "Malformed age_bands, treating as unrestricted");
                Vec::new()
            }
        }
    }

    /// Radius in km, if set to a usable positive finite value.
    pub fn effective_radius_km(&self) -> Option<f64> {
        match self.radius_km {
            Some(r) if r.is_finite() && r > 0.0 => Some(r),
            Some(r) => {
                if !r.is_finite() || r < 0.0 {
                    tracing::warn!(user_id = self.user_id, radius = r, "Malformed radius, treating as unrestricted");
                }
                None
            }
            None => None,
        }
    }

    pub fn wants_category(&self, category: NotificationCategory) -> bool {
        let wanted = category.to_string();
        self.categories
            .iter()
            .any(|c| c == "all" || *c == wanted)
    }

    pub fn wants_all(&self) -> bool {
        self.categories.iter().any(|c| c == "all")
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, SubscriberRole::Tester | SubscriberRole::Admin)
    }
}

/// One queued message row. Born `created`, mutates exactly once into a
/// terminal status; never deleted — the rows are the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingNotification {
    pub message_id: i64,
    pub mailing_id: Uuid,
    pub change_event_id: i64,
    pub user_id: i64,
    pub kind: NotificationKind,
    pub content: Option<String>,
    pub params: serde_json::Value,
    pub group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub failure_detail: Option<String>,
}

/// Typed view of a pending notification's `params` jsonb.
///
/// All fields are optional — omitted fields fall back to channel defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageParams {
    pub parse_mode: Option<String>,
    pub disable_preview: Option<bool>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl MessageParams {
    pub fn from_value(value: &serde_json::Value) -> MessageParams {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}
