use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The single externally-published status. Every other status is treated as
/// not visible.
pub const VISIBLE_STATUS: &str = "publish";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub const ALL: [ChangeAction; 3] = [
        ChangeAction::Create,
        ChangeAction::Update,
        ChangeAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }

    pub fn parse_action(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ChangeAction::Create),
            "update" => Some(ChangeAction::Update),
            "delete" => Some(ChangeAction::Delete),
            _ => None,
        }
    }

    /// Drain priority: removals before additions, additions before edits.
    pub fn drain_rank(&self) -> u8 {
        match self {
            ChangeAction::Delete => 0,
            ChangeAction::Create => 1,
            ChangeAction::Update => 2,
        }
    }

    /// Classify a status transition. `None` means nothing to record.
    pub fn classify(old_status: &str, new_status: &str) -> Option<Self> {
        let was_visible = old_status == VISIBLE_STATUS;
        let is_visible = new_status == VISIBLE_STATUS;
        match (was_visible, is_visible) {
            (false, true) => Some(ChangeAction::Create),
            (true, true) => Some(ChangeAction::Update),
            (true, false) => Some(ChangeAction::Delete),
            (false, false) => None,
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content row as handed over by the content-storage system.
///
/// Timestamps are `None` when storage holds the zero-date sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    pub id: i64,
    pub content_type: String,
    pub status: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub password: String,
    pub author_id: i64,
    #[serde(default, with = "storage_date")]
    pub date: Option<NaiveDateTime>,
    #[serde(default, with = "storage_date")]
    pub date_gmt: Option<NaiveDateTime>,
    #[serde(default, with = "storage_date")]
    pub modified: Option<NaiveDateTime>,
    #[serde(default, with = "storage_date")]
    pub modified_gmt: Option<NaiveDateTime>,
}

/// Storage timestamps: `YYYY-MM-DD HH:MM:SS` or ISO 8601 without offset.
/// The all-zero sentinel and `null` both mean "no date".
pub mod storage_date {
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const ZERO_DATE: &str = "0000-00-00 00:00:00";

    pub fn parse(raw: &str) -> Result<Option<NaiveDateTime>, chrono::ParseError> {
        let raw = raw.trim();
        if raw.is_empty() || raw == ZERO_DATE {
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
            .map(Some)
    }

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => parse(&raw).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuthorSnapshot {
    pub login: String,
    pub nicename: String,
    pub url: String,
    pub display_name: String,
}

/// Immutable, denormalized capture of a content item taken when the mutation
/// was observed. The content row may be gone by the time it is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub content: Content,
    pub permalink: Option<String>,
    pub featured_image: Option<String>,
    pub author: Option<AuthorSnapshot>,
}

impl ChangeRecord {
    pub fn new(
        content: Content,
        permalink: Option<String>,
        featured_image: Option<String>,
        author: Option<AuthorSnapshot>,
    ) -> Self {
        Self {
            content,
            permalink,
            featured_image,
            author,
        }
    }

    pub fn content_id(&self) -> i64 {
        self.content.id
    }

    pub fn content_type(&self) -> &str {
        &self.content.content_type
    }
}

/// A drained ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub action: ChangeAction,
    pub record: ChangeRecord,
    pub revision: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Every item of a content type.
    Collection { content_type: String },
    /// One specific content item.
    Item { content_type: String, content_id: i64 },
}

impl Scope {
    pub fn collection(content_type: impl Into<String>) -> Self {
        Scope::Collection {
            content_type: content_type.into(),
        }
    }

    pub fn item(content_type: impl Into<String>, content_id: i64) -> Self {
        Scope::Item {
            content_type: content_type.into(),
            content_id,
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            Scope::Collection { content_type } | Scope::Item { content_type, .. } => content_type,
        }
    }

    pub fn content_id(&self) -> Option<i64> {
        match self {
            Scope::Collection { .. } => None,
            Scope::Item { content_id, .. } => Some(*content_id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Collection { content_type } => write!(f, "{}", content_type),
            Scope::Item {
                content_type,
                content_id,
            } => write!(f, "{}/{}", content_type, content_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: i64,
    pub target: String,
    pub events: BTreeSet<ChangeAction>,
    pub scope: Scope,
    pub signature_digest: String,
}

impl Subscription {
    pub fn wants(&self, action: ChangeAction) -> bool {
        self.events.contains(&action)
    }
}

/// Comma-joined event names in canonical order, as stored.
pub fn events_to_string(events: &BTreeSet<ChangeAction>) -> String {
    events
        .iter()
        .map(ChangeAction::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn events_from_str(s: &str) -> BTreeSet<ChangeAction> {
    s.split(',')
        .filter_map(|e| ChangeAction::parse_action(e.trim()))
        .collect()
}
