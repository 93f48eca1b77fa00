use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::classify::ClassifierRules;

/// One record fetched from the remote collection.
///
/// `id` is the identity; everything else is a snapshot of the remote record
/// at fetch time. Top-level fields this crate does not interpret are kept in
/// `extra` so exports stay lossless.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Item {
    #[serde(deserialize_with = "id_from_scalar")]
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub defunct: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    /// Build a bare item, mostly useful for tests and fixtures.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            attributes: BTreeMap::new(),
            defunct: false,
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_defunct(mut self, defunct: bool) -> Self {
        self.defunct = defunct;
        self
    }

    /// Render a scalar attribute as text. Missing and `null` values are `None`.
    pub fn attribute_str(&self, key: &str) -> Option<String> {
        match self.attributes.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Something the collector can fold into a [`CollectionResult`].
pub trait Record: Send {
    /// Identity used for dedup. Records without one are never duplicates.
    fn key(&self) -> Option<String>;
    fn is_defunct(&self) -> bool;
}

impl Record for Item {
    fn key(&self) -> Option<String> {
        Some(self.id.clone())
    }

    fn is_defunct(&self) -> bool {
        self.defunct
    }
}

/// Untyped records, as exported verbatim.
impl Record for Value {
    fn key(&self) -> Option<String> {
        match self.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn is_defunct(&self) -> bool {
        self.get("defunct").and_then(Value::as_bool).unwrap_or(false)
    }
}

/// One bounded batch returned by a single provider request.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T = Item> {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<T>,
    #[serde(default, deserialize_with = "token_from_scalar")]
    pub next: Option<String>,
    /// The body was a single record rather than a `data` envelope.
    /// Nothing follows it.
    #[serde(skip)]
    pub bare: bool,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self {
            data,
            next: None,
            bare: false,
        }
    }

    pub fn bare(record: T) -> Self {
        Self {
            data: vec![record],
            next: None,
            bare: true,
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Position marker for the next page request.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    Offset(u64),
    Token(String),
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::Offset(0)
    }
}

impl Cursor {
    /// Position after consuming `n` items at this cursor. Tokens do not move.
    pub fn advanced_by(&self, n: u64) -> Cursor {
        match self {
            Cursor::Offset(o) => Cursor::Offset(o + n),
            Cursor::Token(t) => Cursor::Token(t.clone()),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Offset(n) => write!(f, "{n}"),
            Cursor::Token(t) => f.write_str(t),
        }
    }
}

/// How a collection run ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The provider signalled end of data.
    #[default]
    Completed,
    /// The item ceiling was reached while more data remained.
    Truncated,
    /// A transport, decode or provider fault ended the run early.
    Aborted,
    /// The run was cancelled by a restart or shutdown.
    Cancelled,
}

impl RunOutcome {
    pub fn is_truncated(self) -> bool {
        self != RunOutcome::Completed
    }
}

/// Running counters for one collection run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Distinct items examined.
    pub scanned: u64,
    pub matched: u64,
    /// Matched items not flagged defunct.
    pub active: u64,
    pub defunct: u64,
    /// Items received again after their id was already seen.
    pub duplicates: u64,
    pub pages: u64,
}

/// Accumulated output of one collection run.
#[derive(Debug, Clone)]
pub struct CollectionResult<T = Item> {
    pub items: Vec<T>,
    pub seen: HashSet<String>,
    pub summary: Summary,
    /// Where the next page would be read from.
    pub cursor: Cursor,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

impl<T> Default for CollectionResult<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
            summary: Summary::default(),
            cursor: Cursor::default(),
            outcome: RunOutcome::default(),
            error: None,
        }
    }
}

impl<T: Record> CollectionResult<T> {
    pub fn truncated(&self) -> bool {
        self.outcome.is_truncated()
    }

    /// Fold one fetched item in. Returns `false` if the id was already seen.
    pub(crate) fn absorb(&mut self, item: T, matched: bool) -> bool {
        if let Some(key) = item.key() {
            if !self.seen.insert(key) {
                self.summary.duplicates += 1;
                return false;
            }
        }
        self.summary.scanned += 1;
        if matched {
            self.summary.matched += 1;
            if item.is_defunct() {
                self.summary.defunct += 1;
            } else {
                self.summary.active += 1;
            }
            self.items.push(item);
        }
        true
    }

    /// Items received so far, duplicates included.
    pub fn received(&self) -> u64 {
        self.summary.scanned + self.summary.duplicates
    }
}

/// Dashboard row for one matched device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub model: String,
    pub status: String,
}

impl DeviceRecord {
    pub fn from_item(item: &Item, rules: &ClassifierRules) -> Self {
        Self {
            id: item.id.clone(),
            name: item
                .description
                .clone()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| rules.name_fallback.clone()),
            ip: item
                .attribute_str(&rules.ip_attribute)
                .unwrap_or_else(|| "N/A".to_string()),
            model: item
                .attribute_str(&rules.type_attribute)
                .unwrap_or_else(|| rules.model_fallback.clone()),
            status: if item.defunct { "Defunct" } else { "Active" }.to_string(),
        }
    }
}

/// Snapshot of the current (or last) collection run, as polled by the dashboard.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub run: u64,
    pub is_running: bool,
    /// Position the next page is read from.
    pub cursor: Option<String>,
    pub scanned: u64,
    pub matched: u64,
    pub started_at: Option<String>,
    pub last_completed: Option<String>,
    pub outcome: Option<RunOutcome>,
    pub truncated: bool,
    pub error: Option<String>,
}

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn id_from_scalar<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "item id must be a string or number, got {other}"
        ))),
    }
}

fn token_from_scalar<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
