//! Normalization of untyped request bodies.
//!
//! Callers nest action values in several ways: `{values: {values: {..}}}`,
//! `{values: {..}}` or directly at the top level. Every action goes through
//! [`values_of`], which tries these conventions in that order and keeps the
//! first object carrying at least one known field.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::{CommentFilter, CommentId, CommentType, Error, NewComment, Target, UserId};

/// Query string accepted alongside every action
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, serde::Serialize)]
pub struct ActionQuery {
    #[serde(default, rename = "filterByTk", skip_serializing_if = "Option::is_none")]
    pub filter_by_tk: Option<String>,

    /// JSON-encoded list filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

const KNOWN_KEYS: &[&str] = &[
    "targetCollection",
    "targetId",
    "content",
    "parentId",
    "type",
    "metadata",
    "filter",
    "filterByTk",
    "id",
    "action",
    "field",
    "oldValue",
    "newValue",
];

fn nesting_levels(body: &Value) -> [Option<&Value>; 3] {
    [
        body.get("values").and_then(|v| v.get("values")),
        body.get("values"),
        Some(body),
    ]
}

/// Returns the object holding the action values, if any convention matched
pub fn values_of(body: &Value) -> Option<&Map<String, Value>> {
    nesting_levels(body)
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_object())
        .find(|o| KNOWN_KEYS.iter().any(|k| o.contains_key(*k)))
}

/// Deserializes the action values into `T`, an absent or unmatched body yielding `T::default()`
pub fn extract<T: DeserializeOwned + Default>(body: &Value) -> Result<T, Error> {
    match values_of(body) {
        None => Ok(T::default()),
        Some(values) => serde_json::from_value(Value::Object(values.clone()))
            .map_err(|e| Error::InvalidRequest(format!("malformed action values: {e}"))),
    }
}

fn value_to_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    value_to_string(Value::deserialize(d)?)
        .ok_or_else(|| serde::de::Error::custom("expected a string or a number"))
}

pub fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        v => value_to_string(v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected a string or a number")),
    }
}

pub fn opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        v => value_to_i64(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected an integer id")),
    }
}

/// Values accepted by `comments:create`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentValues {
    #[serde(default)]
    pub target_collection: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub parent_id: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<CommentType>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl CommentValues {
    pub fn into_new_comment(self, author_id: Option<UserId>) -> Result<NewComment, Error> {
        let target = Target::new(
            self.target_collection.unwrap_or_default(),
            self.target_id.unwrap_or_default(),
        );
        target.validate()?;
        let content = self.content.unwrap_or_default();
        crate::validate_string(&content)?;
        if content.trim().is_empty() {
            return Err(Error::InvalidRequest(String::from(
                "content must not be empty",
            )));
        }
        if let Some(metadata) = &self.metadata {
            crate::validate_json(metadata)?;
        }
        Ok(NewComment {
            author_id,
            target,
            content,
            parent_id: self.parent_id.map(CommentId),
            kind: self.kind.unwrap_or_default(),
            metadata: self.metadata,
        })
    }
}

/// Values accepted by `comments:update`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct UpdateValues {
    #[serde(default)]
    pub content: Option<String>,
}

impl UpdateValues {
    pub fn into_content(self) -> Result<String, Error> {
        let content = self
            .content
            .ok_or_else(|| Error::InvalidRequest(String::from("content is required")))?;
        crate::validate_string(&content)?;
        if content.trim().is_empty() {
            return Err(Error::InvalidRequest(String::from(
                "content must not be empty",
            )));
        }
        Ok(content)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterValues {
    #[serde(default)]
    target_collection: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    target_id: Option<String>,
    #[serde(default, alias = "userId", deserialize_with = "opt_id")]
    author_id: Option<i64>,
    #[serde(default, deserialize_with = "opt_id")]
    parent_id: Option<i64>,
    #[serde(default, rename = "type")]
    kind: Option<CommentType>,
}

impl FilterValues {
    fn is_empty(&self) -> bool {
        self.target_collection.is_none()
            && self.target_id.is_none()
            && self.author_id.is_none()
            && self.parent_id.is_none()
            && self.kind.is_none()
    }

    fn into_filter(self) -> CommentFilter {
        CommentFilter {
            target_collection: self.target_collection,
            target_id: self.target_id,
            author_id: self.author_id.map(UserId),
            parent_id: self.parent_id.map(CommentId),
            kind: self.kind,
            include_deleted: false,
        }
    }
}

fn parse_filter(v: &Value) -> Result<FilterValues, Error> {
    serde_json::from_value(v.clone())
        .map_err(|e| Error::InvalidRequest(format!("malformed filter: {e}")))
}

/// Builds the `comments:list` filter from the body, falling back to a JSON
/// `filter` query parameter when the body carried nothing
pub fn comment_filter(body: &Value, query_filter: Option<&str>) -> Result<CommentFilter, Error> {
    let mut filter = FilterValues::default();
    if let Some(values) = values_of(body) {
        if let Some(f) = values.get("filter").filter(|f| f.is_object()) {
            filter = parse_filter(f)?;
        }
        let direct = parse_filter(&Value::Object(values.clone()))?;
        if direct.target_collection.is_some() {
            filter.target_collection = direct.target_collection;
        }
        if direct.target_id.is_some() {
            filter.target_id = direct.target_id;
        }
    }
    if filter.is_empty() {
        if let Some(q) = query_filter {
            let q: Value = serde_json::from_str(q)
                .map_err(|e| Error::InvalidRequest(format!("filter is not valid json: {e}")))?;
            filter = parse_filter(&q)?;
        }
    }
    Ok(filter.into_filter())
}

/// Finds the primary key an action applies to: the `filterByTk` query
/// parameter, then `filterByTk` at each nesting level, then `id`
pub fn filter_by_tk(query: Option<&str>, body: &Value) -> Result<i64, Error> {
    let missing = || Error::InvalidRequest(String::from("filterByTk is required"));
    if let Some(q) = query {
        return q
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("filterByTk {q:?} is not an integer")));
    }
    let mut levels = nesting_levels(body).to_vec();
    levels.reverse();
    for level in levels.into_iter().flatten() {
        if let Some(tk) = level.get("filterByTk") {
            return value_to_i64(tk).ok_or_else(missing);
        }
    }
    values_of(body)
        .and_then(|v| v.get("id"))
        .and_then(value_to_i64)
        .ok_or_else(missing)
}
