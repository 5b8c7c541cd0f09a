use std::fmt;

use crate::{Error, Time, User, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct CommentId(pub i64);

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The external record a comment is attached to
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Target {
    pub collection: String,
    pub id: String,
}

impl Target {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Target {
        Target {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.collection)?;
        crate::validate_string(&self.id)?;
        if self.collection.is_empty() || self.id.is_empty() {
            return Err(Error::InvalidRequest(String::from(
                "targetCollection and targetId are required",
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentType {
    #[default]
    Comment,
    Changelog,
}

impl CommentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentType::Comment => "comment",
            CommentType::Changelog => "changelog",
        }
    }

    pub fn from_db(s: &str) -> anyhow::Result<CommentType> {
        match s {
            "comment" => Ok(CommentType::Comment),
            "changelog" => Ok(CommentType::Changelog),
            _ => Err(anyhow::anyhow!("unknown comment type {s:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub author_id: Option<UserId>,
    pub target_collection: String,
    pub target_id: String,
    pub content: String,
    pub parent_id: Option<CommentId>,
    #[serde(rename = "type")]
    pub kind: CommentType,
    pub metadata: Option<serde_json::Value>,
    pub is_edited: bool,
    pub edited_at: Option<Time>,
    pub is_deleted: bool,
    pub created_at: Time,
    pub updated_at: Time,

    /// Expanded author, absent for system-authored rows
    pub author: Option<User>,
}

impl Comment {
    pub fn target(&self) -> Target {
        Target::new(self.target_collection.clone(), self.target_id.clone())
    }

    pub fn is_authored_by(&self, user: Option<UserId>) -> bool {
        user.is_some() && self.author_id == user
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewComment {
    pub author_id: Option<UserId>,
    pub target: Target,
    pub content: String,
    pub parent_id: Option<CommentId>,
    pub kind: CommentType,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentFilter {
    pub target_collection: Option<String>,
    pub target_id: Option<String>,
    pub author_id: Option<UserId>,
    pub parent_id: Option<CommentId>,
    pub kind: Option<CommentType>,

    /// Also return rows hidden by the soft-delete fallback
    pub include_deleted: bool,
}

impl CommentFilter {
    pub fn for_target(target: &Target) -> CommentFilter {
        CommentFilter {
            target_collection: Some(target.collection.clone()),
            target_id: Some(target.id.clone()),
            ..CommentFilter::default()
        }
    }

    /// Returns the target only if both of its halves are present and non-empty
    pub fn complete_target(&self) -> Option<Target> {
        match (&self.target_collection, &self.target_id) {
            (Some(c), Some(i)) if !c.is_empty() && !i.is_empty() => {
                Some(Target::new(c.clone(), i.clone()))
            }
            _ => None,
        }
    }

    pub fn matches(&self, c: &Comment) -> bool {
        (self.include_deleted || !c.is_deleted)
            && self
                .target_collection
                .as_ref()
                .map_or(true, |t| *t == c.target_collection)
            && self.target_id.as_ref().map_or(true, |t| *t == c.target_id)
            && self.author_id.map_or(true, |a| Some(a) == c.author_id)
            && self.parent_id.map_or(true, |p| Some(p) == c.parent_id)
            && self.kind.map_or(true, |k| k == c.kind)
    }
}

/// Result of `comments:destroy`
///
/// `success` with `deleted` means the row is verifiably gone. `success` with
/// `fallback_soft_deleted` means the row is still stored but hidden. Anything
/// without `success` is a failure the caller may retry.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_soft_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<Comment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DestroyResult {
    pub fn hard_deleted(deleted_count: u64) -> DestroyResult {
        DestroyResult {
            success: true,
            deleted: Some(true),
            deleted_count: Some(deleted_count),
            ..DestroyResult::default()
        }
    }

    pub fn soft_deleted(updated: Option<Comment>) -> DestroyResult {
        DestroyResult {
            success: true,
            deleted: Some(false),
            fallback_soft_deleted: Some(true),
            updated,
            ..DestroyResult::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> DestroyResult {
        DestroyResult {
            success: false,
            error: Some(error.into()),
            ..DestroyResult::default()
        }
    }

    /// Deletion was attempted but re-reading the row failed
    pub fn unverified(success: bool, deleted_count: u64) -> DestroyResult {
        DestroyResult {
            success,
            deleted_count: Some(deleted_count),
            ..DestroyResult::default()
        }
    }

    pub fn is_soft_delete(&self) -> bool {
        self.fallback_soft_deleted == Some(true)
    }
}
