use chrono::Utc;

pub use uuid::Uuid;

mod action;
pub use action::{ActionName, CommentsAction, NotificationAction};

mod auth;
pub use auth::{AuthToken, NewSession};

mod changelog;
pub use changelog::{ChangelogAction, NewChangelog};

mod comment;
pub use comment::{
    Comment, CommentFilter, CommentId, CommentType, DestroyResult, NewComment, Target,
};

mod db;
pub use db::Db;

mod error;
pub use error::Error;

pub mod mention;

mod notification;
pub use notification::{NewNotification, Notification, NotificationId, NotificationType};

pub mod payload;

mod permission;
pub use permission::{
    AclSnapshot, Decision, NewPermission, PermissionId, PermissionRow, ResolverPolicy, RowRule,
    RuleCheck, Subject,
};

mod service;
pub use service::{AclReload, DebugListing, Service, Success};

mod user;
pub use user::{Caller, NewUser, User, UserId};

pub type Time = chrono::DateTime<Utc>;

/// Resource name of comments, as used by permission rows
pub const COMMENTS_RESOURCE: &str = "comments";

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        Err(Error::NullByteInString(String::from(s)))
    } else {
        Ok(())
    }
}

/// Rejects json documents holding null bytes in any key or string, as postgres' JSONB does
pub fn validate_json(v: &serde_json::Value) -> Result<(), Error> {
    let mut stack = vec![v];
    while let Some(v) = stack.pop() {
        match v {
            serde_json::Value::String(s) => validate_string(s)?,
            serde_json::Value::Array(a) => stack.extend(a),
            serde_json::Value::Object(o) => {
                for (k, v) in o {
                    validate_string(k)?;
                    stack.push(v);
                }
            }
            _ => (),
        }
    }
    Ok(())
}

pub fn validate_name(s: &str) -> Result<(), Error> {
    validate_string(s)?;
    if s.is_empty() || !s.chars().all(|c| c.is_alphanumeric() || c == '_') {
        Err(Error::InvalidName(String::from(s)))
    } else {
        Ok(())
    }
}
