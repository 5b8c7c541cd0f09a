use anyhow::{anyhow, Context};
use serde_json::json;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: i64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Comment {0} is read-only")]
    ReadOnlyComment(i64),

    #[error("Unknown action {0:?}")]
    UnknownAction(String),

    #[error("Name already used {0}")]
    NameAlreadyUsed(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid character in name {0:?}")]
    InvalidName(String),
}

impl Error {
    pub fn not_found(resource: &str, id: i64) -> Error {
        Error::NotFound {
            resource: String::from(resource),
            id,
        }
    }

    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::ReadOnlyComment(_) => StatusCode::CONFLICT,
            Error::UnknownAction(_) => StatusCode::NOT_FOUND,
            Error::NameAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::InvalidName(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::Unauthenticated => json!({
                "message": "authentication required",
                "type": "unauthenticated",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::Forbidden(msg) => json!({
                "message": msg,
                "type": "forbidden",
            }),
            Error::NotFound { resource, id } => json!({
                "message": format!("{resource} not found"),
                "type": "not-found",
                "resource": resource,
                "id": id,
            }),
            Error::InvalidRequest(msg) => json!({
                "message": msg,
                "type": "invalid-request",
            }),
            Error::ReadOnlyComment(id) => json!({
                "message": "changelog comments cannot be edited",
                "type": "read-only-comment",
                "id": id,
            }),
            Error::UnknownAction(a) => json!({
                "message": "no such action",
                "type": "unknown-action",
                "action": a,
            }),
            Error::NameAlreadyUsed(n) => json!({
                "message": "name already used",
                "type": "conflict-name",
                "name": n,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidName(n) => json!({
                "message": "there was an invalid character in a user name",
                "type": "invalid-name",
                "name": n,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let message = || {
            String::from(
                data.get("message")
                    .and_then(|msg| msg.as_str())
                    .unwrap_or(""),
            )
        };
        let field = |name: &str| {
            data.get(name)
                .and_then(|s| s.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error contents has no string field {name:?}"))
        };
        let id = || {
            data.get("id")
                .and_then(|id| id.as_i64())
                .ok_or_else(|| anyhow!("error contents has no integer id"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(message()),
                "unauthenticated" => Error::Unauthenticated,
                "permission-denied" => Error::PermissionDenied,
                "forbidden" => Error::Forbidden(message()),
                "not-found" => Error::NotFound {
                    resource: field("resource")?,
                    id: id()?,
                },
                "invalid-request" => Error::InvalidRequest(message()),
                "read-only-comment" => Error::ReadOnlyComment(id()?),
                "unknown-action" => Error::UnknownAction(field("action")?),
                "conflict-name" => Error::NameAlreadyUsed(field("name")?),
                "null-byte" => Error::NullByteInString(field("string")?),
                "invalid-name" => Error::InvalidName(field("name")?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}
