use crate::{Comment, CommentId, Time, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct NotificationId(pub i64);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Mention,
    Reply,
    NewComment,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Mention => "mention",
            NotificationType::Reply => "reply",
            NotificationType::NewComment => "new_comment",
        }
    }

    pub fn from_db(s: &str) -> anyhow::Result<NotificationType> {
        match s {
            "mention" => Ok(NotificationType::Mention),
            "reply" => Ok(NotificationType::Reply),
            "new_comment" => Ok(NotificationType::NewComment),
            _ => Err(anyhow::anyhow!("unknown notification type {s:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub comment_id: Option<CommentId>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub is_read: bool,
    pub read_at: Option<Time>,
    pub created_at: Time,

    /// Expanded comment (with its author), absent once the comment got removed
    pub comment: Option<Comment>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NewNotification {
    pub user_id: UserId,
    pub comment_id: CommentId,
    pub kind: NotificationType,
}
