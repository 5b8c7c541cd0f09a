use std::{fmt, str::FromStr};

use crate::Error;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CommentsAction {
    List,
    Create,
    Update,
    Destroy,
    CreateChangelog,
    RawList,
    DebugPermissions,
    ReloadAcl,
}

impl CommentsAction {
    /// Short action name, as stored in permission rows alongside the full one
    pub fn short_name(&self) -> &'static str {
        match self {
            CommentsAction::List => "list",
            CommentsAction::Create => "create",
            CommentsAction::Update => "update",
            CommentsAction::Destroy => "destroy",
            CommentsAction::CreateChangelog => "createChangelog",
            CommentsAction::RawList => "rawList",
            CommentsAction::DebugPermissions => "debugPermissions",
            CommentsAction::ReloadAcl => "reloadAcl",
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}:{}", crate::COMMENTS_RESOURCE, self.short_name())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NotificationAction {
    List,
    MarkRead,
    MarkAllRead,
}

impl NotificationAction {
    pub fn short_name(&self) -> &'static str {
        match self {
            NotificationAction::List => "list",
            NotificationAction::MarkRead => "markRead",
            NotificationAction::MarkAllRead => "markAllRead",
        }
    }
}

/// A URL-qualified resource action, like `comments:list`
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ActionName {
    Comments(CommentsAction),
    Notifications(NotificationAction),
}

impl FromStr for ActionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<ActionName, Error> {
        let unknown = || Error::UnknownAction(String::from(s));
        let (resource, action) = s.split_once(':').ok_or_else(unknown)?;
        Ok(match resource {
            "comments" => ActionName::Comments(match action {
                "list" => CommentsAction::List,
                "create" => CommentsAction::Create,
                "update" => CommentsAction::Update,
                "destroy" => CommentsAction::Destroy,
                "createChangelog" => CommentsAction::CreateChangelog,
                "rawList" => CommentsAction::RawList,
                "debugPermissions" => CommentsAction::DebugPermissions,
                "reloadAcl" => CommentsAction::ReloadAcl,
                _ => return Err(unknown()),
            }),
            "comment_notifications" => ActionName::Notifications(match action {
                "list" => NotificationAction::List,
                "markRead" => NotificationAction::MarkRead,
                "markAllRead" => NotificationAction::MarkAllRead,
                _ => return Err(unknown()),
            }),
            _ => return Err(unknown()),
        })
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionName::Comments(a) => write!(f, "comments:{}", a.short_name()),
            ActionName::Notifications(a) => write!(f, "comment_notifications:{}", a.short_name()),
        }
    }
}
