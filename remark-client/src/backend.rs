use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::api::{
    payload::ActionQuery, AclReload, ActionName, Comment, CommentId, CommentsAction, DebugListing,
    DestroyResult, Error, NewChangelog, Notification, NotificationAction, NotificationId,
    PermissionRow, Success, Target,
};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] Error),

    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),

    #[error("malformed server response")]
    Decode(#[from] serde_json::Error),

    #[error("deleting comment {id} failed: {reason}")]
    DeleteFailed { id: CommentId, reason: String },

    #[error("comment {0} is not loaded")]
    NotLoaded(CommentId),

    #[error("comment {0} already has an operation in flight")]
    Busy(CommentId),
}

/// Transport able to run a resource action, like `POST /api/comments:list`
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(
        &self,
        action: ActionName,
        query: &ActionQuery,
        body: Value,
    ) -> Result<Value, SyncError>;
}

/// Typed wrapper around a [`Backend`]
pub struct Client<B> {
    backend: Arc<B>,
}

impl<B> Clone for Client<B> {
    fn clone(&self) -> Client<B> {
        Client {
            backend: self.backend.clone(),
        }
    }
}

fn by_key(id: i64) -> ActionQuery {
    ActionQuery {
        filter_by_tk: Some(id.to_string()),
        filter: None,
    }
}

impl<B: Backend> Client<B> {
    pub fn new(backend: Arc<B>) -> Client<B> {
        Client { backend }
    }

    async fn comments<T: DeserializeOwned>(
        &self,
        action: CommentsAction,
        query: ActionQuery,
        body: Value,
    ) -> Result<T, SyncError> {
        let res = self
            .backend
            .call(ActionName::Comments(action), &query, body)
            .await?;
        Ok(serde_json::from_value(res)?)
    }

    async fn notifications<T: DeserializeOwned>(
        &self,
        action: NotificationAction,
        query: ActionQuery,
    ) -> Result<T, SyncError> {
        let res = self
            .backend
            .call(ActionName::Notifications(action), &query, Value::Null)
            .await?;
        Ok(serde_json::from_value(res)?)
    }

    pub async fn list(&self, target: &Target) -> Result<Vec<Comment>, SyncError> {
        let body = json!({"values": {
            "targetCollection": target.collection,
            "targetId": target.id,
        }});
        self.comments(CommentsAction::List, ActionQuery::default(), body)
            .await
    }

    pub async fn create(
        &self,
        target: &Target,
        content: &str,
        parent: Option<CommentId>,
    ) -> Result<Comment, SyncError> {
        let body = json!({"values": {
            "targetCollection": target.collection,
            "targetId": target.id,
            "content": content,
            "parentId": parent,
        }});
        self.comments(CommentsAction::Create, ActionQuery::default(), body)
            .await
    }

    pub async fn update(&self, id: CommentId, content: &str) -> Result<Comment, SyncError> {
        let body = json!({"values": {"content": content}});
        self.comments(CommentsAction::Update, by_key(id.0), body)
            .await
    }

    pub async fn destroy(&self, id: CommentId) -> Result<DestroyResult, SyncError> {
        self.comments(CommentsAction::Destroy, by_key(id.0), Value::Null)
            .await
    }

    pub async fn create_changelog(&self, changelog: &NewChangelog) -> Result<Comment, SyncError> {
        let body = json!({ "values": changelog });
        self.comments(CommentsAction::CreateChangelog, ActionQuery::default(), body)
            .await
    }

    pub async fn raw_list(
        &self,
        target: Option<&Target>,
    ) -> Result<DebugListing<Comment>, SyncError> {
        let body = match target {
            None => Value::Null,
            Some(t) => json!({"targetCollection": t.collection, "targetId": t.id}),
        };
        self.comments(CommentsAction::RawList, ActionQuery::default(), body)
            .await
    }

    pub async fn debug_permissions(&self) -> Result<DebugListing<PermissionRow>, SyncError> {
        self.comments(
            CommentsAction::DebugPermissions,
            ActionQuery::default(),
            Value::Null,
        )
        .await
    }

    pub async fn reload_acl(&self) -> Result<AclReload, SyncError> {
        self.comments(CommentsAction::ReloadAcl, ActionQuery::default(), Value::Null)
            .await
    }

    pub async fn list_notifications(&self) -> Result<Vec<Notification>, SyncError> {
        self.notifications(NotificationAction::List, ActionQuery::default())
            .await
    }

    pub async fn mark_read(&self, id: NotificationId) -> Result<Success, SyncError> {
        self.notifications(NotificationAction::MarkRead, by_key(id.0))
            .await
    }

    pub async fn mark_all_read(&self) -> Result<Success, SyncError> {
        self.notifications(NotificationAction::MarkAllRead, ActionQuery::default())
            .await
    }
}
