use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::{
    mention, payload, ActionName, Caller, Comment, CommentFilter, CommentId, CommentType,
    CommentsAction, Db, Decision, DestroyResult, Error, NewChangelog, NewNotification,
    Notification, NotificationAction, NotificationId, NotificationType, PermissionRow,
    ResolverPolicy, Subject, COMMENTS_RESOURCE,
};

/// `{success}` reply of the notification actions
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Success {
    pub success: bool,
}

/// `{ok, count, rows}` reply of the privileged diagnostic actions
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DebugListing<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<T>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> DebugListing<T> {
    pub fn rows(rows: Vec<T>) -> DebugListing<T> {
        DebugListing {
            ok: true,
            count: Some(rows.len()),
            rows: Some(rows),
            error: None,
        }
    }

    pub fn failed(error: String) -> DebugListing<T> {
        DebugListing {
            ok: false,
            count: None,
            rows: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AclReload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn internal(e: anyhow::Error) -> Error {
    tracing::error!(?e, "internal error");
    Error::Unknown(String::from("internal server error"))
}

fn json<T: Serialize>(v: T) -> Result<Value, Error> {
    serde_json::to_value(v).map_err(|e| internal(e.into()))
}

/// Comment and notification operations, independent of the storage backend
#[derive(Clone, Debug, Default)]
pub struct Service {
    pub policy: ResolverPolicy,
}

impl Service {
    pub fn new(policy: ResolverPolicy) -> Service {
        Service { policy }
    }

    pub async fn can_perform<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        action: CommentsAction,
        subject: &Subject,
    ) -> Decision {
        let action = action.full_name();
        let decision = self.policy.resolve(db, caller, &action, subject).await;
        tracing::debug!(
            user = ?caller.user,
            action = %action,
            allowed = decision.allowed,
            trail = ?decision.trail,
            "resolved permission"
        );
        decision
    }

    async fn require<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        action: CommentsAction,
        subject: &Subject,
        denial: &str,
    ) -> Result<(), Error> {
        match self.can_perform(db, caller, action, subject).await.allowed {
            true => Ok(()),
            false => Err(Error::Forbidden(String::from(denial))),
        }
    }

    fn require_privileged(&self, caller: &Caller, action: CommentsAction) -> Result<(), Error> {
        match self.policy.is_privileged(caller) {
            true => Ok(()),
            false => Err(Error::Forbidden(format!(
                "Only root can call {}",
                action.short_name()
            ))),
        }
    }

    /// Fetches a live comment, soft-deleted ones counting as missing
    async fn live_comment<D: Db>(&self, db: &mut D, id: CommentId) -> Result<Comment, Error> {
        db.get_comment(id)
            .await
            .map_err(internal)?
            .filter(|c| !c.is_deleted)
            .ok_or_else(|| Error::not_found(COMMENTS_RESOURCE, id.0))
    }

    pub async fn list<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        mut filter: CommentFilter,
    ) -> Result<Vec<Comment>, Error> {
        filter.include_deleted = false;
        let target = filter.complete_target();
        if target.is_none() && !self.policy.is_privileged(caller) {
            return Ok(Vec::new());
        }
        let subject = Subject {
            user_id: caller.user,
            target,
            comment_id: None,
        };
        self.require(
            db,
            caller,
            CommentsAction::List,
            &subject,
            "No permission to view comments",
        )
        .await?;
        db.list_comments(&filter).await.map_err(internal)
    }

    pub async fn create<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        values: payload::CommentValues,
    ) -> Result<Comment, Error> {
        let author = caller.require_user()?;
        let new = values.into_new_comment(Some(author))?;
        let subject = Subject {
            user_id: Some(author),
            target: Some(new.target.clone()),
            comment_id: None,
        };
        self.require(
            db,
            caller,
            CommentsAction::Create,
            &subject,
            "No permission to create comments",
        )
        .await?;

        let parent = match new.parent_id {
            None => None,
            Some(p) => {
                let parent = self.live_comment(db, p).await?;
                if parent.target() != new.target {
                    return Err(Error::InvalidRequest(format!(
                        "parent comment {p} belongs to another record"
                    )));
                }
                Some(parent)
            }
        };

        let created = db
            .insert_comment(&new, Utc::now())
            .await
            .map_err(internal)?;
        tracing::info!(id = %created.id, author = author.0, "created comment");
        self.fan_out(db, &created, parent.as_ref()).await;
        Ok(created)
    }

    /// Creates the mention and reply notifications for a fresh comment
    ///
    /// Failures are logged and otherwise ignored.
    async fn fan_out<D: Db>(&self, db: &mut D, comment: &Comment, parent: Option<&Comment>) {
        let now = Utc::now();
        let mut notify = Vec::new();

        let mentions = mention::extract_mentions(&comment.content);
        if !mentions.is_empty() {
            match db.users_by_username(&mentions).await {
                Ok(users) => notify.extend(
                    users
                        .into_iter()
                        .filter(|u| Some(u.id) != comment.author_id)
                        .map(|u| (u.id, NotificationType::Mention)),
                ),
                Err(e) => tracing::error!(?e, comment = %comment.id, "failed resolving mentions"),
            }
        }
        if let Some(parent_author) = parent.and_then(|p| p.author_id) {
            if Some(parent_author) != comment.author_id {
                notify.push((parent_author, NotificationType::Reply));
            }
        }

        for (user_id, kind) in notify {
            let n = NewNotification {
                user_id,
                comment_id: comment.id,
                kind,
            };
            if let Err(e) = db.insert_notification(&n, now).await {
                tracing::error!(?e, ?n, "failed creating notification");
            }
        }
    }

    pub async fn update<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        id: CommentId,
        values: payload::UpdateValues,
    ) -> Result<Comment, Error> {
        let comment = self.live_comment(db, id).await?;
        if comment.kind == CommentType::Changelog {
            return Err(Error::ReadOnlyComment(id.0));
        }
        let content = values.into_content()?;
        if !comment.is_authored_by(caller.user) {
            let subject = Subject {
                user_id: caller.user,
                target: Some(comment.target()),
                comment_id: Some(id),
            };
            self.require(
                db,
                caller,
                CommentsAction::Update,
                &subject,
                "No permission to update this comment",
            )
            .await?;
        }
        db.edit_comment(id, &content, Utc::now())
            .await
            .map_err(internal)?
            .ok_or_else(|| Error::not_found(COMMENTS_RESOURCE, id.0))
    }

    /// Hard-deletes a comment, soft-deleting it if the row survived
    pub async fn destroy<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        id: CommentId,
    ) -> Result<DestroyResult, Error> {
        let comment = self.live_comment(db, id).await?;
        if !comment.is_authored_by(caller.user) {
            let subject = Subject {
                user_id: caller.user,
                target: Some(comment.target()),
                comment_id: Some(id),
            };
            self.require(
                db,
                caller,
                CommentsAction::Destroy,
                &subject,
                "No permission to delete this comment",
            )
            .await?;
        }

        let deleted_count = match db.delete_comment(id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(?e, %id, "hard delete failed");
                0
            }
        };
        match db.get_comment(id).await {
            Ok(None) => {
                tracing::info!(%id, "deleted comment");
                Ok(DestroyResult::hard_deleted(deleted_count))
            }
            Ok(Some(_)) => {
                tracing::warn!(%id, "comment survived hard delete, soft-deleting it");
                match db.soft_delete_comment(id, Utc::now()).await {
                    Ok(updated) => Ok(DestroyResult::soft_deleted(updated)),
                    Err(e) => {
                        tracing::error!(?e, %id, "soft delete fallback failed");
                        Ok(DestroyResult::failed(
                            "Failed to permanently delete or soft-delete the comment",
                        ))
                    }
                }
            }
            Err(e) => {
                tracing::error!(?e, %id, "could not verify deletion");
                Ok(DestroyResult::unverified(deleted_count > 0, deleted_count))
            }
        }
    }

    pub async fn create_changelog<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        changelog: NewChangelog,
    ) -> Result<Comment, Error> {
        let new = changelog.into_new_comment(caller.user)?;
        db.insert_comment(&new, Utc::now()).await.map_err(internal)
    }

    /// Every row for the optional target, soft-deleted ones included
    pub async fn raw_list<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        filter: CommentFilter,
    ) -> Result<DebugListing<Comment>, Error> {
        self.require_privileged(caller, CommentsAction::RawList)?;
        let filter = CommentFilter {
            target_collection: filter.target_collection,
            target_id: filter.target_id,
            include_deleted: true,
            ..CommentFilter::default()
        };
        Ok(match db.list_comments(&filter).await {
            Ok(rows) => DebugListing::rows(rows),
            Err(e) => {
                tracing::error!(?e, "raw listing failed");
                DebugListing::failed(format!("{e:#}"))
            }
        })
    }

    pub async fn debug_permissions<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
    ) -> Result<DebugListing<PermissionRow>, Error> {
        self.require_privileged(caller, CommentsAction::DebugPermissions)?;
        Ok(match db.permission_rows(COMMENTS_RESOURCE, &[]).await {
            Ok(rows) => DebugListing::rows(rows),
            Err(e) => {
                tracing::error!(?e, "listing permissions failed");
                DebugListing::failed(format!("{e:#}"))
            }
        })
    }

    pub async fn reload_acl<D: Db>(&self, db: &mut D, caller: &Caller) -> Result<AclReload, Error> {
        self.require_privileged(caller, CommentsAction::ReloadAcl)?;
        Ok(match db.reload_acl().await {
            Ok(grants) => {
                tracing::info!(grants, user = ?caller.user, "reloaded access control");
                AclReload {
                    ok: true,
                    message: Some(format!("reloaded {grants} grants")),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(?e, "reloading access control failed");
                AclReload {
                    ok: false,
                    message: None,
                    error: Some(format!("{e:#}")),
                }
            }
        })
    }

    pub async fn list_notifications<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
    ) -> Result<Vec<Notification>, Error> {
        let user = caller.require_user()?;
        db.list_notifications_for(user).await.map_err(internal)
    }

    pub async fn mark_read<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        id: NotificationId,
    ) -> Result<Success, Error> {
        let user = caller.require_user()?;
        db.mark_notifications_read(user, Some(id), Utc::now())
            .await
            .map_err(internal)?;
        Ok(Success { success: true })
    }

    pub async fn mark_all_read<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
    ) -> Result<Success, Error> {
        let user = caller.require_user()?;
        let n = db
            .mark_notifications_read(user, None, Utc::now())
            .await
            .map_err(internal)?;
        tracing::debug!(user = user.0, n, "marked all notifications read");
        Ok(Success { success: true })
    }

    /// Runs a resource action on an untyped request, as received over HTTP
    pub async fn dispatch<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        action: ActionName,
        query: &payload::ActionQuery,
        body: &Value,
    ) -> Result<Value, Error> {
        let tk = || payload::filter_by_tk(query.filter_by_tk.as_deref(), body);
        match action {
            ActionName::Comments(a) => match a {
                CommentsAction::List => {
                    let filter = payload::comment_filter(body, query.filter.as_deref())?;
                    json(self.list(db, caller, filter).await?)
                }
                CommentsAction::Create => {
                    json(self.create(db, caller, payload::extract(body)?).await?)
                }
                CommentsAction::Update => {
                    let id = CommentId(tk()?);
                    json(self.update(db, caller, id, payload::extract(body)?).await?)
                }
                CommentsAction::Destroy => {
                    let id = CommentId(tk()?);
                    json(self.destroy(db, caller, id).await?)
                }
                CommentsAction::CreateChangelog => {
                    let values = payload::values_of(body).ok_or_else(|| {
                        Error::InvalidRequest(String::from("changelog values are required"))
                    })?;
                    let changelog: NewChangelog =
                        serde_json::from_value(Value::Object(values.clone())).map_err(|e| {
                            Error::InvalidRequest(format!("malformed changelog values: {e}"))
                        })?;
                    json(self.create_changelog(db, caller, changelog).await?)
                }
                CommentsAction::RawList => {
                    let filter = payload::comment_filter(body, query.filter.as_deref())?;
                    json(self.raw_list(db, caller, filter).await?)
                }
                CommentsAction::DebugPermissions => json(self.debug_permissions(db, caller).await?),
                CommentsAction::ReloadAcl => json(self.reload_acl(db, caller).await?),
            },
            ActionName::Notifications(a) => match a {
                NotificationAction::List => json(self.list_notifications(db, caller).await?),
                NotificationAction::MarkRead => {
                    let id = NotificationId(tk()?);
                    json(self.mark_read(db, caller, id).await?)
                }
                NotificationAction::MarkAllRead => json(self.mark_all_read(db, caller).await?),
            },
        }
    }
}
