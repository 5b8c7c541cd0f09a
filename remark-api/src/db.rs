use async_trait::async_trait;

use crate::{
    Caller, Comment, CommentFilter, CommentId, NewComment, NewNotification, Notification,
    NotificationId, PermissionRow, Time, User, UserId,
};

/// Storage seam shared by the postgres server and the in-memory mock
///
/// Comments are always returned with their author expanded.
#[async_trait]
pub trait Db: Send {
    async fn users_by_username(&mut self, names: &[String]) -> anyhow::Result<Vec<User>>;

    /// Comments matching `filter`, by creation time then id
    async fn list_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<Vec<Comment>>;

    /// Fetches a comment even if it is soft-deleted
    async fn get_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>>;
    async fn insert_comment(&mut self, c: &NewComment, now: Time) -> anyhow::Result<Comment>;
    async fn edit_comment(
        &mut self,
        id: CommentId,
        content: &str,
        now: Time,
    ) -> anyhow::Result<Option<Comment>>;

    /// Removes the row, returning the number of rows deleted
    async fn delete_comment(&mut self, id: CommentId) -> anyhow::Result<u64>;
    async fn soft_delete_comment(
        &mut self,
        id: CommentId,
        now: Time,
    ) -> anyhow::Result<Option<Comment>>;

    async fn insert_notification(&mut self, n: &NewNotification, now: Time) -> anyhow::Result<()>;

    /// Notifications of `user`, newest first, with their comment expanded
    async fn list_notifications_for(&mut self, user: UserId) -> anyhow::Result<Vec<Notification>>;

    /// Marks one (if `id` is set) or all of `user`'s notifications as read
    async fn mark_notifications_read(
        &mut self,
        user: UserId,
        id: Option<NotificationId>,
        now: Time,
    ) -> anyhow::Result<u64>;

    /// Asks the access control engine, which may be stale
    async fn acl_can(&mut self, caller: &Caller, action: &str) -> anyhow::Result<bool>;

    /// Permission rows for `resource` whose action is one of `actions`, or all of them if empty
    async fn permission_rows(
        &mut self,
        resource: &str,
        actions: &[String],
    ) -> anyhow::Result<Vec<PermissionRow>>;

    /// Rebuilds the access control engine from the permission table, returning the grant count
    async fn reload_acl(&mut self) -> anyhow::Result<usize>;
}
