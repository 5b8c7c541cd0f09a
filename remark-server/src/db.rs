use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use remark_api::{
    AuthToken, Caller, Comment, CommentFilter, CommentId, CommentType, Db, NewComment,
    NewNotification, NewPermission, NewSession, NewUser, Notification, NotificationId,
    NotificationType, PermissionId, PermissionRow, Time, User, UserId, Uuid,
};
use sqlx::{postgres::PgRow, Row};

use crate::{acl::AclCache, query, Error};

fn get<'r, T>(r: &'r PgRow, column: &str) -> anyhow::Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    r.try_get(column)
        .with_context(|| format!("retrieving the {column} field"))
}

pub async fn create_user(conn: &mut sqlx::PgConnection, u: NewUser) -> Result<UserId, Error> {
    let taken = sqlx::query("SELECT id FROM users WHERE username = $1")
        .bind(&u.username)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("checking whether username {:?} is taken", u.username))?;
    if taken.is_some() {
        return Err(Error::name_already_used(u.username));
    }

    let mut tx = sqlx::Connection::begin(&mut *conn)
        .await
        .context("starting user creation transaction")?;
    let id: i64 = sqlx::query(
        "INSERT INTO users (username, nickname, password) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(&u.username)
    .bind(&u.nickname)
    .bind(&u.initial_password_hash)
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("inserting user {:?}", u.username))?
    .try_get("id")
    .context("retrieving the id field")?;
    for role in &u.roles {
        sqlx::query(
            "INSERT INTO users_roles (user_id, role_name) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(role)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("giving role {role:?} to user {id}"))?;
    }
    tx.commit()
        .await
        .context("committing user creation transaction")?;
    Ok(UserId(id))
}

pub async fn user_exists(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<bool> {
    Ok(sqlx::query("SELECT id FROM users WHERE id = $1")
        .bind(user.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("looking up user {user:?}"))?
        .is_some())
}

pub async fn fetch_roles(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<Vec<String>> {
    sqlx::query("SELECT role_name FROM users_roles WHERE user_id = $1 ORDER BY role_name")
        .bind(user.0)
        .fetch_all(conn)
        .await
        .with_context(|| format!("fetching roles of user {user:?}"))?
        .iter()
        .map(|r| get(r, "role_name"))
        .collect()
}

pub async fn login_user(
    conn: &mut sqlx::PgConnection,
    s: &NewSession,
) -> anyhow::Result<Option<AuthToken>> {
    let Some(user) = sqlx::query("SELECT id, password FROM users WHERE username = $1")
        .bind(&s.user)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("fetching password of user {:?}", s.user))?
    else {
        return Ok(None);
    };
    let id: i64 = get(&user, "id")?;
    let hash: String = get(&user, "password")?;

    // tests store plain text passwords, like the mock server does
    #[cfg(test)]
    let matches = s.password == hash;
    #[cfg(not(test))]
    let matches = bcrypt::verify(&s.password, &hash)
        .with_context(|| format!("verifying password of user {:?}", s.user))?;
    if !matches {
        return Ok(None);
    }

    let token = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sessions (id, user_id, name, login_time, last_active) VALUES ($1, $2, $3, $4, $4)",
    )
    .bind(token)
    .bind(id)
    .bind(&s.device)
    .bind(now)
    .execute(conn)
    .await
    .with_context(|| format!("creating session for user {id}"))?;
    Ok(Some(AuthToken(token)))
}

/// Returns `false` if the session did not exist
pub async fn logout_user(conn: &mut sqlx::PgConnection, token: &AuthToken) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(token.0)
        .execute(conn)
        .await
        .context("deleting session")?;
    Ok(res.rows_affected() == 1)
}

pub async fn recover_session(conn: &mut sqlx::PgConnection, token: AuthToken) -> Result<UserId, Error> {
    let row = sqlx::query(
        "UPDATE sessions SET last_active = $2 WHERE id = $1 RETURNING user_id",
    )
    .bind(token.0)
    .bind(Utc::now())
    .fetch_optional(conn)
    .await
    .context("recovering session")?
    .ok_or_else(Error::permission_denied)?;
    Ok(UserId(get(&row, "user_id")?))
}

pub async fn grant_permission(
    conn: &mut sqlx::PgConnection,
    p: &NewPermission,
) -> anyhow::Result<PermissionId> {
    let row = sqlx::query(
        "
            INSERT INTO permissions (resource, action, role_name, user_id, allow)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
        ",
    )
    .bind(&p.resource)
    .bind(&p.action)
    .bind(&p.role_name)
    .bind(p.user_id.map(|u| u.0))
    .bind(p.allow)
    .fetch_one(conn)
    .await
    .with_context(|| format!("inserting permission {p:?}"))?;
    Ok(PermissionId(get(&row, "id")?))
}

/// Permission rows by id, optionally restricted to a resource and a set of actions
pub async fn fetch_permissions(
    conn: &mut sqlx::PgConnection,
    resource: Option<&str>,
    actions: &[String],
) -> anyhow::Result<Vec<PermissionRow>> {
    let mut rows = sqlx::query(
        "
            SELECT id, resource, action, role_name, user_id, allow
                FROM permissions
            WHERE ($1::VARCHAR IS NULL OR resource = $1)
                AND (cardinality($2::VARCHAR[]) = 0 OR action = ANY($2))
            ORDER BY id
        ",
    )
    .bind(resource)
    .bind(actions)
    .fetch(conn);
    let mut res = Vec::new();
    while let Some(r) = rows.try_next().await.context("querying permissions table")? {
        res.push(PermissionRow {
            id: PermissionId(get(&r, "id")?),
            resource: get(&r, "resource")?,
            action: get(&r, "action")?,
            role_name: get(&r, "role_name")?,
            user_id: get::<Option<i64>>(&r, "user_id")?.map(UserId),
            allow: get(&r, "allow")?,
        });
    }
    Ok(res)
}

/// Assumes tables c (comments) and u (users, joined on the author) are available
const COMMENT_COLUMNS: &str = "
    c.id, c.author_id, c.target_collection, c.target_id, c.content, c.parent_id, c.type,
    c.metadata, c.is_edited, c.edited_at, c.is_deleted, c.created_at, c.updated_at,
    u.username AS author_username, u.nickname AS author_nickname
";

fn comment_from_row(r: &PgRow) -> anyhow::Result<Comment> {
    let author_id = get::<Option<i64>>(r, "author_id")?.map(UserId);
    let author = match (author_id, get::<Option<String>>(r, "author_username")?) {
        (Some(id), Some(username)) => Some(User {
            id,
            username,
            nickname: get(r, "author_nickname")?,
        }),
        _ => None,
    };
    Ok(Comment {
        id: CommentId(get(r, "id")?),
        author_id,
        target_collection: get(r, "target_collection")?,
        target_id: get(r, "target_id")?,
        content: get(r, "content")?,
        parent_id: get::<Option<i64>>(r, "parent_id")?.map(CommentId),
        kind: CommentType::from_db(&get::<String>(r, "type")?)?,
        metadata: get(r, "metadata")?,
        is_edited: get(r, "is_edited")?,
        edited_at: get(r, "edited_at")?,
        is_deleted: get(r, "is_deleted")?,
        created_at: get(r, "created_at")?,
        updated_at: get(r, "updated_at")?,
        author,
    })
}

pub struct PostgresDb<'a> {
    pub conn: &'a mut sqlx::PgConnection,
    pub acl: &'a AclCache,
}

#[async_trait]
impl<'a> Db for PostgresDb<'a> {
    async fn users_by_username(&mut self, names: &[String]) -> anyhow::Result<Vec<User>> {
        sqlx::query("SELECT id, username, nickname FROM users WHERE username = ANY($1) ORDER BY id")
            .bind(names)
            .fetch_all(&mut *self.conn)
            .await
            .with_context(|| format!("fetching users named {names:?}"))?
            .iter()
            .map(|r| -> anyhow::Result<User> {
                Ok(User {
                    id: UserId(get(r, "id")?),
                    username: get(r, "username")?,
                    nickname: get(r, "nickname")?,
                })
            })
            .collect()
    }

    async fn list_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<Vec<Comment>> {
        let sql = query::to_postgres(filter, 1);
        let q = format!(
            "
                SELECT {COMMENT_COLUMNS}
                    FROM comments c
                LEFT JOIN users u
                    ON u.id = c.author_id
                WHERE {}
                ORDER BY c.created_at, c.id
            ",
            sql.where_clause
        );
        sql.bind_to(sqlx::query(&q))
            .fetch_all(&mut *self.conn)
            .await
            .with_context(|| format!("listing comments matching {filter:?}"))?
            .iter()
            .map(comment_from_row)
            .collect()
    }

    async fn get_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        let q = format!(
            "
                SELECT {COMMENT_COLUMNS}
                    FROM comments c
                LEFT JOIN users u
                    ON u.id = c.author_id
                WHERE c.id = $1
            "
        );
        sqlx::query(&q)
            .bind(id.0)
            .fetch_optional(&mut *self.conn)
            .await
            .with_context(|| format!("fetching comment {id}"))?
            .map(|r| comment_from_row(&r))
            .transpose()
    }

    async fn insert_comment(&mut self, c: &NewComment, now: Time) -> anyhow::Result<Comment> {
        let row = sqlx::query(
            "
                INSERT INTO comments
                    (author_id, target_collection, target_id, content, parent_id, type, metadata,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                RETURNING id
            ",
        )
        .bind(c.author_id.map(|a| a.0))
        .bind(&c.target.collection)
        .bind(&c.target.id)
        .bind(&c.content)
        .bind(c.parent_id.map(|p| p.0))
        .bind(c.kind.as_str())
        .bind(&c.metadata)
        .bind(now)
        .fetch_one(&mut *self.conn)
        .await
        .with_context(|| format!("inserting comment on {:?}", c.target))?;
        let id = CommentId(get(&row, "id")?);
        self.get_comment(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("comment {id} vanished after insertion"))
    }

    async fn edit_comment(
        &mut self,
        id: CommentId,
        content: &str,
        now: Time,
    ) -> anyhow::Result<Option<Comment>> {
        let res = sqlx::query(
            "UPDATE comments SET content = $2, is_edited = true, edited_at = $3, updated_at = $3 WHERE id = $1",
        )
        .bind(id.0)
        .bind(content)
        .bind(now)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("editing comment {id}"))?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_comment(id).await
    }

    async fn delete_comment(&mut self, id: CommentId) -> anyhow::Result<u64> {
        Ok(sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("deleting comment {id}"))?
            .rows_affected())
    }

    async fn soft_delete_comment(
        &mut self,
        id: CommentId,
        now: Time,
    ) -> anyhow::Result<Option<Comment>> {
        let res = sqlx::query("UPDATE comments SET is_deleted = true, updated_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(now)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("soft-deleting comment {id}"))?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_comment(id).await
    }

    async fn insert_notification(&mut self, n: &NewNotification, now: Time) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO comment_notifications (user_id, comment_id, type, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(n.user_id.0)
        .bind(n.comment_id.0)
        .bind(n.kind.as_str())
        .bind(now)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("inserting notification {n:?}"))?;
        Ok(())
    }

    async fn list_notifications_for(&mut self, user: UserId) -> anyhow::Result<Vec<Notification>> {
        let q = format!(
            "
                SELECT
                    n.id AS notification_id,
                    n.comment_id AS notification_comment_id,
                    n.type AS notification_type,
                    n.is_read,
                    n.read_at,
                    n.created_at AS notification_created_at,
                    {COMMENT_COLUMNS}
                FROM comment_notifications n
                LEFT JOIN comments c
                    ON c.id = n.comment_id AND c.is_deleted = false
                LEFT JOIN users u
                    ON u.id = c.author_id
                WHERE n.user_id = $1
                ORDER BY n.created_at DESC, n.id DESC
            "
        );
        let mut rows = sqlx::query(&q).bind(user.0).fetch(&mut *self.conn);
        let mut res = Vec::new();
        while let Some(r) = rows
            .try_next()
            .await
            .context("querying comment_notifications table")?
        {
            let comment_id = get::<Option<i64>>(&r, "notification_comment_id")?.map(CommentId);
            res.push(Notification {
                id: NotificationId(get(&r, "notification_id")?),
                user_id: user,
                comment_id,
                kind: NotificationType::from_db(&get::<String>(&r, "notification_type")?)?,
                is_read: get(&r, "is_read")?,
                read_at: get(&r, "read_at")?,
                created_at: get(&r, "notification_created_at")?,
                comment: match get::<Option<i64>>(&r, "id")? {
                    Some(_) => Some(comment_from_row(&r)?),
                    None => None,
                },
            });
        }
        Ok(res)
    }

    async fn mark_notifications_read(
        &mut self,
        user: UserId,
        id: Option<NotificationId>,
        now: Time,
    ) -> anyhow::Result<u64> {
        Ok(sqlx::query(
            "
                UPDATE comment_notifications
                    SET is_read = true, read_at = $3
                WHERE user_id = $1
                    AND ($2::BIGINT IS NULL OR id = $2)
                    AND ($2::BIGINT IS NOT NULL OR is_read = false)
            ",
        )
        .bind(user.0)
        .bind(id.map(|n| n.0))
        .bind(now)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("marking notifications of {user:?} as read"))?
        .rows_affected())
    }

    async fn acl_can(&mut self, caller: &Caller, action: &str) -> anyhow::Result<bool> {
        self.acl.can(&mut *self.conn, caller, action).await
    }

    async fn permission_rows(
        &mut self,
        resource: &str,
        actions: &[String],
    ) -> anyhow::Result<Vec<PermissionRow>> {
        fetch_permissions(&mut *self.conn, Some(resource), actions).await
    }

    async fn reload_acl(&mut self) -> anyhow::Result<usize> {
        self.acl.reload(&mut *self.conn).await
    }
}
