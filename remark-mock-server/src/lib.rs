use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use async_trait::async_trait;
use remark_api::{
    payload::ActionQuery, AclSnapshot, ActionName, AuthToken, Caller, Comment, CommentFilter,
    CommentId, Db, Error, NewComment, NewNotification, NewPermission, NewSession, NewUser,
    Notification, NotificationId, PermissionId, PermissionRow, ResolverPolicy, Service, Time,
    User, UserId, Uuid,
};
use serde_json::Value;

/// In-memory equivalent of the postgres server, endpoint for endpoint
pub struct MockServer {
    db: MemDb,
    sessions: HashMap<AuthToken, Session>,
    service: Service,
}

#[derive(Debug)]
struct Session {
    user: UserId,
    #[allow(dead_code)]
    device: String,
}

#[derive(Debug)]
struct MockUser {
    user: User,
    pass: String,
    roles: Vec<String>,
}

/// Failures the in-memory store can be told to simulate
#[derive(Clone, Copy, Debug, Default)]
pub struct Faults {
    pub fail_user_lookups: bool,
    pub fail_notification_inserts: bool,
    pub fail_acl_engine: bool,
    pub fail_permission_rows: bool,

    /// `delete_comment` errors out
    pub fail_hard_delete: bool,

    /// `delete_comment` reports success but leaves the row in place
    pub ineffective_hard_delete: bool,

    pub fail_soft_delete: bool,
}

/// Per-table id sequences, numbered like postgres' BIGSERIAL
#[derive(Debug, Default)]
struct Counters {
    users: i64,
    comments: i64,
    notifications: i64,
    permissions: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Default)]
pub struct MemDb {
    users: BTreeMap<UserId, MockUser>,
    comments: BTreeMap<CommentId, Comment>,
    notifications: BTreeMap<NotificationId, Notification>,
    permissions: BTreeMap<PermissionId, PermissionRow>,
    acl: Option<AclSnapshot>,
    root_role: String,
    counters: Counters,
    pub faults: Faults,
}

impl MemDb {
    fn new(root_role: &str) -> MemDb {
        let mut db = MemDb {
            root_role: String::from(root_role),
            ..MemDb::default()
        };
        db.compile_acl();
        db
    }

    fn compile_acl(&mut self) -> usize {
        let rows = self.permissions.values().cloned().collect::<Vec<_>>();
        let snapshot = AclSnapshot::compile(&rows, &self.root_role);
        let grants = snapshot.len();
        self.acl = Some(snapshot);
        grants
    }

    fn expand(&self, c: &Comment) -> Comment {
        Comment {
            author: c
                .author_id
                .and_then(|a| self.users.get(&a))
                .map(|u| u.user.clone()),
            ..c.clone()
        }
    }

    fn expanded(&self, id: CommentId) -> Option<Comment> {
        self.comments.get(&id).map(|c| self.expand(c))
    }
}

#[async_trait]
impl Db for MemDb {
    async fn users_by_username(&mut self, names: &[String]) -> anyhow::Result<Vec<User>> {
        if self.faults.fail_user_lookups {
            return Err(anyhow!("simulated user lookup failure"));
        }
        Ok(self
            .users
            .values()
            .filter(|u| names.contains(&u.user.username))
            .map(|u| u.user.clone())
            .collect())
    }

    async fn list_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<Vec<Comment>> {
        let mut res = self
            .comments
            .values()
            .filter(|c| filter.matches(c))
            .map(|c| self.expand(c))
            .collect::<Vec<_>>();
        res.sort_by_key(|c| (c.created_at, c.id));
        Ok(res)
    }

    async fn get_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        Ok(self.expanded(id))
    }

    async fn insert_comment(&mut self, c: &NewComment, now: Time) -> anyhow::Result<Comment> {
        let id = CommentId(next(&mut self.counters.comments));
        self.comments.insert(
            id,
            Comment {
                id,
                author_id: c.author_id,
                target_collection: c.target.collection.clone(),
                target_id: c.target.id.clone(),
                content: c.content.clone(),
                parent_id: c.parent_id,
                kind: c.kind,
                metadata: c.metadata.clone(),
                is_edited: false,
                edited_at: None,
                is_deleted: false,
                created_at: now,
                updated_at: now,
                author: None,
            },
        );
        self.expanded(id)
            .ok_or_else(|| anyhow!("comment {id} vanished after insertion"))
    }

    async fn edit_comment(
        &mut self,
        id: CommentId,
        content: &str,
        now: Time,
    ) -> anyhow::Result<Option<Comment>> {
        let Some(c) = self.comments.get_mut(&id) else {
            return Ok(None);
        };
        c.content = String::from(content);
        c.is_edited = true;
        c.edited_at = Some(now);
        c.updated_at = now;
        Ok(self.expanded(id))
    }

    async fn delete_comment(&mut self, id: CommentId) -> anyhow::Result<u64> {
        if self.faults.fail_hard_delete {
            return Err(anyhow!("simulated hard delete failure"));
        }
        if self.faults.ineffective_hard_delete {
            return Ok(0);
        }
        if self.comments.remove(&id).is_none() {
            return Ok(0);
        }
        for c in self.comments.values_mut() {
            if c.parent_id == Some(id) {
                c.parent_id = None;
            }
        }
        for n in self.notifications.values_mut() {
            if n.comment_id == Some(id) {
                n.comment_id = None;
            }
        }
        Ok(1)
    }

    async fn soft_delete_comment(
        &mut self,
        id: CommentId,
        now: Time,
    ) -> anyhow::Result<Option<Comment>> {
        if self.faults.fail_soft_delete {
            return Err(anyhow!("simulated soft delete failure"));
        }
        let Some(c) = self.comments.get_mut(&id) else {
            return Ok(None);
        };
        c.is_deleted = true;
        c.updated_at = now;
        Ok(self.expanded(id))
    }

    async fn insert_notification(&mut self, n: &NewNotification, now: Time) -> anyhow::Result<()> {
        if self.faults.fail_notification_inserts {
            return Err(anyhow!("simulated notification insert failure"));
        }
        let id = NotificationId(next(&mut self.counters.notifications));
        self.notifications.insert(
            id,
            Notification {
                id,
                user_id: n.user_id,
                comment_id: Some(n.comment_id),
                kind: n.kind,
                is_read: false,
                read_at: None,
                created_at: now,
                comment: None,
            },
        );
        Ok(())
    }

    async fn list_notifications_for(&mut self, user: UserId) -> anyhow::Result<Vec<Notification>> {
        let mut res = self
            .notifications
            .values()
            .filter(|n| n.user_id == user)
            .map(|n| Notification {
                comment: n
                    .comment_id
                    .and_then(|c| self.expanded(c))
                    .filter(|c| !c.is_deleted),
                ..n.clone()
            })
            .collect::<Vec<_>>();
        res.sort_by_key(|n| std::cmp::Reverse((n.created_at, n.id)));
        Ok(res)
    }

    async fn mark_notifications_read(
        &mut self,
        user: UserId,
        id: Option<NotificationId>,
        now: Time,
    ) -> anyhow::Result<u64> {
        let mut marked = 0;
        for n in self.notifications.values_mut() {
            let selected = match id {
                Some(id) => id == n.id,
                None => !n.is_read,
            };
            if n.user_id == user && selected {
                n.is_read = true;
                n.read_at = Some(now);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn acl_can(&mut self, caller: &Caller, action: &str) -> anyhow::Result<bool> {
        if self.faults.fail_acl_engine {
            return Err(anyhow!("simulated access control engine failure"));
        }
        let acl = self
            .acl
            .as_ref()
            .ok_or_else(|| anyhow!("access control engine not loaded"))?;
        Ok(acl.can(caller, remark_api::COMMENTS_RESOURCE, action))
    }

    async fn permission_rows(
        &mut self,
        resource: &str,
        actions: &[String],
    ) -> anyhow::Result<Vec<PermissionRow>> {
        if self.faults.fail_permission_rows {
            return Err(anyhow!("simulated permission table failure"));
        }
        Ok(self
            .permissions
            .values()
            .filter(|p| p.resource == resource && (actions.is_empty() || actions.contains(&p.action)))
            .cloned()
            .collect())
    }

    async fn reload_acl(&mut self) -> anyhow::Result<usize> {
        Ok(self.compile_acl())
    }
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new(ResolverPolicy::default())
    }
}

impl MockServer {
    pub fn new(policy: ResolverPolicy) -> MockServer {
        MockServer {
            db: MemDb::new(&policy.root_role),
            sessions: HashMap::new(),
            service: Service::new(policy),
        }
    }

    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.db.faults
    }

    pub fn db_mut(&mut self) -> &mut MemDb {
        &mut self.db
    }

    /// Return name & pass for user number `id`
    pub fn test_get_user_info(&self, id: usize) -> (&str, &str) {
        let u = self
            .db
            .users
            .values()
            .nth(id)
            .unwrap_or_else(|| panic!("getting user {id} among {}", self.db.users.len()));
        (&u.user.username, &u.pass)
    }

    /// Return the current number of users
    pub fn test_num_users(&self) -> usize {
        self.db.users.len()
    }

    /// Stores a permission row without refreshing the access control snapshot
    pub fn test_insert_stale_permission(&mut self, p: NewPermission) -> PermissionId {
        let id = PermissionId(next(&mut self.db.counters.permissions));
        self.db.permissions.insert(
            id,
            PermissionRow {
                id,
                resource: p.resource,
                action: p.action,
                role_name: p.role_name,
                user_id: p.user_id,
                allow: p.allow,
            },
        );
        id
    }

    /// `password` is the plain text behind `u.initial_password_hash`
    pub fn admin_create_user(&mut self, u: NewUser, password: String) -> Result<UserId, Error> {
        u.validate()?;
        if self.db.users.values().any(|m| m.user.username == u.username) {
            return Err(Error::NameAlreadyUsed(u.username));
        }
        let id = UserId(next(&mut self.db.counters.users));
        self.db.users.insert(
            id,
            MockUser {
                user: User {
                    id,
                    username: u.username,
                    nickname: u.nickname,
                },
                pass: password,
                roles: u.roles,
            },
        );
        Ok(id)
    }

    pub fn admin_grant_permission(&mut self, p: NewPermission) -> Result<PermissionId, Error> {
        p.validate()?;
        if let Some(u) = p.user_id {
            if !self.db.users.contains_key(&u) {
                return Err(Error::not_found("users", u.0));
            }
        }
        let id = self.test_insert_stale_permission(p);
        self.db.compile_acl();
        Ok(id)
    }

    pub fn auth(&mut self, s: NewSession) -> Result<AuthToken, Error> {
        s.validate()?;
        let user = self
            .db
            .users
            .values()
            .find(|u| u.user.username == s.user)
            .ok_or(Error::PermissionDenied)?;
        // tests (of which mock-server is a part of) don't actually use bcrypt
        if s.password != user.pass {
            return Err(Error::PermissionDenied);
        }
        let tok = AuthToken(Uuid::new_v4());
        self.sessions.insert(
            tok,
            Session {
                user: user.user.id,
                device: s.device,
            },
        );
        Ok(tok)
    }

    pub fn unauth(&mut self, tok: AuthToken) -> Result<(), Error> {
        self.sessions
            .remove(&tok)
            .map(|_| ())
            .ok_or(Error::PermissionDenied)
    }

    pub fn whoami(&self, tok: AuthToken) -> Result<UserId, Error> {
        self.sessions
            .get(&tok)
            .map(|s| s.user)
            .ok_or(Error::PermissionDenied)
    }

    pub fn caller(&self, tok: Option<AuthToken>, role_claim: Option<String>) -> Result<Caller, Error> {
        let caller = match tok {
            None => Caller::anonymous(),
            Some(tok) => {
                let user = self.whoami(tok)?;
                let roles = self
                    .db
                    .users
                    .get(&user)
                    .map(|u| u.roles.clone())
                    .unwrap_or_default();
                Caller::user(user, roles)
            }
        };
        Ok(caller.with_role_claim(role_claim))
    }

    /// Equivalent of `POST /api/{action}`
    pub async fn run_action(
        &mut self,
        tok: Option<AuthToken>,
        role_claim: Option<String>,
        action: &str,
        query: &ActionQuery,
        body: &Value,
    ) -> Result<Value, Error> {
        let caller = self.caller(tok, role_claim)?;
        let action: ActionName = action.parse()?;
        self.service
            .dispatch(&mut self.db, &caller, action, query, body)
            .await
    }
}
