use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use remark_client::{
    api::{
        payload::ActionQuery, ActionName, AuthToken, CommentId, CommentsAction, NewPermission,
        NewSession, NewUser, Target,
    },
    Backend, Client, CommentThread, NotificationInbox, RowState, SyncError,
};
use remark_mock_server::MockServer;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

struct MockBackend {
    server: Arc<Mutex<MockServer>>,
    token: AuthToken,
    offline: AtomicBool,
    failing_list: AtomicBool,

    /// Destroy of this comment waits for the notification, then fails
    held_destroy: Mutex<Option<(CommentId, Arc<Notify>)>>,
}

impl MockBackend {
    async fn hold_destroy(&self, id: CommentId) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.held_destroy.lock().await = Some((id, release.clone()));
        release
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn call(
        &self,
        action: ActionName,
        query: &ActionQuery,
        body: Value,
    ) -> Result<Value, SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(anyhow::anyhow!("connection refused")));
        }
        if action == ActionName::Comments(CommentsAction::List)
            && self.failing_list.load(Ordering::SeqCst)
        {
            return Err(SyncError::Transport(anyhow::anyhow!("connection reset")));
        }
        if action == ActionName::Comments(CommentsAction::Destroy) {
            let held = {
                let mut held = self.held_destroy.lock().await;
                let key = held.as_ref().map(|(id, _)| id.0.to_string());
                match key {
                    Some(k) if query.filter_by_tk.as_deref() == Some(k.as_str()) => held.take(),
                    _ => None,
                }
            };
            if let Some((_, release)) = held {
                release.notified().await;
                return Err(SyncError::Transport(anyhow::anyhow!("connection reset")));
            }
        }
        Ok(self
            .server
            .lock()
            .await
            .run_action(Some(self.token), None, &action.to_string(), query, &body)
            .await?)
    }
}

fn login(server: &mut MockServer, name: &str) -> AuthToken {
    server
        .admin_create_user(
            NewUser {
                username: String::from(name),
                nickname: None,
                initial_password_hash: String::new(),
                roles: vec![String::from("member")],
            },
            String::from("pass"),
        )
        .unwrap();
    server
        .auth(NewSession {
            user: String::from(name),
            password: String::from("pass"),
            device: String::from("test"),
        })
        .unwrap()
}

fn setup() -> (Arc<Mutex<MockServer>>, Arc<MockBackend>, Arc<MockBackend>) {
    let mut server = MockServer::default();
    login(&mut server, "root");
    let alice = login(&mut server, "alice");
    let bob = login(&mut server, "bob");
    for action in ["list", "create"] {
        server
            .admin_grant_permission(NewPermission {
                resource: String::from("comments"),
                action: String::from(action),
                role_name: Some(String::from("member")),
                user_id: None,
                allow: true,
            })
            .unwrap();
    }
    let server = Arc::new(Mutex::new(server));
    let backend = |token| {
        Arc::new(MockBackend {
            server: server.clone(),
            token,
            offline: AtomicBool::new(false),
            failing_list: AtomicBool::new(false),
            held_destroy: Mutex::new(None),
        })
    };
    let (alice, bob) = (backend(alice), backend(bob));
    (server, alice, bob)
}

fn target() -> Target {
    Target::new("orders", "1")
}

#[tokio::test]
async fn replies_are_nested_after_refresh() {
    let (_, alice, bob) = setup();
    let a = CommentThread::new(Client::new(alice), target());
    let b = CommentThread::new(Client::new(bob), target());

    let top = a.post("first").await.unwrap();
    b.refresh().await.unwrap();
    let reply = b.reply(top.id, "second").await.unwrap();
    let nested = b.reply(reply.id, "third").await.unwrap();
    a.refresh().await.unwrap();

    let tree = a.tree().await;
    let shape = tree
        .walk()
        .into_iter()
        .map(|(depth, c)| (depth, c.id))
        .collect::<Vec<_>>();
    assert_eq!(shape, vec![(0, top.id), (1, reply.id), (2, nested.id)]);
    assert_eq!(a.state(top.id).await, RowState::Synced);
}

#[tokio::test]
async fn edits_apply_after_confirmation() {
    let (_, alice, _) = setup();
    let thread = CommentThread::new(Client::new(alice.clone()), target());
    let c = thread.post("draft").await.unwrap();

    alice.offline.store(true, Ordering::SeqCst);
    assert!(matches!(
        thread.edit(c.id, "final").await,
        Err(SyncError::Transport(_))
    ));
    assert_eq!(thread.state(c.id).await, RowState::Synced);
    let tree = thread.tree().await;
    assert_eq!(
        tree.find(c.id).map(|n| n.comment.content.as_str()),
        Some("draft")
    );

    alice.offline.store(false, Ordering::SeqCst);
    thread.edit(c.id, "final").await.unwrap();
    let tree = thread.tree().await;
    let node = tree.find(c.id).unwrap();
    assert_eq!(node.comment.content, "final");
    assert!(node.comment.is_edited);
}

#[tokio::test]
async fn delete_is_applied_then_confirmed() {
    let (_, alice, _) = setup();
    let thread = CommentThread::new(Client::new(alice), target());
    let top = thread.post("top").await.unwrap();
    thread.reply(top.id, "reply").await.unwrap();

    let res = thread.delete(top.id).await.unwrap();
    assert!(res.success);
    let tree = thread.tree().await;
    assert!(tree.find(top.id).is_none());
    // the reply got orphaned server-side and is back as a top-level comment
    assert_eq!(tree.walk().len(), 1);
    assert_eq!(tree.walk()[0].0, 0);
}

#[tokio::test]
async fn delete_rolls_back_on_transport_error() {
    let (_, alice, _) = setup();
    let thread = CommentThread::new(Client::new(alice.clone()), target());
    let c = thread.post("keep me").await.unwrap();
    let before = thread.tree().await;

    alice.offline.store(true, Ordering::SeqCst);
    assert!(matches!(
        thread.delete(c.id).await,
        Err(SyncError::Transport(_))
    ));
    assert_eq!(thread.tree().await, before);
    assert_eq!(thread.state(c.id).await, RowState::Synced);
}

#[tokio::test]
async fn delete_rolls_back_on_failed_outcome() {
    let (server, alice, _) = setup();
    let thread = CommentThread::new(Client::new(alice), target());
    let c = thread.post("stuck").await.unwrap();
    {
        let mut server = server.lock().await;
        server.faults_mut().fail_hard_delete = true;
        server.faults_mut().fail_soft_delete = true;
    }
    assert!(matches!(
        thread.delete(c.id).await,
        Err(SyncError::DeleteFailed { .. })
    ));
    assert!(thread.tree().await.find(c.id).is_some());
}

#[tokio::test]
async fn forbidden_delete_rolls_back() {
    let (_, alice, bob) = setup();
    let a = CommentThread::new(Client::new(alice), target());
    let b = CommentThread::new(Client::new(bob), target());
    let c = a.post("alice's").await.unwrap();
    b.refresh().await.unwrap();
    assert!(matches!(
        b.delete(c.id).await,
        Err(SyncError::Api(remark_client::api::Error::Forbidden(_)))
    ));
    assert!(b.tree().await.find(c.id).is_some());
    assert!(matches!(
        b.delete(CommentId(c.id.0 + 1000)).await,
        Err(SyncError::NotLoaded(_))
    ));
}

#[tokio::test]
async fn inbox_tracks_unread_notifications() {
    let (_, alice, bob) = setup();
    let a = CommentThread::new(Client::new(alice.clone()), target());
    let inbox = NotificationInbox::new(Client::new(bob));
    a.post("@bob one").await.unwrap();
    a.post("@bob two").await.unwrap();

    inbox.refresh().await.unwrap();
    assert_eq!(inbox.unread_count().await, 2);
    let newest = inbox.items().await[0].clone();
    assert_eq!(
        newest.comment.as_ref().map(|c| c.content.as_str()),
        Some("@bob two")
    );

    inbox.mark_read(newest.id).await.unwrap();
    assert_eq!(inbox.unread_count().await, 1);
    inbox.mark_all_read().await.unwrap();
    assert_eq!(inbox.unread_count().await, 0);
}

#[tokio::test]
async fn failed_delete_keeps_concurrent_deletes() {
    let (_, alice, _) = setup();
    let thread = Arc::new(CommentThread::new(Client::new(alice.clone()), target()));
    let a = thread.post("a").await.unwrap();
    let b = thread.post("b").await.unwrap();

    let release = alice.hold_destroy(a.id).await;
    let pending = tokio::spawn({
        let thread = thread.clone();
        async move { thread.delete(a.id).await }
    });
    while thread.state(a.id).await != RowState::PendingDelete {
        tokio::task::yield_now().await;
    }

    assert!(thread.delete(b.id).await.unwrap().success);
    release.notify_one();
    assert!(matches!(
        pending.await.unwrap(),
        Err(SyncError::Transport(_))
    ));

    let tree = thread.tree().await;
    assert!(tree.find(a.id).is_some());
    assert!(tree.find(b.id).is_none());
    assert_eq!(thread.state(a.id).await, RowState::Synced);
}

#[tokio::test]
async fn confirmed_mutations_survive_failed_refresh() {
    let (_, alice, _) = setup();
    let thread = CommentThread::new(Client::new(alice.clone()), target());
    let top = thread.post("top").await.unwrap();
    let other = thread.post("other").await.unwrap();

    alice.failing_list.store(true, Ordering::SeqCst);
    let edited = thread.edit(top.id, "edited").await.unwrap();
    assert_eq!(edited.content, "edited");
    let reply = thread.reply(top.id, "reply").await.unwrap();
    assert_eq!(reply.parent_id, Some(top.id));
    assert!(thread.delete(other.id).await.unwrap().success);
    assert!(thread.tree().await.find(other.id).is_none());

    alice.failing_list.store(false, Ordering::SeqCst);
    thread.refresh().await.unwrap();
    let tree = thread.tree().await;
    assert_eq!(
        tree.find(top.id).map(|n| n.comment.content.as_str()),
        Some("edited")
    );
    assert!(tree.find(reply.id).is_some());
}

#[tokio::test]
async fn root_sees_raw_listing_and_permissions() {
    let (server, alice, _) = setup();
    let thread = CommentThread::new(Client::new(alice), target());
    let kept = thread.post("kept").await.unwrap();
    let gone = thread.post("gone").await.unwrap();
    thread.delete(gone.id).await.unwrap();

    let root = {
        let mut server = server.lock().await;
        server
            .auth(NewSession {
                user: String::from("root"),
                password: String::from("pass"),
                device: String::from("test"),
            })
            .unwrap()
    };
    let root = Client::new(Arc::new(MockBackend {
        server: server.clone(),
        token: root,
        offline: AtomicBool::new(false),
        failing_list: AtomicBool::new(false),
        held_destroy: Mutex::new(None),
    }));

    let listing = root.raw_list(Some(&target())).await.unwrap();
    assert!(listing.ok);
    assert_eq!(listing.count, Some(1));
    let rows = listing.rows.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, kept.id);
    assert!(listing.error.is_none());

    let perms = root.debug_permissions().await.unwrap();
    assert!(perms.ok);
    assert_eq!(perms.count, Some(2));
}
