use remark_api::{
    payload::ActionQuery, AuthToken, Comment, CommentsAction, DestroyResult, Error, NewPermission,
    NewSession, NewUser, Notification, NotificationType, ResolverPolicy, RowRule, RuleCheck,
    Service, Subject, UserId,
};
use remark_mock_server::MockServer;
use serde_json::{json, Value};

struct Env {
    m: MockServer,
    root: AuthToken,
    alice: (UserId, AuthToken),
    bob: (UserId, AuthToken),
}

fn add_user(m: &mut MockServer, name: &str, roles: &[&str]) -> (UserId, AuthToken) {
    let id = m
        .admin_create_user(
            NewUser {
                username: String::from(name),
                nickname: None,
                initial_password_hash: String::from("not-a-hash"),
                roles: roles.iter().map(|r| String::from(*r)).collect(),
            },
            format!("{name}-pass"),
        )
        .unwrap();
    let tok = m
        .auth(NewSession {
            user: String::from(name),
            password: format!("{name}-pass"),
            device: String::from("test"),
        })
        .unwrap();
    (id, tok)
}

fn grant(m: &mut MockServer, action: &str, role: &str) {
    m.admin_grant_permission(NewPermission {
        resource: String::from("comments"),
        action: String::from(action),
        role_name: Some(String::from(role)),
        user_id: None,
        allow: true,
    })
    .unwrap();
}

fn env() -> Env {
    let mut m = MockServer::default();
    let (_, root) = add_user(&mut m, "root", &["root"]);
    let alice = add_user(&mut m, "alice", &["member"]);
    let bob = add_user(&mut m, "bob", &["member"]);
    grant(&mut m, "list", "member");
    grant(&mut m, "comments:create", "member");
    Env { m, root, alice, bob }
}

async fn call(m: &mut MockServer, tok: AuthToken, action: &str, body: Value) -> Result<Value, Error> {
    m.run_action(Some(tok), None, action, &ActionQuery::default(), &body)
        .await
}

async fn create(
    m: &mut MockServer,
    tok: AuthToken,
    content: &str,
    parent: Option<i64>,
) -> Result<Comment, Error> {
    let v = call(
        m,
        tok,
        "comments:create",
        json!({"values": {
            "targetCollection": "orders",
            "targetId": 1,
            "content": content,
            "parentId": parent,
        }}),
    )
    .await?;
    Ok(serde_json::from_value(v).unwrap())
}

async fn list(m: &mut MockServer, tok: AuthToken) -> Result<Vec<Comment>, Error> {
    let v = call(
        m,
        tok,
        "comments:list",
        json!({"filter": {"targetCollection": "orders", "targetId": "1"}}),
    )
    .await?;
    Ok(serde_json::from_value(v).unwrap())
}

async fn notifications(m: &mut MockServer, tok: AuthToken) -> Vec<Notification> {
    let v = call(m, tok, "comment_notifications:list", Value::Null)
        .await
        .unwrap();
    serde_json::from_value(v).unwrap()
}

#[tokio::test]
async fn repeated_mention_notifies_once() {
    let Env {
        mut m, alice, bob, ..
    } = env();
    let c = create(&mut m, bob.1, "@alice look @alice, cc @bob @nobody", None)
        .await
        .unwrap();
    assert_eq!(c.author.as_ref().map(|u| u.username.as_str()), Some("bob"));

    let n = notifications(&mut m, alice.1).await;
    assert_eq!(n.len(), 1);
    assert_eq!(n[0].kind, NotificationType::Mention);
    assert_eq!(n[0].comment.as_ref().map(|c| c.id), Some(c.id));
    assert!(notifications(&mut m, bob.1).await.is_empty());
}

#[tokio::test]
async fn replies_notify_other_authors_only() {
    let Env {
        mut m, alice, bob, ..
    } = env();
    let top = create(&mut m, alice.1, "top", None).await.unwrap();
    create(&mut m, alice.1, "own reply", Some(top.id.0))
        .await
        .unwrap();
    assert!(notifications(&mut m, alice.1).await.is_empty());

    let reply = create(&mut m, bob.1, "reply", Some(top.id.0)).await.unwrap();
    assert_eq!(reply.parent_id, Some(top.id));
    let n = notifications(&mut m, alice.1).await;
    assert_eq!(n.len(), 1);
    assert_eq!(n[0].kind, NotificationType::Reply);
    assert_eq!(n[0].user_id, alice.0);
}

#[tokio::test]
async fn parent_must_exist_on_the_same_target() {
    let Env { mut m, alice, .. } = env();
    assert!(matches!(
        create(&mut m, alice.1, "orphan", Some(4242)).await,
        Err(Error::NotFound { .. })
    ));
    let elsewhere = call(
        &mut m,
        alice.1,
        "comments:create",
        json!({"targetCollection": "invoices", "targetId": "9", "content": "x"}),
    )
    .await
    .unwrap();
    assert!(matches!(
        create(&mut m, alice.1, "cross", elsewhere["id"].as_i64()).await,
        Err(Error::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn fan_out_failures_do_not_fail_creation() {
    let Env {
        mut m, alice, bob, ..
    } = env();
    m.faults_mut().fail_user_lookups = true;
    create(&mut m, bob.1, "hey @alice", None).await.unwrap();
    m.faults_mut().fail_user_lookups = false;
    m.faults_mut().fail_notification_inserts = true;
    let top = create(&mut m, alice.1, "hey @bob", None).await.unwrap();
    create(&mut m, bob.1, "reply", Some(top.id.0)).await.unwrap();
    m.faults_mut().fail_notification_inserts = false;

    assert_eq!(list(&mut m, alice.1).await.unwrap().len(), 3);
    assert!(notifications(&mut m, alice.1).await.is_empty());
    assert!(notifications(&mut m, bob.1).await.is_empty());
}

#[tokio::test]
async fn anonymous_callers_cannot_create() {
    let Env { mut m, .. } = env();
    let res = m
        .run_action(
            None,
            None,
            "comments:create",
            &ActionQuery::default(),
            &json!({"targetCollection": "orders", "targetId": 1, "content": "x"}),
        )
        .await;
    assert_eq!(res, Err(Error::Unauthenticated));
}

#[tokio::test]
async fn listing_is_scoped_and_authorized() {
    let Env {
        mut m, root, alice, ..
    } = env();
    create(&mut m, alice.1, "one", None).await.unwrap();
    let other = add_user(&mut m, "carol", &["guest"]);
    assert!(matches!(list(&mut m, other.1).await, Err(Error::Forbidden(_))));

    let untargeted = call(&mut m, alice.1, "comments:list", json!({})).await.unwrap();
    assert_eq!(untargeted, json!([]));
    let everything = call(&mut m, root, "comments:list", json!({})).await.unwrap();
    assert_eq!(everything.as_array().map(|a| a.len()), Some(1));

    let by_query = m
        .run_action(
            Some(alice.1),
            None,
            "comments:list",
            &ActionQuery {
                filter: Some(String::from(r#"{"targetCollection":"orders","targetId":1}"#)),
                ..ActionQuery::default()
            },
            &Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(by_query.as_array().map(|a| a.len()), Some(1));
}

#[tokio::test]
async fn edits_mark_the_comment() {
    let Env { mut m, alice, .. } = env();
    let c = create(&mut m, alice.1, "first", None).await.unwrap();
    let v = m
        .run_action(
            Some(alice.1),
            None,
            "comments:update",
            &ActionQuery {
                filter_by_tk: Some(c.id.to_string()),
                ..ActionQuery::default()
            },
            &json!({"values": {"content": "second"}}),
        )
        .await
        .unwrap();
    assert_eq!(v["isEdited"], true);

    let fetched = list(&mut m, alice.1).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].content, "second");
    assert!(fetched[0].is_edited);
    assert!(fetched[0].edited_at.is_some());
}

#[tokio::test]
async fn moderation_requires_ownership_or_permission() {
    let Env {
        mut m, alice, bob, ..
    } = env();
    let c = create(&mut m, alice.1, "mine", None).await.unwrap();

    let res = call(
        &mut m,
        bob.1,
        "comments:update",
        json!({"filterByTk": c.id.0, "content": "hijacked"}),
    )
    .await;
    assert!(matches!(res, Err(Error::Forbidden(_))));
    let res = call(&mut m, bob.1, "comments:destroy", json!({"filterByTk": c.id.0})).await;
    assert!(matches!(res, Err(Error::Forbidden(_))));

    grant(&mut m, "update", "member");
    call(
        &mut m,
        bob.1,
        "comments:update",
        json!({"filterByTk": c.id.0, "content": "moderated"}),
    )
    .await
    .unwrap();

    let res = call(&mut m, alice.1, "comments:destroy", json!({"filterByTk": c.id.0}))
        .await
        .unwrap();
    assert_eq!(
        serde_json::from_value::<DestroyResult>(res).unwrap(),
        DestroyResult::hard_deleted(1)
    );
    assert!(list(&mut m, alice.1).await.unwrap().is_empty());
}

#[tokio::test]
async fn changelogs_are_read_only() {
    let Env { mut m, alice, .. } = env();
    let v = call(
        &mut m,
        alice.1,
        "comments:createChangelog",
        json!({"values": {
            "targetCollection": "orders",
            "targetId": 1,
            "action": "status_changed",
            "oldValue": "open",
            "newValue": "closed",
        }}),
    )
    .await
    .unwrap();
    assert_eq!(v["type"], "changelog");
    assert_eq!(v["content"], "changed status from **open** to **closed**");
    assert_eq!(v["authorId"], alice.0 .0);

    let res = call(
        &mut m,
        alice.1,
        "comments:update",
        json!({"filterByTk": v["id"], "content": "rewrite history"}),
    )
    .await;
    assert_eq!(res, Err(Error::ReadOnlyComment(v["id"].as_i64().unwrap())));
}

#[tokio::test]
async fn destroy_falls_back_to_soft_delete() {
    let Env {
        mut m, root, alice, ..
    } = env();
    let c = create(&mut m, alice.1, "sticky", None).await.unwrap();
    m.faults_mut().ineffective_hard_delete = true;
    let res = call(&mut m, alice.1, "comments:destroy", json!({"id": c.id.0}))
        .await
        .unwrap();
    assert_eq!(res["success"], true);
    assert_eq!(res["deleted"], false);
    assert_eq!(res["fallbackSoftDeleted"], true);
    assert_eq!(res["updated"]["isDeleted"], true);

    assert!(list(&mut m, alice.1).await.unwrap().is_empty());
    let raw = call(
        &mut m,
        root,
        "comments:rawList",
        json!({"targetCollection": "orders", "targetId": 1}),
    )
    .await
    .unwrap();
    assert_eq!(raw["ok"], true);
    assert_eq!(raw["count"], 1);
    assert_eq!(raw["rows"][0]["isDeleted"], true);

    let again = call(&mut m, alice.1, "comments:destroy", json!({"id": c.id.0})).await;
    assert!(matches!(again, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn destroy_reports_total_failure() {
    let Env { mut m, alice, .. } = env();
    let c = create(&mut m, alice.1, "stuck", None).await.unwrap();
    m.faults_mut().fail_hard_delete = true;
    m.faults_mut().fail_soft_delete = true;
    let res = call(&mut m, alice.1, "comments:destroy", json!({"id": c.id.0}))
        .await
        .unwrap();
    let res: DestroyResult = serde_json::from_value(res).unwrap();
    assert!(!res.success);
    assert!(res.error.is_some());
    assert_eq!(list(&mut m, alice.1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_a_parent_orphans_replies() {
    let Env {
        mut m, alice, bob, ..
    } = env();
    let top = create(&mut m, alice.1, "top", None).await.unwrap();
    let reply = create(&mut m, bob.1, "reply", Some(top.id.0)).await.unwrap();
    call(&mut m, alice.1, "comments:destroy", json!({"id": top.id.0}))
        .await
        .unwrap();
    let rows = list(&mut m, bob.1).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, reply.id);
    assert_eq!(rows[0].parent_id, None);

    let n = notifications(&mut m, alice.1).await;
    assert_eq!(n.len(), 1);
    assert_eq!(n[0].comment_id, Some(reply.id));
}

#[tokio::test]
async fn mark_all_read_is_per_user() {
    let Env {
        mut m,
        root,
        alice,
        bob,
    } = env();
    create(&mut m, root, "@alice @bob", None).await.unwrap();
    create(&mut m, root, "@alice again", None).await.unwrap();

    let v = call(&mut m, alice.1, "comment_notifications:markAllRead", Value::Null)
        .await
        .unwrap();
    assert_eq!(v, json!({"success": true}));
    let a = notifications(&mut m, alice.1).await;
    assert_eq!(a.len(), 2);
    assert!(a.iter().all(|n| n.is_read && n.read_at.is_some()));
    assert!(a[0].created_at >= a[1].created_at);
    let b = notifications(&mut m, bob.1).await;
    assert_eq!(b.len(), 1);
    assert!(!b[0].is_read);

    // marking someone else's notification is a silent no-op
    call(
        &mut m,
        alice.1,
        "comment_notifications:markRead",
        json!({"filterByTk": b[0].id.0}),
    )
    .await
    .unwrap();
    assert!(!notifications(&mut m, bob.1).await[0].is_read);
    call(
        &mut m,
        bob.1,
        "comment_notifications:markRead",
        json!({"filterByTk": b[0].id.0}),
    )
    .await
    .unwrap();
    assert!(notifications(&mut m, bob.1).await[0].is_read);
}

#[tokio::test]
async fn mark_all_read_keeps_earlier_read_times() {
    let Env {
        mut m, root, alice, ..
    } = env();
    create(&mut m, root, "@alice first", None).await.unwrap();
    let first = notifications(&mut m, alice.1).await[0].clone();
    call(
        &mut m,
        alice.1,
        "comment_notifications:markRead",
        json!({"filterByTk": first.id.0}),
    )
    .await
    .unwrap();
    let read_at = notifications(&mut m, alice.1).await[0].read_at;
    assert!(read_at.is_some());

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    create(&mut m, root, "@alice second", None).await.unwrap();
    call(&mut m, alice.1, "comment_notifications:markAllRead", Value::Null)
        .await
        .unwrap();
    let n = notifications(&mut m, alice.1).await;
    assert_eq!(n.len(), 2);
    assert!(n.iter().all(|n| n.is_read));
    let earlier = n.iter().find(|n| n.id == first.id).unwrap();
    assert_eq!(earlier.read_at, read_at);
    let later = n.iter().find(|n| n.id != first.id).unwrap();
    assert!(later.read_at > read_at);
}

#[tokio::test]
async fn soft_deleted_comments_are_not_expanded() {
    let Env {
        mut m, alice, bob, ..
    } = env();
    let c = create(&mut m, alice.1, "@bob secret", None).await.unwrap();
    m.faults_mut().ineffective_hard_delete = true;
    let res = call(&mut m, alice.1, "comments:destroy", json!({"id": c.id.0}))
        .await
        .unwrap();
    assert_eq!(res["fallbackSoftDeleted"], true);

    let n = notifications(&mut m, bob.1).await;
    assert_eq!(n.len(), 1);
    assert_eq!(n[0].comment_id, Some(c.id));
    assert!(n[0].comment.is_none());
}

#[tokio::test]
async fn resolver_trail_records_each_path() {
    let Env { mut m, alice, .. } = env();
    let service = Service::new(ResolverPolicy::default());
    let subject = Subject::default();

    let root = m.caller(None, Some(String::from("ROOT"))).unwrap();
    let d = service
        .can_perform(m.db_mut(), &root, CommentsAction::Destroy, &subject)
        .await;
    assert!(d.allowed);
    assert_eq!(
        d.trail,
        vec![RuleCheck::RoleClaim {
            claim: String::from("ROOT"),
            matched: true
        }]
    );

    let member = m.caller(Some(alice.1), None).unwrap();
    let d = service
        .can_perform(m.db_mut(), &member, CommentsAction::List, &subject)
        .await;
    assert!(d.allowed);
    assert_eq!(d.trail.last(), Some(&RuleCheck::Engine { allowed: true }));

    let d = service
        .can_perform(m.db_mut(), &member, CommentsAction::Destroy, &subject)
        .await;
    assert!(!d.allowed);
    assert_eq!(
        d.trail[d.trail.len() - 2..],
        [RuleCheck::PermissionRows { found: 0 }, RuleCheck::NoMatch]
    );

    // a grant the engine has not picked up yet is still honored
    m.test_insert_stale_permission(NewPermission {
        resource: String::from("comments"),
        action: String::from("comments:destroy"),
        role_name: None,
        user_id: Some(alice.0),
        allow: true,
    });
    let d = service
        .can_perform(m.db_mut(), &member, CommentsAction::Destroy, &subject)
        .await;
    assert!(d.allowed);
    assert!(d.trail.contains(&RuleCheck::Engine { allowed: false }));
    assert!(matches!(
        d.trail.last(),
        Some(RuleCheck::RowMatch {
            rule: RowRule::User { .. },
            ..
        })
    ));

    m.faults_mut().fail_permission_rows = true;
    let d = service
        .can_perform(m.db_mut(), &member, CommentsAction::Destroy, &subject)
        .await;
    assert!(!d.allowed);
    assert!(matches!(d.trail.last(), Some(RuleCheck::FallbackError { .. })));
}

#[tokio::test]
async fn engine_errors_fall_through_and_fallback_can_be_disabled() {
    let Env { mut m, alice, .. } = env();
    let member = m.caller(Some(alice.1), None).unwrap();
    m.faults_mut().fail_acl_engine = true;

    let with_fallback = Service::new(ResolverPolicy::default());
    let d = with_fallback
        .can_perform(m.db_mut(), &member, CommentsAction::List, &Subject::default())
        .await;
    assert!(d.allowed);
    assert!(matches!(d.trail[1], RuleCheck::EngineError { .. }));

    let strict = Service::new(ResolverPolicy {
        fallback: false,
        ..ResolverPolicy::default()
    });
    let d = strict
        .can_perform(m.db_mut(), &member, CommentsAction::List, &Subject::default())
        .await;
    assert!(!d.allowed);
    assert_eq!(d.trail.last(), Some(&RuleCheck::FallbackDisabled));
}

#[tokio::test]
async fn privileged_diagnostics() {
    let Env {
        mut m, root, alice, ..
    } = env();
    for action in [
        "comments:rawList",
        "comments:debugPermissions",
        "comments:reloadAcl",
    ] {
        assert!(matches!(
            call(&mut m, alice.1, action, Value::Null).await,
            Err(Error::Forbidden(_))
        ));
    }

    let perms = call(&mut m, root, "comments:debugPermissions", Value::Null)
        .await
        .unwrap();
    assert_eq!(perms["ok"], true);
    assert_eq!(perms["count"], 2);
    assert_eq!(perms["rows"][0]["roleName"], "member");

    m.test_insert_stale_permission(NewPermission {
        resource: String::from("comments"),
        action: String::from("update"),
        role_name: Some(String::from("member")),
        user_id: None,
        allow: true,
    });
    let reload = call(&mut m, root, "comments:reloadAcl", Value::Null)
        .await
        .unwrap();
    assert_eq!(reload, json!({"ok": true, "message": "reloaded 3 grants"}));

    assert_eq!(
        call(&mut m, alice.1, "comments:frobnicate", Value::Null).await,
        Err(Error::UnknownAction(String::from("comments:frobnicate")))
    );
}
