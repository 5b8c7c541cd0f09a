#![cfg(test)]

use async_recursion::async_recursion;
use bolero::generator::TypeGenerator;
use axum::{
    extract::FromRequestParts,
    http::{self, request},
};
use remark_api::{
    payload::ActionQuery, Error as ApiError, NewPermission, NewSession, NewUser, PermissionId,
    UserId,
};
use remark_mock_server::MockServer;
use serde_json::{json, Value};
use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path};
use tower::{Service, ServiceExt};

use crate::{extractors::*, *};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &Path) -> postgresfixture::cluster::Cluster {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    postgresfixture::cluster::Cluster::new(
        data,
        runtime.expect("postgresql seems to not be installed in path"),
    )
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                tracing_subscriber::fmt::init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let cluster = build_pg_cluster(datadir_path);
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                // create test db
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!("postgresql://?host={}&dbname=test_db", datadir_path)).await.expect("creating sqlx pool");
                    MIGRATOR
                        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                        .await
                        .expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        // run the test
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            // cleanup
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        // resume the panics
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

#[derive(Clone, Copy, Debug, bolero::generator::TypeGenerator)]
enum FuzzRole {
    Root,
    Member,
    Guest,
}

impl FuzzRole {
    fn name(&self) -> String {
        String::from(match self {
            FuzzRole::Root => "root",
            FuzzRole::Member => "member",
            // checks role names are compared case-insensitively
            FuzzRole::Guest => "Guest",
        })
    }
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzName {
    Numbered(u8),
    Raw(#[generator(bolero::generator::gen_with::<String>().len(0..6usize))] String),
}

#[derive(Clone, Copy, Debug, bolero::generator::TypeGenerator)]
enum FuzzAction {
    List,
    Create,
    Update,
    Destroy,
    ListFullName,
    Unknown,
}

impl FuzzAction {
    fn name(&self) -> String {
        String::from(match self {
            FuzzAction::List => "list",
            FuzzAction::Create => "create",
            FuzzAction::Update => "update",
            FuzzAction::Destroy => "destroy",
            FuzzAction::ListFullName => "comments:list",
            FuzzAction::Unknown => "frobnicate",
        })
    }
}

#[derive(Clone, Copy, Debug, bolero::generator::TypeGenerator)]
enum Grantee {
    Role(FuzzRole),
    User(usize),
    Everyone,
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum Fragment {
    Text(#[generator(bolero::generator::gen_with::<String>().len(0..12usize))] String),
    Mention(usize),
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzChangelog {
    Created,
    Updated {
        #[generator(bolero::generator::gen_with::<String>().len(0..8usize))]
        field: String,
        old: Option<i32>,
        new: Option<i32>,
    },
    StatusChanged {
        old: u8,
        new: u8,
    },
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    CreateUser {
        name: FuzzName,
        roles: Vec<FuzzRole>,
    },
    GrantPermission {
        action: FuzzAction,
        grantee: Grantee,
        allow: bool,
    },
    Auth {
        uid: usize,
        #[generator(bolero::generator::gen_with::<String>().len(1..20usize))]
        device: String,
    },
    Unauth {
        sid: usize,
    },
    Whoami {
        sid: usize,
    },
    ListComments {
        sid: Option<usize>,
        role: Option<FuzzRole>,
        target: Option<u8>,
    },
    CreateComment {
        sid: Option<usize>,
        role: Option<FuzzRole>,
        target: u8,
        content: Vec<Fragment>,
        parent: Option<usize>,
    },
    UpdateComment {
        sid: Option<usize>,
        role: Option<FuzzRole>,
        cid: usize,
        content: Vec<Fragment>,
    },
    DestroyComment {
        sid: Option<usize>,
        role: Option<FuzzRole>,
        cid: usize,
    },
    CreateChangelog {
        sid: Option<usize>,
        target: u8,
        change: FuzzChangelog,
    },
    RawList {
        sid: Option<usize>,
        role: Option<FuzzRole>,
    },
    DebugPermissions {
        sid: Option<usize>,
        role: Option<FuzzRole>,
    },
    ReloadAcl {
        sid: Option<usize>,
        role: Option<FuzzRole>,
    },
    ListNotifications {
        sid: Option<usize>,
    },
    MarkRead {
        sid: Option<usize>,
        nid: u8,
    },
    MarkAllRead {
        sid: Option<usize>,
    },
    UnknownAction {
        sid: Option<usize>,
    },
}

async fn call<Req, Resp>(
    app: &mut Router,
    req: request::Request<axum::body::Body>,
    req_body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status == http::StatusCode::OK {
        if std::any::TypeId::of::<Resp>() == std::any::TypeId::of::<()>() {
            // the server returns an empty string in this situation, which does not parse properly with serde_json
            return Ok(serde_json::from_slice(b"null").unwrap());
        } else {
            return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
                panic!(
                    r#"
                        Failed parsing resp body!

                        The error is the following:
                        ---
                        {err}
                        ---

                        Response body is:
                        ---
                        {body:?}
                        ---

                        Request was:
                        ---
                        {req_body:?}
                        ---
                    "#
                )
            }));
        }
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<Uuid>,
    role: Option<&str>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {token}")),
        None => req,
    };
    let req = match role {
        Some(role) => req.header(ROLE_HEADER, role),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    call(app, req, body).await
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

/// Timestamps are set by each side's own clock, so only their presence is compared
fn strip_times(res: Result<Value, ApiError>) -> Result<Value, ApiError> {
    let mut v = res?;
    {
        let mut stack = vec![&mut v];
        while let Some(v) = stack.pop() {
            match v {
                Value::Object(o) => {
                    for (k, v) in o.iter_mut() {
                        if k.ends_with("At") {
                            *v = Value::Bool(!v.is_null());
                        } else {
                            stack.push(v);
                        }
                    }
                }
                Value::Array(a) => stack.extend(a.iter_mut()),
                _ => (),
            }
        }
    }
    Ok(v)
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

fn target(t: u8) -> (String, String) {
    (String::from("orders"), (t % 3).to_string())
}

struct Session {
    app: AuthToken,
    mock: AuthToken,
}

struct ComparativeFuzzer {
    admin_token: Uuid,
    app: Router,
    mock: MockServer,
    sessions: Vec<Session>,
    comments: usize,
}

impl ComparativeFuzzer {
    async fn new(pool: PgPool) -> ComparativeFuzzer {
        let admin_token = Uuid::new_v4();
        let policy = ResolverPolicy::default();
        let app = app(pool, Some(AuthToken(admin_token)), policy.clone()).await;
        let mock = MockServer::new(policy);
        ComparativeFuzzer {
            admin_token,
            app,
            mock,
            sessions: Vec::new(),
            comments: 0,
        }
    }

    fn session(&self, sid: Option<usize>) -> Option<&Session> {
        resize_int(sid?, ..self.sessions.len()).map(|s| &self.sessions[s])
    }

    fn render(&self, content: &[Fragment]) -> String {
        content
            .iter()
            .map(|f| match f {
                Fragment::Text(t) => t.clone(),
                Fragment::Mention(uid) => match resize_int(*uid, ..self.mock.test_num_users()) {
                    Some(uid) => format!("@{}", self.mock.test_get_user_info(uid).0),
                    None => String::from("@nobody"),
                },
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Picks an existing comment id, or 0 that never exists
    fn comment_id(&self, cid: usize) -> usize {
        resize_int(cid, ..self.comments + 1).unwrap_or(0)
    }

    async fn run_action(
        &mut self,
        sid: Option<usize>,
        role: Option<FuzzRole>,
        action: &str,
        query: ActionQuery,
        body: Value,
    ) {
        let (app_tok, mock_tok) = match self.session(sid) {
            Some(s) => (Some(s.app.0), Some(s.mock)),
            None => (None, None),
        };
        let role = role.map(|r| r.name());
        let mut uri = format!("/api/{action}");
        if let Some(tk) = &query.filter_by_tk {
            uri.push_str(&format!("?filterByTk={tk}"));
        }
        let app_res = run_on_app(
            &mut self.app,
            "POST",
            &uri,
            app_tok,
            role.as_deref(),
            &body,
        )
        .await;
        let mock_res = self
            .mock
            .run_action(mock_tok, role, action, &query, &body)
            .await;
        if action == "comments:create" || action == "comments:createChangelog" {
            if let Ok(Value::Object(c)) = &mock_res {
                if let Some(id) = c.get("id").and_then(Value::as_u64) {
                    self.comments = cmp::max(self.comments, id as usize);
                }
            }
        }
        compare(action, strip_times(app_res), strip_times(mock_res));
    }

    #[async_recursion]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::CreateUser { name, roles } => {
                let username = match name {
                    FuzzName::Numbered(n) => format!("user{n}"),
                    FuzzName::Raw(s) => s,
                };
                let new_user = NewUser {
                    // no hashing for tests
                    initial_password_hash: format!("pass-{username}"),
                    username,
                    nickname: None,
                    roles: roles.iter().map(FuzzRole::name).collect(),
                };
                let pass = new_user.initial_password_hash.clone();
                compare(
                    "CreateUser",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        "/api/admin/create-user",
                        Some(self.admin_token),
                        None,
                        &new_user,
                    )
                    .await,
                    self.mock.admin_create_user(new_user, pass),
                )
            }
            FuzzOp::GrantPermission {
                action,
                grantee,
                allow,
            } => {
                let (role_name, user_id) = match grantee {
                    Grantee::Role(r) => (Some(r.name()), None),
                    Grantee::User(uid) => {
                        let uid = resize_int(uid, ..self.mock.test_num_users() + 1).unwrap_or(0);
                        // ids start at 1, so 0 checks grants to unknown users
                        (None, Some(UserId(uid as i64)))
                    }
                    Grantee::Everyone => (None, None),
                };
                let perm = NewPermission {
                    resource: String::from(remark_api::COMMENTS_RESOURCE),
                    action: action.name(),
                    role_name,
                    user_id,
                    allow,
                };
                compare::<PermissionId>(
                    "GrantPermission",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        "/api/admin/grant-permission",
                        Some(self.admin_token),
                        None,
                        &perm,
                    )
                    .await,
                    self.mock.admin_grant_permission(perm),
                )
            }
            FuzzOp::Auth { uid, device } => {
                if let Some(uid) = resize_int(uid, ..self.mock.test_num_users()) {
                    let (user, password) = self.mock.test_get_user_info(uid);
                    let session = NewSession {
                        user: String::from(user),
                        password: String::from(password),
                        device,
                    };
                    let app_tok =
                        run_on_app(&mut self.app, "POST", "/api/auth", None, None, &session).await;
                    let mock_tok = self.mock.auth(session);
                    if let (&Ok(app), &Ok(mock)) = (&app_tok, &mock_tok) {
                        self.sessions.push(Session { app, mock });
                    }
                    compare("Auth", app_tok.map(|_| ()), mock_tok.map(|_| ()));
                } else {
                    self.execute_fuzz_op(FuzzOp::CreateUser {
                        name: FuzzName::Numbered(0),
                        roles: vec![FuzzRole::Member],
                    })
                    .await;
                    self.execute_fuzz_op(FuzzOp::Auth { uid, device }).await;
                }
            }
            FuzzOp::Unauth { sid } => {
                if let Some(sid) = resize_int(sid, ..self.sessions.len()) {
                    let s = self.sessions.remove(sid);
                    compare(
                        "Unauth",
                        run_on_app(&mut self.app, "POST", "/api/unauth", Some(s.app.0), None, &())
                            .await,
                        self.mock.unauth(s.mock),
                    );
                }
            }
            FuzzOp::Whoami { sid } => {
                if let Some(sid) = resize_int(sid, ..self.sessions.len()) {
                    let (app, mock) = (self.sessions[sid].app, self.sessions[sid].mock);
                    compare(
                        "Whoami",
                        run_on_app(&mut self.app, "GET", "/api/whoami", Some(app.0), None, &())
                            .await,
                        self.mock.whoami(mock),
                    );
                }
            }
            FuzzOp::ListComments { sid, role, target } => {
                let body = match target.map(self::target) {
                    Some((collection, id)) => {
                        json!({"values": {"targetCollection": collection, "targetId": id}})
                    }
                    None => json!({}),
                };
                self.run_action(sid, role, "comments:list", ActionQuery::default(), body)
                    .await
            }
            FuzzOp::CreateComment {
                sid,
                role,
                target,
                content,
                parent,
            } => {
                let (collection, id) = self::target(target);
                let body = json!({"values": {
                    "targetCollection": collection,
                    "targetId": id,
                    "content": self.render(&content),
                    "parentId": parent.map(|p| self.comment_id(p)),
                }});
                self.run_action(sid, role, "comments:create", ActionQuery::default(), body)
                    .await
            }
            FuzzOp::UpdateComment {
                sid,
                role,
                cid,
                content,
            } => {
                let query = ActionQuery {
                    filter_by_tk: Some(self.comment_id(cid).to_string()),
                    filter: None,
                };
                let body = json!({"values": {"content": self.render(&content)}});
                self.run_action(sid, role, "comments:update", query, body)
                    .await
            }
            FuzzOp::DestroyComment { sid, role, cid } => {
                let query = ActionQuery {
                    filter_by_tk: Some(self.comment_id(cid).to_string()),
                    filter: None,
                };
                self.run_action(sid, role, "comments:destroy", query, Value::Null)
                    .await
            }
            FuzzOp::CreateChangelog {
                sid,
                target,
                change,
            } => {
                let (collection, id) = self::target(target);
                let mut values = json!({"targetCollection": collection, "targetId": id});
                let change = match change {
                    FuzzChangelog::Created => json!({"action": "created"}),
                    FuzzChangelog::Updated { field, old, new } => {
                        json!({"action": "updated", "field": field, "oldValue": old, "newValue": new})
                    }
                    FuzzChangelog::StatusChanged { old, new } => json!({
                        "action": "status_changed",
                        "oldValue": format!("status{old}"),
                        "newValue": format!("status{new}"),
                    }),
                };
                if let (Value::Object(v), Value::Object(c)) = (&mut values, change) {
                    v.extend(c);
                }
                self.run_action(
                    sid,
                    None,
                    "comments:createChangelog",
                    ActionQuery::default(),
                    json!({ "values": values }),
                )
                .await
            }
            FuzzOp::RawList { sid, role } => {
                self.run_action(sid, role, "comments:rawList", ActionQuery::default(), json!({}))
                    .await
            }
            FuzzOp::DebugPermissions { sid, role } => {
                self.run_action(
                    sid,
                    role,
                    "comments:debugPermissions",
                    ActionQuery::default(),
                    Value::Null,
                )
                .await
            }
            FuzzOp::ReloadAcl { sid, role } => {
                self.run_action(
                    sid,
                    role,
                    "comments:reloadAcl",
                    ActionQuery::default(),
                    Value::Null,
                )
                .await
            }
            FuzzOp::ListNotifications { sid } => {
                self.run_action(
                    sid,
                    None,
                    "comment_notifications:list",
                    ActionQuery::default(),
                    Value::Null,
                )
                .await
            }
            FuzzOp::MarkRead { sid, nid } => {
                let query = ActionQuery {
                    filter_by_tk: Some(nid.to_string()),
                    filter: None,
                };
                self.run_action(
                    sid,
                    None,
                    "comment_notifications:markRead",
                    query,
                    Value::Null,
                )
                .await
            }
            FuzzOp::MarkAllRead { sid } => {
                self.run_action(
                    sid,
                    None,
                    "comment_notifications:markAllRead",
                    ActionQuery::default(),
                    Value::Null,
                )
                .await
            }
            FuzzOp::UnknownAction { sid } => {
                self.run_action(
                    sid,
                    None,
                    "comments:frobnicate",
                    ActionQuery::default(),
                    Value::Null,
                )
                .await
            }
        }
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);
