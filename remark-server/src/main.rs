use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use remark_api::{AuthToken, ResolverPolicy, Service, UserId, Uuid};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

mod acl;
mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;
mod query;

use acl::AclCache;
use error::Error;
use extractors::{AppState, PgPool};

#[derive(Debug, StructOpt)]
#[structopt(name = "remark-server", about = "Comment and notification server")]
struct Opt {
    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    /// Bearer token accepted by the /api/admin endpoints, which are disabled if unset
    #[structopt(long, env = "ADMIN_TOKEN")]
    admin_token: Option<Uuid>,

    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// User that bypasses every permission check
    #[structopt(long, env = "ROOT_USER_ID", default_value = "1")]
    root_user_id: i64,

    /// Do not give any user the bypass by id
    #[structopt(long)]
    no_root_user: bool,

    /// Role that bypasses every permission check
    #[structopt(long, env = "ROOT_ROLE", default_value = "root")]
    root_role: String,

    /// Honor the role claimed in the x-role header for the bypass
    #[structopt(long, env = "TRUST_ROLE_HEADER", parse(try_from_str), default_value = "false")]
    trust_role_header: bool,

    /// Deny as soon as the access control snapshot does, without reading permission rows
    #[structopt(
        long,
        env = "DISABLE_PERMISSION_FALLBACK",
        parse(try_from_str),
        default_value = "false"
    )]
    disable_permission_fallback: bool,

    /// Log filter, in tracing-subscriber's EnvFilter syntax
    #[structopt(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Opt {
    fn policy(&self) -> ResolverPolicy {
        ResolverPolicy {
            root_user_id: (!self.no_root_user).then_some(UserId(self.root_user_id)),
            root_role: self.root_role.clone(),
            trust_role_claim: self.trust_role_header,
            fallback: !self.disable_permission_fallback,
        }
    }
}

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<PgPool> {
    Ok(PgPool::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(db_url)
            .await
            .with_context(|| format!("opening database {db_url:?}"))?,
    ))
}

pub async fn app(db: PgPool, admin_token: Option<AuthToken>, policy: ResolverPolicy) -> Router {
    let state = AppState {
        db,
        acl: AclCache::new(&policy.root_role),
        service: Arc::new(Service::new(policy)),
        admin_token,
    };
    Router::new()
        .route("/api/admin/create-user", post(handlers::admin_create_user))
        .route(
            "/api/admin/grant-permission",
            post(handlers::admin_grant_permission),
        )
        .route("/api/auth", post(handlers::auth))
        .route("/api/unauth", post(handlers::unauth))
        .route("/api/whoami", get(handlers::whoami))
        .route(
            "/api/:action",
            get(handlers::action).post(handlers::action),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let filter = EnvFilter::try_new(&opt.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let pool = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&mut *pool.acquire().await?)
        .await
        .context("applying migrations")?;
    if opt.admin_token.is_none() {
        tracing::warn!("no admin token configured, admin endpoints are disabled");
    }

    let app = app(pool, opt.admin_token.map(AuthToken), opt.policy()).await;
    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
