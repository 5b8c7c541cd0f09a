use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{self, request},
};
use remark_api::{AuthToken, Caller, Service, UserId, Uuid};

use crate::{acl::AclCache, db, Error};

/// Header through which a caller may claim a role, honored only if the resolver policy trusts it
pub const ROLE_HEADER: &str = "x-role";

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub db: PgPool,
    pub acl: AclCache,
    pub service: Arc<Service>,
    pub admin_token: Option<AuthToken>,
}

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn acquire(&self) -> Result<PgConn, Error> {
        Ok(PgConn(
            self.0.acquire().await.context("acquiring db connection")?,
        ))
    }

    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }
}

pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

#[async_trait]
impl FromRequestParts<AppState> for PgConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<PgConn, Error> {
        state.db.acquire().await
    }
}

impl Deref for PgConn {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub struct PreAuth(pub AuthToken);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        match req.headers.get(http::header::AUTHORIZATION) {
            None => Err(Error::permission_denied()),
            Some(auth) => {
                let auth = auth.to_str().map_err(|_| Error::permission_denied())?;
                let mut auth = auth.split(' ');
                if !auth
                    .next()
                    .ok_or(Error::permission_denied())?
                    .eq_ignore_ascii_case("bearer")
                {
                    return Err(Error::permission_denied());
                }
                let token = auth.next().ok_or(Error::permission_denied())?;
                if auth.next().is_some() {
                    return Err(Error::permission_denied());
                }
                let token = Uuid::try_from(token).map_err(|_| Error::permission_denied())?;
                Ok(PreAuth(AuthToken(token)))
            }
        }
    }
}

pub struct Auth(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        let mut conn = PgConn::from_request_parts(req, state).await?;
        Ok(Auth(db::recover_session(&mut *conn, token).await?))
    }
}

/// Whoever issued the request, anonymous callers included
///
/// A request that does carry credentials must carry valid ones.
pub struct MaybeAuth(pub Caller);

#[async_trait]
impl FromRequestParts<AppState> for MaybeAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<MaybeAuth, Error> {
        let role_claim = req
            .headers
            .get(ROLE_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(String::from);
        let caller = if req.headers.contains_key(http::header::AUTHORIZATION) {
            let Auth(user) = Auth::from_request_parts(req, state).await?;
            let mut conn = PgConn::from_request_parts(req, state).await?;
            let roles = db::fetch_roles(&mut *conn, user).await?;
            Caller::user(user, roles)
        } else {
            Caller::anonymous()
        };
        Ok(MaybeAuth(caller.with_role_claim(role_claim)))
    }
}

pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<AdminAuth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        if Some(token) == state.admin_token {
            Ok(AdminAuth)
        } else {
            Err(Error::permission_denied())
        }
    }
}
