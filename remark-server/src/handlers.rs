use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use remark_api::{
    payload::ActionQuery, ActionName, AuthToken, Error as ApiError, NewPermission, NewSession,
    NewUser, PermissionId, Service, UserId,
};
use serde_json::Value;

use crate::{acl::AclCache, db, extractors::*, Error};

pub async fn admin_create_user(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Json(data): Json<NewUser>,
) -> Result<Json<UserId>, Error> {
    data.validate()?;
    let id = db::create_user(&mut *conn, data).await?;
    tracing::info!(?id, "created user");
    Ok(Json(id))
}

pub async fn admin_grant_permission(
    AdminAuth: AdminAuth,
    State(acl): State<AclCache>,
    mut conn: PgConn,
    Json(data): Json<NewPermission>,
) -> Result<Json<PermissionId>, Error> {
    data.validate()?;
    if let Some(user) = data.user_id {
        if !db::user_exists(&mut *conn, user).await? {
            return Err(Error::Api(ApiError::not_found("users", user.0)));
        }
    }
    let id = db::grant_permission(&mut *conn, &data).await?;
    acl.reload(&mut *conn)
        .await
        .context("reloading access control after a grant")?;
    Ok(Json(id))
}

pub async fn auth(
    mut conn: PgConn,
    Json(data): Json<NewSession>,
) -> Result<Json<AuthToken>, Error> {
    data.validate()?;
    Ok(Json(
        db::login_user(&mut *conn, &data)
            .await
            .context("logging user in")?
            .ok_or(Error::permission_denied())?,
    ))
}

pub async fn unauth(user: PreAuth, mut conn: PgConn) -> Result<(), Error> {
    match db::logout_user(&mut *conn, &user.0).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::permission_denied()),
        Err(e) => Err(Error::Anyhow(e)),
    }
}

pub async fn whoami(Auth(user): Auth) -> Json<UserId> {
    Json(user)
}

/// Runs a resource action, like `POST /api/comments:create`
pub async fn action(
    MaybeAuth(caller): MaybeAuth,
    State(service): State<Arc<Service>>,
    State(acl): State<AclCache>,
    mut conn: PgConn,
    Path(action): Path<String>,
    Query(query): Query<ActionQuery>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, Error> {
    let action: ActionName = action.parse()?;
    tracing::debug!(%action, user = ?caller.user, "running action");
    let body = body.map(|Json(b)| b).unwrap_or(Value::Null);
    let mut db = db::PostgresDb {
        conn: &mut *conn,
        acl: &acl,
    };
    Ok(Json(
        service
            .dispatch(&mut db, &caller, action, &query, &body)
            .await?,
    ))
}
