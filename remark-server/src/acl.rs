use std::sync::Arc;

use anyhow::Context;
use remark_api::{AclSnapshot, Caller, COMMENTS_RESOURCE};
use tokio::sync::RwLock;

use crate::db;

/// Access control engine shared by all requests
///
/// The snapshot is compiled from the permissions table on first use and on
/// explicit reloads only, so it can lag behind the table in between.
#[derive(Clone)]
pub struct AclCache {
    root_role: Arc<str>,
    snapshot: Arc<RwLock<Option<AclSnapshot>>>,
}

impl AclCache {
    pub fn new(root_role: &str) -> AclCache {
        AclCache {
            root_role: Arc::from(root_role),
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// Recompiles the snapshot, returning the number of grants it holds
    pub async fn reload(&self, conn: &mut sqlx::PgConnection) -> anyhow::Result<usize> {
        let rows = db::fetch_permissions(&mut *conn, None, &[])
            .await
            .context("fetching permission rows to compile")?;
        let snapshot = AclSnapshot::compile(&rows, &self.root_role);
        let grants = snapshot.len();
        *self.snapshot.write().await = Some(snapshot);
        tracing::info!(grants, "reloaded access control snapshot");
        Ok(grants)
    }

    pub async fn can(
        &self,
        conn: &mut sqlx::PgConnection,
        caller: &Caller,
        action: &str,
    ) -> anyhow::Result<bool> {
        if let Some(acl) = &*self.snapshot.read().await {
            return Ok(acl.can(caller, COMMENTS_RESOURCE, action));
        }
        self.reload(&mut *conn).await?;
        match &*self.snapshot.read().await {
            Some(acl) => Ok(acl.can(caller, COMMENTS_RESOURCE, action)),
            None => Err(anyhow::anyhow!("access control snapshot vanished after loading")),
        }
    }
}
