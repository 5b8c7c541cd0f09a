use anyhow::Context;
use async_trait::async_trait;
use remark_client::{
    api::{payload::ActionQuery, ActionName, AuthToken, Error},
    Backend, SyncError,
};
use serde_json::Value;

/// Talks to a remark-server over HTTP
pub struct HttpBackend {
    pub client: reqwest::Client,
    pub host: String,
    pub token: Option<AuthToken>,
    pub role: Option<String>,
}

fn transport(e: reqwest::Error) -> SyncError {
    SyncError::Transport(e.into())
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(
        &self,
        action: ActionName,
        query: &ActionQuery,
        body: Value,
    ) -> Result<Value, SyncError> {
        let mut req = self
            .client
            .post(format!("{}/api/{action}", self.host))
            .query(query)
            .json(&body);
        if let Some(token) = self.token {
            req = req.bearer_auth(token.0);
        }
        if let Some(role) = &self.role {
            req = req.header("x-role", role);
        }
        let resp = req.send().await.map_err(transport)?;
        if resp.status().is_success() {
            return resp.json().await.map_err(transport);
        }
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        let err = Error::parse(&body)
            .with_context(|| format!("parsing {status} error response"))
            .map_err(SyncError::Transport)?;
        tracing::debug!(%action, %err, "server returned an error");
        Err(SyncError::Api(err))
    }
}
