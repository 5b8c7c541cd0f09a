use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{
    api::{Comment, CommentId, DestroyResult, Target},
    Backend, Client, CommentTree, SyncError,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RowState {
    Synced,
    PendingEdit,
    PendingReply,
    PendingDelete,
}

#[derive(Debug, Default)]
struct View {
    tree: CommentTree,
    pending: HashMap<CommentId, RowState>,
}

/// Local copy of the comments attached to one target
///
/// Deletes are optimistic: the row disappears immediately and comes back if
/// the server does not confirm. Edits and replies only show up once the
/// server accepted them. Every successful mutation re-fetches the listing,
/// and a failing re-fetch does not turn a confirmed mutation into an error.
pub struct CommentThread<B> {
    client: Client<B>,
    target: Target,
    view: RwLock<View>,
}

impl<B: Backend> CommentThread<B> {
    pub fn new(client: Client<B>, target: Target) -> CommentThread<B> {
        CommentThread {
            client,
            target,
            view: RwLock::new(View::default()),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub async fn tree(&self) -> CommentTree {
        self.view.read().await.tree.clone()
    }

    pub async fn state(&self, id: CommentId) -> RowState {
        self.view
            .read()
            .await
            .pending
            .get(&id)
            .copied()
            .unwrap_or(RowState::Synced)
    }

    pub async fn refresh(&self) -> Result<(), SyncError> {
        let rows = self.client.list(&self.target).await?;
        let mut tree = CommentTree::build(rows);
        let mut view = self.view.write().await;
        let View { pending, .. } = &mut *view;
        for (id, state) in pending.iter() {
            if *state == RowState::PendingDelete {
                tree.remove(*id);
            }
        }
        pending.retain(|id, state| *state == RowState::PendingDelete || tree.find(*id).is_some());
        view.tree = tree;
        Ok(())
    }

    async fn begin(&self, id: CommentId, state: RowState) -> Result<(), SyncError> {
        let mut view = self.view.write().await;
        if view.pending.contains_key(&id) {
            return Err(SyncError::Busy(id));
        }
        if view.tree.find(id).is_none() {
            return Err(SyncError::NotLoaded(id));
        }
        view.pending.insert(id, state);
        Ok(())
    }

    async fn finish(&self, id: CommentId) {
        self.view.write().await.pending.remove(&id);
    }

    /// Re-fetch after a confirmed mutation, whose result stands even if this fails
    async fn refresh_after(&self, id: CommentId, what: &str) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(%id, error = %e, "{what} confirmed but refreshing the thread failed");
        }
    }

    pub async fn post(&self, content: &str) -> Result<Comment, SyncError> {
        let c = self.client.create(&self.target, content, None).await?;
        self.refresh_after(c.id, "post").await;
        Ok(c)
    }

    pub async fn reply(&self, parent: CommentId, content: &str) -> Result<Comment, SyncError> {
        self.begin(parent, RowState::PendingReply).await?;
        let res = self.client.create(&self.target, content, Some(parent)).await;
        self.finish(parent).await;
        let c = res?;
        self.refresh_after(c.id, "reply").await;
        Ok(c)
    }

    pub async fn edit(&self, id: CommentId, content: &str) -> Result<Comment, SyncError> {
        self.begin(id, RowState::PendingEdit).await?;
        let res = self.client.update(id, content).await;
        self.finish(id).await;
        let c = res?;
        self.refresh_after(id, "edit").await;
        Ok(c)
    }

    pub async fn delete(&self, id: CommentId) -> Result<DestroyResult, SyncError> {
        let removed = {
            let mut view = self.view.write().await;
            if view.pending.contains_key(&id) {
                return Err(SyncError::Busy(id));
            }
            let removed = view.tree.remove(id).ok_or(SyncError::NotLoaded(id))?;
            view.pending.insert(id, RowState::PendingDelete);
            removed
        };

        let outcome = match self.client.destroy(id).await {
            Ok(res) if res.success => Ok(res),
            Ok(res) => Err(SyncError::DeleteFailed {
                id,
                reason: res
                    .error
                    .unwrap_or_else(|| String::from("server did not confirm the deletion")),
            }),
            Err(e) => Err(e),
        };

        {
            let mut view = self.view.write().await;
            view.pending.remove(&id);
            // other rows may have changed meanwhile, so only this one goes back
            if outcome.is_err() {
                view.tree.insert(removed);
            }
        }
        match outcome {
            Ok(res) => {
                self.refresh_after(id, "delete").await;
                Ok(res)
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "delete failed, restoring comment");
                Err(e)
            }
        }
    }
}
