use std::time::Duration;

use tokio::sync::RwLock;

use crate::{
    api::{Notification, NotificationId},
    Backend, Client, SyncError,
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct NotificationInbox<B> {
    client: Client<B>,
    items: RwLock<Vec<Notification>>,
}

impl<B: Backend> NotificationInbox<B> {
    pub fn new(client: Client<B>) -> NotificationInbox<B> {
        NotificationInbox {
            client,
            items: RwLock::new(Vec::new()),
        }
    }

    /// Latest fetched notifications, newest first
    pub async fn items(&self) -> Vec<Notification> {
        self.items.read().await.clone()
    }

    pub async fn unread_count(&self) -> usize {
        self.items.read().await.iter().filter(|n| !n.is_read).count()
    }

    pub async fn refresh(&self) -> Result<(), SyncError> {
        let items = self.client.list_notifications().await?;
        *self.items.write().await = items;
        Ok(())
    }

    pub async fn mark_read(&self, id: NotificationId) -> Result<(), SyncError> {
        self.client.mark_read(id).await?;
        self.refresh().await
    }

    pub async fn mark_all_read(&self) -> Result<(), SyncError> {
        self.client.mark_all_read().await?;
        self.refresh().await
    }

    /// Refreshes every `period` forever, calling `on_update` after each successful fetch
    pub async fn watch<F>(&self, period: Duration, mut on_update: F)
    where
        F: FnMut(&[Notification]) + Send,
    {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match self.refresh().await {
                Ok(()) => on_update(&self.items.read().await),
                Err(e) => tracing::warn!(error = %e, "polling notifications failed"),
            }
        }
    }
}
