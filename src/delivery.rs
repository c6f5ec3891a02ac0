use std::io;

use async_trait::async_trait;

use crate::model::User;

/// Transport for queued notifications. The dispatch job drains the queue
/// through one of these; a failed delivery leaves the notification queued
/// for the next sweep.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, user: &User, message: &str) -> io::Result<()>;
}

/// Default channel: writes the notification to the log. Always succeeds.
pub struct LogDelivery;

#[async_trait]
impl DeliveryChannel for LogDelivery {
    async fn deliver(&self, user: &User, message: &str) -> io::Result<()> {
        tracing::info!(email = %user.email, message, "notification delivered");
        Ok(())
    }
}
