use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::publish::{Publish, WireMessage};

/// In-memory publisher for testing or local pipelines.
///
/// Records every published wire message in a shared queue. Can be told to
/// fail the next N publishes to exercise retry paths.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    sent: Arc<Mutex<Vec<WireMessage>>>,
    fail_next: Arc<Mutex<u32>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with a simulated broker error.
    pub async fn fail_next(&self, count: u32) {
        *self.fail_next.lock().await = count;
    }

    /// Drain all messages "sent" so far.
    pub async fn sent_messages(&self) -> Vec<WireMessage> {
        let mut sent = self.sent.lock().await;
        std::mem::take(&mut *sent)
    }
}

#[async_trait]
impl Publish for InMemoryPublisher {
    type Error = std::io::Error;

    #[tracing::instrument(skip_all)]
    async fn publish(&self, message: WireMessage) -> Result<(), Self::Error> {
        let mut fail_next = self.fail_next.lock().await;
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(std::io::Error::other("simulated broker failure"));
        }
        drop(fail_next);

        tracing::info!(
            destination = %message.destination,
            routing_key = %message.routing_key,
            "Message sent to in-memory broker",
        );
        self.sent.lock().await.push(message);
        Ok(())
    }
}
