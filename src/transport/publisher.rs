//! Publisher factory
//!
//! Each publisher gets its own connection so a slow consumer connection never
//! stalls publishing. The connection is closed as soon as the owner's
//! cancellation token fires.

use crate::transport::{Broker, Connection, Queue, ReconnectSettings, TransportResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Creates publishers bound to one named queue
#[derive(Clone)]
pub struct PublisherFactory {
    broker: Arc<dyn Broker>,
    settings: ReconnectSettings,
    queue: String,
}

impl PublisherFactory {
    pub fn new(
        broker: Arc<dyn Broker>,
        settings: ReconnectSettings,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            settings,
            queue: queue.into(),
        }
    }

    /// Opens a fresh connection, channel and queue
    ///
    /// # Arguments
    ///
    /// * `cancel` - Closes the connection when cancelled
    ///
    /// # Returns
    ///
    /// * `Ok(Queue)` - Ready to publish
    /// * `Err(TransportError)` - Dialing or declaring the queue failed
    pub async fn new_publisher(&self, cancel: &CancellationToken) -> TransportResult<Queue> {
        let connection = Connection::dial(Arc::clone(&self.broker), self.settings).await?;

        let queue = match connection.open_queue(&self.queue).await {
            Ok(queue) => queue,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        let cancel = cancel.clone();
        let name = self.queue.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            tracing::info!("Closing publisher connection for {}; context closed", name);
            connection.close().await;
        });

        Ok(queue)
    }
}
