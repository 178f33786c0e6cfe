//! Queue workers and the process runtime
//!
//! A [`Worker`] pulls work items from one queue (prefetch 1, so at most one
//! item in flight per worker) and settles every delivery according to the
//! error taxonomy. [`run_workers`] wires the configured number of file and
//! directory workers to the broker and supervises them.

use crate::config::{AmqpConfig, Config};
use crate::crawler::crawl::{CrawlOutcome, Crawler, SEED_PRIORITY};
use crate::extractor::{Extractor, TikaExtractor};
use crate::index::{Index, SqliteIndex};
use crate::ipfs::{Filesystem, IpfsShell};
use crate::retry::RetryPolicy;
use crate::transport::{
    AmqpBroker, Broker, Connection, Consumer, Delivery, Publisher, PublisherFactory,
    ReconnectSettings,
};
use crate::types::WorkItem;
use crate::{ConfigError, CrawlError, Result, Severity};
use futures::StreamExt;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Which crawl step a worker runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Extract and index files
    Files,
    /// List hashes and expand directories
    Directories,
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Files => write!(f, "file"),
            Self::Directories => write!(f, "directory"),
        }
    }
}

/// What happens to a delivery after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; the item is done (or dropped)
    Ack,
    /// Put the item back for another attempt
    Requeue,
    /// Put the item back and stop this worker
    RequeueAndStop,
}

impl Disposition {
    /// Settles a crawl result
    pub fn of(result: &Result<CrawlOutcome>) -> Self {
        match result {
            Ok(_) => Self::Ack,
            Err(e) => match e.severity() {
                Severity::Item => Self::Ack,
                Severity::Redeliver => Self::Requeue,
                Severity::Cancelled | Severity::Fatal | Severity::Unrecoverable => {
                    Self::RequeueAndStop
                }
            },
        }
    }
}

/// Consumes one queue and crawls what arrives
pub struct Worker {
    id: usize,
    role: QueueRole,
    crawler: Arc<Crawler>,
    queue: Arc<dyn Consumer>,
    retry_wait: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        role: QueueRole,
        crawler: Arc<Crawler>,
        queue: Arc<dyn Consumer>,
        retry_wait: Duration,
    ) -> Self {
        Self {
            id,
            role,
            crawler,
            queue,
            retry_wait,
        }
    }

    /// Runs until cancelled or a terminal error occurs
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Stopped because `cancel` fired
    /// * `Err(CrawlError)` - Fatal or unrecoverable error; the process must stop
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::debug!("{} worker {} started", self.role, self.id);

        while !cancel.is_cancelled() {
            let mut deliveries = match self.queue.consume(cancel).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    let err = CrawlError::from(e);
                    if err.is_terminal() {
                        return Err(err);
                    }
                    tracing::warn!("{} worker {} cannot subscribe: {}", self.role, self.id, err);
                    self.pause(cancel).await;
                    continue;
                }
            };

            while let Some(delivery) = deliveries.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        tracing::warn!("{} worker {} delivery failed: {}", self.role, self.id, e);
                        break;
                    }
                };

                if let Some(stop) = self.handle(delivery, cancel).await {
                    return stop;
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            tracing::warn!(
                "{} worker {} subscription ended, resubscribing in {:?}",
                self.role,
                self.id,
                self.retry_wait
            );
            self.pause(cancel).await;
        }

        tracing::debug!("{} worker {} stopped", self.role, self.id);
        Ok(())
    }

    /// Processes and settles one delivery
    ///
    /// Returns `Some` when the worker must stop.
    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) -> Option<Result<()>> {
        let item: WorkItem = match serde_json::from_slice(delivery.body()) {
            Ok(item) => item,
            Err(e) => {
                tracing::error!("Dropping undecodable work item: {}", e);
                self.settle(delivery, Disposition::Ack).await;
                return None;
            }
        };

        let result = match self.role {
            QueueRole::Files => self.crawler.crawl_file(&item, cancel).await,
            QueueRole::Directories => self.crawler.crawl_hash(&item, cancel).await,
        };

        let disposition = Disposition::of(&result);

        match result {
            Ok(outcome) => {
                tracing::debug!("{}: {:?}", item.hash, outcome);
                self.settle(delivery, disposition).await;
                None
            }
            Err(e) => match e.severity() {
                Severity::Item => {
                    tracing::error!("Dropping {}: {}", item.hash, e);
                    self.settle(delivery, disposition).await;
                    None
                }
                Severity::Redeliver => {
                    tracing::warn!("Requeueing {} in {:?}: {}", item.hash, self.retry_wait, e);
                    self.pause(cancel).await;
                    self.settle(delivery, disposition).await;
                    None
                }
                Severity::Cancelled => {
                    tracing::debug!("Cancelled while crawling {}", item.hash);
                    self.settle(delivery, disposition).await;
                    Some(Ok(()))
                }
                Severity::Fatal | Severity::Unrecoverable => {
                    tracing::error!(
                        "Stopping {} worker {} on {}: {}",
                        self.role,
                        self.id,
                        item.hash,
                        e
                    );
                    self.settle(delivery, disposition).await;
                    Some(Err(e))
                }
            },
        }
    }

    async fn settle(&self, delivery: Delivery, disposition: Disposition) {
        let result = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue | Disposition::RequeueAndStop => delivery.nack(true).await,
        };
        if let Err(e) = result {
            tracing::warn!("{} worker {} failed to settle delivery: {}", self.role, self.id, e);
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.retry_wait) => {}
        }
    }
}

/// Collaborators a worker pool runs against
pub struct Services {
    pub broker: Arc<dyn Broker>,
    pub filesystem: Arc<dyn Filesystem>,
    pub index: Arc<dyn Index>,
    pub extractor: Arc<dyn Extractor>,
}

impl Services {
    /// Builds the production collaborators described by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let retry = RetryPolicy::new(config.crawler.retry_interval());

        let filesystem = IpfsShell::new(&config.ipfs)
            .map_err(|e| ConfigError::InvalidUrl(format!("ipfs.api-url: {}", e)))?;
        let extractor = TikaExtractor::new(&config.extractor, retry)
            .map_err(|e| ConfigError::InvalidUrl(format!("extractor.url: {}", e)))?;
        let index = SqliteIndex::new(Path::new(&config.index.database_path))?;

        Ok(Self {
            broker: Arc::new(AmqpBroker::new(&config.amqp.url)),
            filesystem: Arc::new(filesystem),
            index: Arc::new(index),
            extractor: Arc::new(extractor),
        })
    }
}

/// Runs the file and directory worker pools until cancelled
///
/// Publishers get a connection each; all consumers share one connection with
/// a channel per worker.
///
/// # Returns
///
/// * `Ok(())` - Stopped because `cancel` fired
/// * `Err(CrawlError)` - A worker hit a terminal error or a broker connection
///   could not be restored
pub async fn run_workers(
    config: &Config,
    services: Services,
    cancel: &CancellationToken,
) -> Result<()> {
    let settings = ReconnectSettings::from_config(&config.amqp);
    let shutdown = cancel.child_token();

    let files = PublisherFactory::new(
        Arc::clone(&services.broker),
        settings,
        config.amqp.file_queue.as_str(),
    )
    .new_publisher(&shutdown)
    .await?;
    let directories = PublisherFactory::new(
        Arc::clone(&services.broker),
        settings,
        config.amqp.directory_queue.as_str(),
    )
    .new_publisher(&shutdown)
    .await?;

    let consumers = match Connection::dial(Arc::clone(&services.broker), settings).await {
        Ok(connection) => connection,
        Err(e) => {
            shutdown.cancel();
            return Err(e.into());
        }
    };

    let lost = [
        consumers.lost(),
        files.connection().lost(),
        directories.connection().lost(),
    ];

    let crawler = Arc::new(Crawler::new(
        &config.crawler,
        services.filesystem,
        services.index,
        services.extractor,
        Arc::new(files),
        Arc::new(directories),
    ));

    let pools = [
        (
            QueueRole::Files,
            config.crawler.file_workers,
            config.amqp.file_queue.as_str(),
        ),
        (
            QueueRole::Directories,
            config.crawler.directory_workers,
            config.amqp.directory_queue.as_str(),
        ),
    ];

    let mut workers = JoinSet::new();
    for (role, count, queue) in pools {
        for id in 0..count as usize {
            let queue = match consumers.open_queue(queue).await {
                Ok(queue) => queue,
                Err(e) => {
                    shutdown.cancel();
                    consumers.close().await;
                    return Err(e.into());
                }
            };
            let worker = Worker::new(
                id,
                role,
                Arc::clone(&crawler),
                Arc::new(queue),
                config.crawler.retry_interval(),
            );
            let token = shutdown.clone();
            workers.spawn(async move { worker.run(&token).await });
        }
    }

    tracing::info!(
        "Started {} file and {} directory workers against {}",
        config.crawler.file_workers,
        config.crawler.directory_workers,
        consumers.describe()
    );

    let mut result = Ok(());
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                    shutdown.cancel();
                }
                Some(Err(e)) => {
                    tracing::error!("Worker task failed: {}", e);
                    if result.is_ok() {
                        result = Err(CrawlError::Worker(e.to_string()));
                    }
                    shutdown.cancel();
                }
            },
            _ = any_cancelled(&lost), if !shutdown.is_cancelled() => {
                tracing::error!("Broker connection could not be restored, stopping workers");
                result = Err(CrawlError::ConnectionLost(consumers.describe()));
                shutdown.cancel();
            }
        }
    }

    shutdown.cancel();
    consumers.close().await;

    tracing::info!("All workers stopped");
    result
}

async fn any_cancelled(tokens: &[CancellationToken]) {
    futures::future::select_all(tokens.iter().map(|token| Box::pin(token.cancelled()))).await;
}

/// Publishes root work items for `hashes` onto the directory queue
///
/// # Returns
///
/// The number of items published.
pub async fn seed(
    broker: Arc<dyn Broker>,
    config: &AmqpConfig,
    hashes: &[String],
) -> Result<usize> {
    let cancel = CancellationToken::new();
    let factory = PublisherFactory::new(
        broker,
        ReconnectSettings::from_config(config),
        config.directory_queue.as_str(),
    );
    let publisher = factory.new_publisher(&cancel).await?;

    let mut published = 0;
    let result = async {
        for hash in hashes {
            let item = WorkItem::root(hash.as_str());
            let payload = serde_json::to_vec(&item).map_err(|source| CrawlError::Encode {
                hash: hash.clone(),
                source,
            })?;
            publisher.publish(payload, SEED_PRIORITY).await?;
            tracing::info!("Seeded {}", hash);
            published += 1;
        }
        Ok::<(), CrawlError>(())
    }
    .await;

    cancel.cancel();
    publisher.connection().close().await;
    result.map(|()| published)
}
