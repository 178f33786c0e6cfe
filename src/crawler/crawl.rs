//! Per-item crawl state machine
//!
//! Every work item runs through dedup first. Unknown hashes are then listed,
//! classified and either expanded (directories: children are queued and the
//! directory is indexed) or handed to the file queue (files). File items
//! pulled from that queue are extracted and indexed by [`Crawler::crawl_file`].

use crate::config::CrawlerConfig;
use crate::crawler::references::{self, Resolution};
use crate::extractor::{Extractor, Metadata};
use crate::index::{Index, Properties};
use crate::ipfs::{Filesystem, Listing};
use crate::retry::{classify, ErrorClass, FetchError, RetryPolicy};
use crate::transport::Publisher;
use crate::types::{Reference, ResourceType, WorkItem, INVALID_TYPE};
use crate::{CrawlError, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Priority of seeded root items
pub const SEED_PRIORITY: u8 = 9;

/// Priority of items discovered while crawling
pub const CHILD_PRIORITY: u8 = 1;

/// Terminal state of one crawl step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Already indexed and nothing new learned
    Deduped,
    /// Already indexed; only its references were patched
    ReferenceUpdated,
    /// Listed as a file and handed to the file queue
    FileQueued,
    /// Record written (directory after expansion, or extracted file)
    Indexed,
    /// Unreferenced chunk-sized object, not indexed
    SkippedPartial,
    /// Listed as something other than a file or directory
    SkippedUnsupported,
}

enum Dedup {
    Done(CrawlOutcome),
    New(Vec<Reference>),
}

/// Crawls hashes against a filesystem, an index and an extractor
pub struct Crawler {
    partial_size: u64,
    metadata_max_size: u64,
    retry: RetryPolicy,
    filesystem: Arc<dyn Filesystem>,
    index: Arc<dyn Index>,
    extractor: Arc<dyn Extractor>,
    files: Arc<dyn Publisher>,
    directories: Arc<dyn Publisher>,
}

impl Crawler {
    /// Creates a crawler
    ///
    /// # Arguments
    ///
    /// * `config` - Chunk size, metadata size ceiling and retry interval
    /// * `filesystem` - Lists hashes
    /// * `index` - Dedup lookups and record writes
    /// * `extractor` - File metadata
    /// * `files` - Publisher for the file queue
    /// * `directories` - Publisher for the directory queue
    pub fn new(
        config: &CrawlerConfig,
        filesystem: Arc<dyn Filesystem>,
        index: Arc<dyn Index>,
        extractor: Arc<dyn Extractor>,
        files: Arc<dyn Publisher>,
        directories: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            partial_size: config.partial_size,
            metadata_max_size: config.metadata_max_size,
            retry: RetryPolicy::new(config.retry_interval()),
            filesystem,
            index,
            extractor,
            files,
            directories,
        }
    }

    /// Crawls a hash of unknown type (directory queue)
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlOutcome)` - Terminal state reached for this item
    /// * `Err(CrawlError)` - See [`CrawlError::severity`] for how to settle the item
    pub async fn crawl_hash(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<CrawlOutcome> {
        let references = match self.dedup(item, cancel).await? {
            Dedup::Done(outcome) => return Ok(outcome),
            Dedup::New(references) => references,
        };

        tracing::info!("Crawling hash '{}' ({})", item.hash, item.name);

        let listing = self.list(&item.hash, cancel).await?;

        match listing.kind {
            ResourceType::File => {
                let file = WorkItem {
                    size: listing.size,
                    ..item.clone()
                };
                self.enqueue(self.files.as_ref(), &file).await?;
                tracing::debug!("Queued file {} ({} bytes)", item.hash, listing.size);
                Ok(CrawlOutcome::FileQueued)
            }
            ResourceType::Directory => {
                self.expand_directory(item, listing, references, cancel)
                    .await
            }
            other => {
                tracing::info!("Type '{}' skipped for '{}'", other, item.hash);
                Ok(CrawlOutcome::SkippedUnsupported)
            }
        }
    }

    /// Extracts and indexes a hash known to be a file (file queue)
    pub async fn crawl_file(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<CrawlOutcome> {
        let references = match self.dedup(item, cancel).await? {
            Dedup::Done(outcome) => return Ok(outcome),
            Dedup::New(references) => references,
        };

        if item.is_unreferenced_partial(item.size, self.partial_size) {
            tracing::info!("Skipping unreferenced partial content for file {}", item.hash);
            return Ok(CrawlOutcome::SkippedPartial);
        }

        tracing::info!("Crawling file {} ({})", item.hash, item.name);

        let mut metadata = if item.size == 0 {
            Metadata::new()
        } else if item.size > self.metadata_max_size {
            return Err(CrawlError::TooLarge {
                hash: item.hash.clone(),
                name: item.name.clone(),
                size: item.size,
                max: self.metadata_max_size,
            });
        } else {
            let path = item.resolvable_path();
            match self.extractor.extract(cancel, &path).await {
                Ok(metadata) => metadata,
                Err(e) => return Err(self.fetch_failed(&item.hash, e, cancel).await),
            }
        };

        metadata.insert("size".to_string(), Value::from(item.size));
        metadata.insert(
            "references".to_string(),
            self.encode(&item.hash, &references)?,
        );

        self.write(ResourceType::File.as_str(), &item.hash, metadata, cancel)
            .await?;

        tracing::info!("Finished file {}", item.hash);
        Ok(CrawlOutcome::Indexed)
    }

    /// Resolves references and patches them on known hashes
    async fn dedup(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<Dedup> {
        let resolution = references::resolve(
            self.index.as_ref(),
            &item.hash,
            &item.name,
            &item.parent_hash,
        )
        .await?;

        if !resolution.already_indexed {
            if resolution.references_changed {
                tracing::debug!(
                    "Adding {}, reference '{}' from {}",
                    item.hash,
                    item.name,
                    item.parent_hash
                );
            }
            return Ok(Dedup::New(resolution.references));
        }

        if !resolution.needs_reference_update() {
            tracing::debug!("Found {}, references not updated", item.hash);
            return Ok(Dedup::Done(CrawlOutcome::Deduped));
        }

        self.update_references(item, resolution, cancel).await?;
        Ok(Dedup::Done(CrawlOutcome::ReferenceUpdated))
    }

    async fn update_references(
        &self,
        item: &WorkItem,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut properties = Properties::new();
        properties.insert(
            "references".to_string(),
            self.encode(&item.hash, &resolution.references)?,
        );

        let item_type = resolution.item_type.unwrap_or_default();
        self.write(&item_type, &item.hash, properties, cancel).await?;

        tracing::info!(
            "Found {}, reference added: '{}' from {}",
            item.hash,
            item.name,
            item.parent_hash
        );
        Ok(())
    }

    async fn expand_directory(
        &self,
        item: &WorkItem,
        listing: Listing,
        references: Vec<Reference>,
        cancel: &CancellationToken,
    ) -> Result<CrawlOutcome> {
        let mut queued = 0usize;

        for link in &listing.links {
            let child = WorkItem::child(&link.hash, &link.name, link.size, &item.hash);

            // Any failed publish fails the whole expansion
            match link.kind {
                ResourceType::File => self.enqueue(self.files.as_ref(), &child).await?,
                ResourceType::Directory => {
                    self.enqueue(self.directories.as_ref(), &child).await?
                }
                other => {
                    tracing::info!(
                        "Type '{}' skipped for link '{}' in {}",
                        other,
                        link.name,
                        item.hash
                    );
                    continue;
                }
            }
            queued += 1;
        }

        tracing::debug!(
            "Queued {} of {} links from {}",
            queued,
            listing.links.len(),
            item.hash
        );

        if item.is_unreferenced_partial(listing.size, self.partial_size) {
            tracing::info!(
                "Skipping unreferenced partial content for directory {}",
                item.hash
            );
            return Ok(CrawlOutcome::SkippedPartial);
        }

        let mut properties = Properties::new();
        properties.insert("links".to_string(), self.encode(&item.hash, &listing.links)?);
        properties.insert("size".to_string(), Value::from(listing.size));
        properties.insert("references".to_string(), self.encode(&item.hash, &references)?);

        self.write(ResourceType::Directory.as_str(), &item.hash, properties, cancel)
            .await?;

        tracing::info!("Finished hash {}", item.hash);
        Ok(CrawlOutcome::Indexed)
    }

    /// Lists a hash, retrying transient failures
    async fn list(&self, hash: &str, cancel: &CancellationToken) -> Result<Listing> {
        let what = format!("Listing {}", hash);
        match self
            .retry
            .run(cancel, &what, || self.filesystem.list(hash))
            .await
        {
            Ok(listing) => Ok(listing),
            Err(e) => Err(self.fetch_failed(hash, e, cancel).await),
        }
    }

    /// Turns a fetch failure into a crawl error, poisoning the hash on fatal ones
    async fn fetch_failed(
        &self,
        hash: &str,
        err: FetchError,
        cancel: &CancellationToken,
    ) -> CrawlError {
        if err == FetchError::Cancelled {
            return CrawlError::Cancelled;
        }

        if classify(&err) != ErrorClass::Fatal {
            return CrawlError::Fetch {
                hash: hash.to_string(),
                source: err,
            };
        }

        tracing::error!("Unrecoverable error for {}: {}", hash, err);

        // A request we could not build says nothing about the hash itself
        if !matches!(err, FetchError::Protocol(_)) {
            return CrawlError::Fatal {
                hash: hash.to_string(),
                source: err,
            };
        }

        // Best effort; the process is going down either way
        let mut properties = Properties::new();
        properties.insert("error".to_string(), Value::String(err.to_string()));
        if let Err(e) = self.write(INVALID_TYPE, hash, properties, cancel).await {
            tracing::warn!("Failed to mark {} as {}: {}", hash, INVALID_TYPE, e);
        }

        CrawlError::Fatal {
            hash: hash.to_string(),
            source: err,
        }
    }

    async fn enqueue(&self, publisher: &dyn Publisher, item: &WorkItem) -> Result<()> {
        let payload = serde_json::to_vec(item).map_err(|source| CrawlError::Encode {
            hash: item.hash.clone(),
            source,
        })?;
        publisher.publish(payload, CHILD_PRIORITY).await?;
        Ok(())
    }

    /// Writes to the index unless the crawl was cancelled
    async fn write(
        &self,
        item_type: &str,
        hash: &str,
        properties: Properties,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        self.index.index_item(item_type, hash, properties).await?;
        Ok(())
    }

    fn encode<T: serde::Serialize>(&self, hash: &str, value: &T) -> Result<Value> {
        serde_json::to_value(value).map_err(|source| CrawlError::Encode {
            hash: hash.to_string(),
            source,
        })
    }
}
