//! Crawler module: dedup, per-item state machine and queue workers
//!
//! This module contains:
//! - `references`: reference bookkeeping and the dedup decision
//! - `crawl`: the `Crawler` hash and file steps
//! - `Worker` / `run_workers` / `seed`: the queue-driven runtime

mod crawl;
mod references;
mod worker;

pub use crawl::{CrawlOutcome, Crawler, CHILD_PRIORITY, SEED_PRIORITY};
pub use references::{resolve, update_references, Resolution};
pub use worker::{run_workers, seed, Disposition, QueueRole, Services, Worker};
