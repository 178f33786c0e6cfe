//! Integration tests for the crawler
//!
//! These tests drive the crawler end-to-end: an in-memory broker and index,
//! and wiremock servers standing in for the IPFS API and the extraction
//! service.

use ipfs_crawler::config::{Config, CrawlerConfig};
use ipfs_crawler::crawler::{run_workers, seed, CrawlOutcome, Crawler, Services};
use ipfs_crawler::extractor::TikaExtractor;
use ipfs_crawler::index::{MemoryIndex, Properties};
use ipfs_crawler::ipfs::IpfsShell;
use ipfs_crawler::retry::RetryPolicy;
use ipfs_crawler::transport::{MemoryBroker, PublisherFactory, ReconnectSettings};
use ipfs_crawler::{CrawlError, WorkItem};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FILES: &str = "files";
const DIRECTORIES: &str = "hashes";

/// Creates a test configuration pointing at the given mock servers
fn create_test_config(ipfs_url: &str, extractor_url: &str) -> Config {
    let mut config = Config::default();
    config.crawler = CrawlerConfig {
        retry_wait: 20,
        file_workers: 2,
        directory_workers: 1,
        ..CrawlerConfig::default()
    };
    config.ipfs.api_url = ipfs_url.to_string();
    config.ipfs.timeout = 2_000;
    config.extractor.url = format!("{}/ipfs", extractor_url);
    config.extractor.timeout = 2_000;
    config.amqp.reconnect_wait = 20;
    config
}

struct Pipeline {
    broker: MemoryBroker,
    index: Arc<MemoryIndex>,
    extractor: Arc<TikaExtractor>,
    crawler: Crawler,
    cancel: CancellationToken,
}

/// Builds a crawler publishing to a memory broker
async fn create_pipeline(config: &Config) -> Pipeline {
    let broker = MemoryBroker::new();
    let cancel = CancellationToken::new();
    let settings = ReconnectSettings::from_config(&config.amqp);

    let files = PublisherFactory::new(Arc::new(broker.clone()), settings, FILES)
        .new_publisher(&cancel)
        .await
        .expect("Failed to create file publisher");
    let directories = PublisherFactory::new(Arc::new(broker.clone()), settings, DIRECTORIES)
        .new_publisher(&cancel)
        .await
        .expect("Failed to create directory publisher");

    let index = Arc::new(MemoryIndex::new());
    let extractor = Arc::new(
        TikaExtractor::new(
            &config.extractor,
            RetryPolicy::new(config.crawler.retry_interval()),
        )
        .expect("Failed to create extractor"),
    );
    let filesystem = Arc::new(IpfsShell::new(&config.ipfs).expect("Failed to create shell"));

    let crawler = Crawler::new(
        &config.crawler,
        filesystem,
        index.clone(),
        extractor.clone(),
        Arc::new(files),
        Arc::new(directories),
    );

    Pipeline {
        broker,
        index,
        extractor,
        crawler,
        cancel,
    }
}

fn decode(body: &[u8]) -> WorkItem {
    serde_json::from_slice(body).expect("Published item is not a work item")
}

fn ls_body(hash: &str, kind: &str, size: u64, links: Value) -> Value {
    json!({
        "Arguments": { format!("/ipfs/{}", hash): hash },
        "Objects": {
            hash: {
                "Hash": hash,
                "Size": size,
                "Type": kind,
                "Links": links
            }
        }
    })
}

async fn mock_ls(server: &MockServer, hash: &str, body: Value) {
    Mock::given(method("POST"))
        .and(path("/api/v0/file/ls"))
        .and(query_param("arg", format!("/ipfs/{}", hash)))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_directory_expansion_publishes_children_and_indexes_directory() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    mock_ls(
        &ipfs,
        "QmD",
        ls_body(
            "QmD",
            "Directory",
            300,
            json!([
                {"Name": "f1.txt", "Hash": "QmF1", "Size": 100, "Type": "File"},
                {"Name": "d2", "Hash": "QmD2", "Size": 200, "Type": "Directory"}
            ]),
        ),
    )
    .await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let pipeline = create_pipeline(&config).await;

    let outcome = pipeline
        .crawler
        .crawl_hash(&WorkItem::root("QmD"), &pipeline.cancel)
        .await
        .expect("Crawl failed");
    assert_eq!(outcome, CrawlOutcome::Indexed);

    // One work item per queue
    let files = pipeline.broker.published(FILES);
    assert_eq!(files.len(), 1);
    assert_eq!(decode(&files[0].body), WorkItem::child("QmF1", "f1.txt", 100, "QmD"));
    assert_eq!(files[0].priority, 1);

    let directories = pipeline.broker.published(DIRECTORIES);
    assert_eq!(directories.len(), 1);
    assert_eq!(decode(&directories[0].body), WorkItem::child("QmD2", "d2", 200, "QmD"));

    // One directory record
    let writes = pipeline.index.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].item_type, "directory");
    assert_eq!(writes[0].hash, "QmD");
    assert_eq!(writes[0].properties["size"], 300);
    assert_eq!(writes[0].properties["links"][0]["hash"], "QmF1");
    assert_eq!(writes[0].properties["references"], json!([]));

    pipeline.cancel.cancel();
}

#[tokio::test]
async fn test_file_extraction_indexes_metadata() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ipfs/QmDir/report.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "x"})))
        .expect(1)
        .mount(&tika)
        .await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let pipeline = create_pipeline(&config).await;

    let item = WorkItem::child("QmF", "report.pdf", 5_000_000, "QmDir");
    let outcome = pipeline
        .crawler
        .crawl_file(&item, &pipeline.cancel)
        .await
        .expect("Crawl failed");
    assert_eq!(outcome, CrawlOutcome::Indexed);

    let writes = pipeline.index.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].item_type, "file");
    assert_eq!(writes[0].hash, "QmF");
    assert_eq!(
        Value::Object(writes[0].properties.clone()),
        json!({
            "title": "x",
            "size": 5_000_000,
            "references": [{"name": "report.pdf", "parent_hash": "QmDir"}]
        })
    );
}

#[tokio::test]
async fn test_extraction_retries_refused_connections() {
    let ipfs = MockServer::start().await;

    // Reserve a port and leave it closed so the first attempts are refused
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let mut config = create_test_config(&ipfs.uri(), &format!("http://{}", addr));
    config.crawler.retry_wait = 300;
    let pipeline = Arc::new(create_pipeline(&config).await);

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let item = WorkItem::child("QmF", "notes.txt", 12, "QmDir");
            pipeline.crawler.crawl_file(&item, &pipeline.cancel).await
        })
    };

    // Bring the extractor up once two attempts have been refused
    while pipeline.extractor.attempts() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let listener = std::net::TcpListener::bind(addr).unwrap();
    let tika = MockServer::builder().listener(listener).start().await;
    Mock::given(method("GET"))
        .and(path("/ipfs/QmDir/notes.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"language": "en"})))
        .expect(1)
        .mount(&tika)
        .await;

    let outcome = task.await.unwrap().expect("Crawl failed");
    assert_eq!(outcome, CrawlOutcome::Indexed);
    assert_eq!(pipeline.extractor.attempts(), 3);

    let writes = pipeline.index.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].properties["language"], "en");
}

#[tokio::test]
async fn test_known_hash_new_parent_only_patches_references() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    // Must never be listed again
    Mock::given(method("POST"))
        .and(path("/api/v0/file/ls"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&ipfs)
        .await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let pipeline = create_pipeline(&config).await;

    let mut stored = Properties::new();
    stored.insert("size".to_string(), json!(10));
    stored.insert(
        "references".to_string(),
        json!([{"name": "old", "parent_hash": "QmP1"}]),
    );
    pipeline.index.insert("directory", "QmKnown", stored).await;

    let item = WorkItem::child("QmKnown", "new", 10, "QmP2");
    let outcome = pipeline
        .crawler
        .crawl_hash(&item, &pipeline.cancel)
        .await
        .expect("Crawl failed");
    assert_eq!(outcome, CrawlOutcome::ReferenceUpdated);

    let writes = pipeline.index.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].item_type, "directory");
    assert_eq!(
        Value::Object(writes[0].properties.clone()),
        json!({
            "references": [
                {"name": "old", "parent_hash": "QmP1"},
                {"name": "new", "parent_hash": "QmP2"}
            ]
        })
    );

    // Merged into the existing record
    let (_, record) = pipeline.index.record("QmKnown").await.unwrap();
    assert_eq!(record["size"], 10);

    assert!(pipeline.broker.published(FILES).is_empty());
    assert!(pipeline.broker.published(DIRECTORIES).is_empty());
}

#[tokio::test]
async fn test_empty_and_partial_files_skip_extraction() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&tika)
        .await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let pipeline = create_pipeline(&config).await;

    let empty = WorkItem::child("QmEmpty", "empty.txt", 0, "QmDir");
    let outcome = pipeline
        .crawler
        .crawl_file(&empty, &pipeline.cancel)
        .await
        .expect("Crawl failed");
    assert_eq!(outcome, CrawlOutcome::Indexed);

    let partial = WorkItem {
        size: config.crawler.partial_size,
        ..WorkItem::root("QmChunk")
    };
    let outcome = pipeline
        .crawler
        .crawl_file(&partial, &pipeline.cancel)
        .await
        .expect("Crawl failed");
    assert_eq!(outcome, CrawlOutcome::SkippedPartial);

    let writes = pipeline.index.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].hash, "QmEmpty");
    assert_eq!(writes[0].properties["size"], 0);
}

#[tokio::test]
async fn test_oversized_file_is_rejected() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let pipeline = create_pipeline(&config).await;

    let item = WorkItem::child(
        "QmHuge",
        "disk.img",
        config.crawler.metadata_max_size + 1,
        "QmDir",
    );
    let err = pipeline
        .crawler
        .crawl_file(&item, &pipeline.cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, CrawlError::TooLarge { .. }));
    assert!(!err.is_terminal());
    assert!(pipeline.index.writes().await.is_empty());
    assert_eq!(pipeline.extractor.attempts(), 0);
}

/// Polls until `check` holds, failing the test after a few seconds
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {}", what);
}

#[tokio::test]
async fn test_workers_crawl_seeded_hash() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    mock_ls(
        &ipfs,
        "QmRoot",
        ls_body(
            "QmRoot",
            "Directory",
            64,
            json!([{"Name": "readme.md", "Hash": "QmReadme", "Size": 11, "Type": "File"}]),
        ),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/ipfs/QmRoot/readme.md"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "Readme"})))
        .mount(&tika)
        .await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let broker = MemoryBroker::new();
    let index = Arc::new(MemoryIndex::new());

    let seeded = seed(
        Arc::new(broker.clone()),
        &config.amqp,
        &["QmRoot".to_string()],
    )
    .await
    .expect("Seeding failed");
    assert_eq!(seeded, 1);
    assert_eq!(broker.published(DIRECTORIES)[0].priority, 9);

    let services = Services {
        broker: Arc::new(broker.clone()),
        filesystem: Arc::new(IpfsShell::new(&config.ipfs).unwrap()),
        index: index.clone(),
        extractor: Arc::new(
            TikaExtractor::new(
                &config.extractor,
                RetryPolicy::new(config.crawler.retry_interval()),
            )
            .unwrap(),
        ),
    };

    let cancel = CancellationToken::new();
    let runner = {
        let cancel = cancel.clone();
        let config = config.clone();
        tokio::spawn(async move { run_workers(&config, services, &cancel).await })
    };

    let watched = &broker;
    eventually("both items to be acked", || async move {
        watched.acked(DIRECTORIES) == 1 && watched.acked(FILES) == 1
    })
    .await;

    cancel.cancel();
    runner.await.unwrap().expect("Workers failed");

    let (directory_type, directory) = index.record("QmRoot").await.unwrap();
    assert_eq!(directory_type, "directory");
    assert_eq!(directory["size"], 64);

    let (file_type, file) = index.record("QmReadme").await.unwrap();
    assert_eq!(file_type, "file");
    assert_eq!(file["title"], "Readme");
    assert_eq!(
        file["references"],
        json!([{"name": "readme.md", "parent_hash": "QmRoot"}])
    );

    assert_eq!(broker.unacked(), 0);
    eventually("publisher connections to close", || async move {
        watched.open_connections() == 0
    })
    .await;
}

#[tokio::test]
async fn test_workers_stop_on_protocol_error() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v0/file/ls"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "Message": "proto: required field \"Hash\" not set",
            "Code": 0,
            "Type": "error"
        })))
        .mount(&ipfs)
        .await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let broker = MemoryBroker::new();
    let index = Arc::new(MemoryIndex::new());
    broker.inject(
        DIRECTORIES,
        serde_json::to_vec(&WorkItem::root("QmBroken")).unwrap(),
        9,
    );

    let services = Services {
        broker: Arc::new(broker.clone()),
        filesystem: Arc::new(IpfsShell::new(&config.ipfs).unwrap()),
        index: index.clone(),
        extractor: Arc::new(
            TikaExtractor::new(
                &config.extractor,
                RetryPolicy::new(config.crawler.retry_interval()),
            )
            .unwrap(),
        ),
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_workers(&config, services, &CancellationToken::new()),
    )
    .await
    .expect("Workers did not stop");

    let err = result.unwrap_err();
    assert!(matches!(err, CrawlError::Fatal { .. }));
    assert!(err.is_terminal());

    // Poison record written, delivery left for redelivery
    let (item_type, record) = index.record("QmBroken").await.unwrap();
    assert_eq!(item_type, "invalid");
    assert!(record["error"].as_str().unwrap().contains("proto"));
    assert_eq!(broker.ready(DIRECTORIES), 1);
}

#[tokio::test]
async fn test_undecodable_delivery_is_dropped() {
    let ipfs = MockServer::start().await;
    let tika = MockServer::start().await;

    let config = create_test_config(&ipfs.uri(), &tika.uri());
    let broker = MemoryBroker::new();
    broker.inject(FILES, b"not json".to_vec(), 1);

    let services = Services {
        broker: Arc::new(broker.clone()),
        filesystem: Arc::new(IpfsShell::new(&config.ipfs).unwrap()),
        index: Arc::new(MemoryIndex::new()),
        extractor: Arc::new(
            TikaExtractor::new(
                &config.extractor,
                RetryPolicy::new(config.crawler.retry_interval()),
            )
            .unwrap(),
        ),
    };

    let cancel = CancellationToken::new();
    let runner = {
        let cancel = cancel.clone();
        let config = config.clone();
        tokio::spawn(async move { run_workers(&config, services, &cancel).await })
    };

    let watched = &broker;
    eventually("the bad delivery to be acked", || async move {
        watched.acked(FILES) == 1
    })
    .await;

    cancel.cancel();
    runner.await.unwrap().expect("Workers failed");
    assert_eq!(broker.ready(FILES), 0);
}
