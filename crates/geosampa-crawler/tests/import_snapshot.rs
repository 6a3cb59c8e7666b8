use std::time::Duration;

use async_trait::async_trait;
use geosampa_crawler::{import_snapshot, CrawlError, CrawlFilter, FolderListing, ImportSummary, Level};
use geosampa_storage::{read_sidecar, BackoffPolicy, HttpClientConfig, HttpFetcher, SnapshotStore};

/// Two files under one layer, plus a theme whose listing is broken.
struct FixedTree;

#[async_trait]
impl FolderListing for FixedTree {
    fn host(&self) -> &str {
        // discard port; every download fails fast
        "http://127.0.0.1:9"
    }

    async fn list_sub_folders(&self, level: Level, folder_path: &str) -> Result<Vec<String>, CrawlError> {
        match folder_path {
            "TEMAS" => Ok(vec!["01_Cartografia".into(), "02_Quebrado".into()]),
            "01_Cartografia" => Ok(vec!["Quadras".into()]),
            "01_Cartografia//Quadras//" => Ok(vec!["SHP".into()]),
            other => Err(CrawlError::Protocol {
                level,
                folder: other.to_string(),
                detail: "field \"d\" is missing".into(),
            }),
        }
    }

    async fn list_files(&self, folder_path: &str) -> Result<Vec<String>, CrawlError> {
        assert_eq!(folder_path, "01_Cartografia//Quadras//SHP");
        Ok(vec!["a.zip".into(), "b.zip".into()])
    }
}

fn offline_fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(2),
        user_agent: None,
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
    })
    .expect("client")
}

#[tokio::test]
async fn import_counts_failures_and_keeps_existing_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(dir.path()).await.expect("open store");
    let existing = dir.path().join("01_cartografia-quadras-shp-a.zip");
    std::fs::write(&existing, b"zip bytes").unwrap();

    let summary = import_snapshot(&FixedTree, &store, &offline_fetcher(), &CrawlFilter::default()).await;

    assert_eq!(
        summary,
        ImportSummary {
            discovered: 2,
            downloaded: 0,
            already_present: 1,
            failed: 1,
            crawl_errors: 1,
        }
    );

    let sidecar = read_sidecar(&SnapshotStore::sidecar_path(&existing)).await.unwrap();
    assert_eq!(sidecar.file, "a.zip");
    assert_eq!(sidecar.layer, "SHP");
    assert!(sidecar.link.ends_with("&arq=01_Cartografia%5C%5CQuadras%5C%5CSHP%5C%5Ca"));

    assert!(!dir.path().join("01_cartografia-quadras-shp-b.zip").exists());
    assert!(!dir.path().join("01_cartografia-quadras-shp-b.zip.meta.json").exists());
}

#[tokio::test]
async fn theme_filter_skips_broken_sibling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(dir.path()).await.expect("open store");
    let filter = CrawlFilter {
        theme: Some("01_Cartografia".into()),
        sub_theme: None,
    };

    let summary = import_snapshot(&FixedTree, &store, &offline_fetcher(), &filter).await;
    assert_eq!(summary.crawl_errors, 0);
    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.failed, 2);
}
