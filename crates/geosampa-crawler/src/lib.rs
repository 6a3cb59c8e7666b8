//! GeoSampa folder-tree crawler, download URL encoder and snapshot import driver.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::{pin_mut, Stream, StreamExt};
use geosampa_core::{encode_latin1, ErrorKind, FileDescriptor};
use geosampa_storage::{FetchError, HttpClientConfig, HttpFetcher, SnapshotStore};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const DEFAULT_HOST: &str = "http://geosampa.prefeitura.sp.gov.br";

/// Folder listed to enumerate themes.
pub const ROOT_FOLDER: &str = "TEMAS";

const SUB_FOLDERS_ENDPOINT: &str = "/PaginasPublicas/_SBC.aspx/pesquisaSubPastas";
const FILES_ENDPOINT: &str = "/PaginasPublicas/_SBC.aspx/pesquisaArquivos";
const DOWNLOAD_ENDPOINT: &str = "/PaginasPublicas/downloadArquivoOL.aspx";

/// Characters left literal in query values; everything else (including `/`) is escaped.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

static FOLDER_COUNT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":[0-9]+$").expect("valid suffix regex"));
static LEGACY_EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[a-z]{3}").expect("valid extension regex"));

/// Depth of the remote hierarchy a listing call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Themes,
    SubThemes,
    Layers,
    Files,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Level::Themes => "themes",
            Level::SubThemes => "sub-themes",
            Level::Layers => "layers",
            Level::Files => "files",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("listing {level} of {folder:?} failed: {source}")]
    Network {
        level: Level,
        folder: String,
        #[source]
        source: FetchError,
    },
    #[error("listing {level} of {folder:?} returned an unexpected payload: {detail}")]
    Protocol {
        level: Level,
        folder: String,
        detail: String,
    },
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Network { .. } => ErrorKind::Network,
            CrawlError::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            CrawlError::Network { level, .. } | CrawlError::Protocol { level, .. } => *level,
        }
    }
}

/// The two folder-listing calls the portal exposes.
#[async_trait]
pub trait FolderListing: Send + Sync {
    /// Base URL used to build download links.
    fn host(&self) -> &str;

    async fn list_sub_folders(&self, level: Level, folder_path: &str) -> Result<Vec<String>, CrawlError>;

    async fn list_files(&self, folder_path: &str) -> Result<Vec<String>, CrawlError>;
}

/// HTTP implementation of [`FolderListing`] against a live portal.
#[derive(Debug, Clone)]
pub struct GeoSampaClient {
    host: String,
    http: HttpFetcher,
}

impl GeoSampaClient {
    pub fn new(host: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn fetch_listing(
        &self,
        endpoint: &str,
        level: Level,
        folder_path: &str,
    ) -> Result<String, CrawlError> {
        let url = format!("{}{}", self.host, endpoint);
        let body = serde_json::json!({ "pNomePasta": folder_path });
        let network = |source: FetchError| CrawlError::Network {
            level,
            folder: folder_path.to_string(),
            source,
        };

        let response = self
            .http
            .send("listing", |client| client.post(&url).json(&body))
            .await
            .map_err(network)?;
        let text = response
            .text()
            .await
            .map_err(|err| network(FetchError::Request(err)))?;
        let value: JsonValue = serde_json::from_str(&text).map_err(|err| CrawlError::Protocol {
            level,
            folder: folder_path.to_string(),
            detail: format!("invalid JSON: {err}"),
        })?;
        listing_field(&value)
            .map(ToString::to_string)
            .map_err(|detail| CrawlError::Protocol {
                level,
                folder: folder_path.to_string(),
                detail,
            })
    }
}

#[async_trait]
impl FolderListing for GeoSampaClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_sub_folders(&self, level: Level, folder_path: &str) -> Result<Vec<String>, CrawlError> {
        let raw = self
            .fetch_listing(SUB_FOLDERS_ENDPOINT, level, folder_path)
            .await?;
        Ok(parse_sub_folders(&raw))
    }

    async fn list_files(&self, folder_path: &str) -> Result<Vec<String>, CrawlError> {
        let raw = self
            .fetch_listing(FILES_ENDPOINT, Level::Files, folder_path)
            .await?;
        Ok(parse_files(&raw))
    }
}

/// Extract the pipe-delimited `d` field of a listing response.
pub fn listing_field(value: &JsonValue) -> Result<&str, String> {
    match value.get("d") {
        Some(JsonValue::String(d)) => Ok(d),
        Some(other) => Err(format!("field \"d\" is not a string: {other}")),
        None => Err("field \"d\" is missing".to_string()),
    }
}

/// Folder names with empty segments dropped and the `:<count>` suffix removed.
pub fn parse_sub_folders(raw: &str) -> Vec<String> {
    raw.split('|')
        .filter(|s| !s.is_empty())
        .map(|s| FOLDER_COUNT_SUFFIX.replace(s, "").into_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn parse_files(raw: &str) -> Vec<String> {
    raw.split('|')
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Listing path for the layers of a sub-theme. The trailing separator is expected by the portal.
pub fn layer_listing_path(theme: &str, sub_theme: &str) -> String {
    format!("{theme}//{sub_theme}//")
}

pub fn file_listing_path(theme: &str, sub_theme: &str, layer: &str) -> String {
    format!("{theme}//{sub_theme}//{layer}")
}

/// File name as the download server expects it: every `.xxx` lowercase extension removed.
pub fn legacy_file_stem(file: &str) -> String {
    LEGACY_EXTENSION.replace_all(file, "").into_owned()
}

/// Path embedded in a download URL; segments are joined by a literal double backslash.
pub fn download_path(theme: &str, sub_theme: &str, layer: &str, file: &str) -> String {
    let stem = legacy_file_stem(file);
    format!("{theme}\\\\{sub_theme}\\\\{layer}\\\\{stem}")
}

/// Compatibility shim for the GeoSampa download server, which decodes `arq` as Latin-1.
///
/// Paths that cannot be represented in Latin-1 are passed through as UTF-8.
pub fn encode_legacy_path(path: &str) -> Vec<u8> {
    encode_latin1(path).unwrap_or_else(|| path.as_bytes().to_vec())
}

pub fn download_url(host: &str, theme: &str, sub_theme: &str, layer: &str, file: &str) -> String {
    let path = encode_legacy_path(&download_path(theme, sub_theme, layer, file));
    format!(
        "{}{}?orig=DownloadCamadas&arqTipo={}&arq={}",
        host.trim_end_matches('/'),
        DOWNLOAD_ENDPOINT,
        percent_encode(layer.as_bytes(), QUERY_VALUE),
        percent_encode(&path, QUERY_VALUE),
    )
}

/// Exact-name restriction on the first two levels of the walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlFilter {
    pub theme: Option<String>,
    pub sub_theme: Option<String>,
}

impl CrawlFilter {
    pub fn accepts_theme(&self, theme: &str) -> bool {
        self.theme.as_deref().map_or(true, |t| t == theme)
    }

    pub fn accepts_sub_theme(&self, sub_theme: &str) -> bool {
        self.sub_theme.as_deref().map_or(true, |s| s == sub_theme)
    }
}

/// Walk themes → sub-themes → layers → files, yielding one descriptor at a time.
///
/// A failed listing yields its error and the walk moves on to the next sibling;
/// a failed root listing ends the stream. Every call restarts from the root.
pub fn crawl<'a, L>(
    listing: &'a L,
    filter: &'a CrawlFilter,
) -> impl Stream<Item = Result<FileDescriptor, CrawlError>> + 'a
where
    L: FolderListing + ?Sized,
{
    stream! {
        let themes = match listing.list_sub_folders(Level::Themes, ROOT_FOLDER).await {
            Ok(themes) => themes,
            Err(err) => {
                yield Err(err);
                Vec::new()
            }
        };

        for theme in themes.into_iter().filter(|t| filter.accepts_theme(t)) {
            let sub_themes = match listing.list_sub_folders(Level::SubThemes, &theme).await {
                Ok(sub_themes) => sub_themes,
                Err(err) => {
                    yield Err(err);
                    continue;
                }
            };

            for sub_theme in sub_themes.into_iter().filter(|s| filter.accepts_sub_theme(s)) {
                let layers = match listing
                    .list_sub_folders(Level::Layers, &layer_listing_path(&theme, &sub_theme))
                    .await
                {
                    Ok(layers) => layers,
                    Err(err) => {
                        yield Err(err);
                        continue;
                    }
                };

                for layer in layers {
                    let files = match listing
                        .list_files(&file_listing_path(&theme, &sub_theme, &layer))
                        .await
                    {
                        Ok(files) => files,
                        Err(err) => {
                            yield Err(err);
                            continue;
                        }
                    };

                    for file in files {
                        let link = download_url(listing.host(), &theme, &sub_theme, &layer, &file);
                        yield Ok(FileDescriptor {
                            theme: theme.clone(),
                            sub_theme: sub_theme.clone(),
                            layer: layer.clone(),
                            file,
                            link,
                        });
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub host: String,
    pub output: PathBuf,
    pub filter: CrawlFilter,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("GEOSAMPA_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            output: std::env::var("GEOSAMPA_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./")),
            filter: CrawlFilter {
                theme: std::env::var("GEOSAMPA_THEME").ok().filter(|v| !v.is_empty()),
                sub_theme: std::env::var("GEOSAMPA_SUB_THEME").ok().filter(|v| !v.is_empty()),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub discovered: usize,
    pub downloaded: usize,
    pub already_present: usize,
    pub failed: usize,
    pub crawl_errors: usize,
}

/// Crawl the portal and mirror every descriptor into `store`. Per-file failures are counted, not raised.
pub async fn import_snapshot<L>(
    listing: &L,
    store: &SnapshotStore,
    http: &HttpFetcher,
    filter: &CrawlFilter,
) -> ImportSummary
where
    L: FolderListing + ?Sized,
{
    let mut summary = ImportSummary::default();
    let descriptors = crawl(listing, filter);
    pin_mut!(descriptors);

    while let Some(item) = descriptors.next().await {
        let descriptor = match item {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(level = %err.level(), kind = %err.kind(), error = %err, "crawl branch skipped");
                summary.crawl_errors += 1;
                continue;
            }
        };
        summary.discovered += 1;

        let span = info_span!("import_file", theme = %descriptor.theme, sub_theme = %descriptor.sub_theme, file = %descriptor.file);
        match store.store_descriptor(http, &descriptor).instrument(span).await {
            Ok(stored) if stored.already_present => summary.already_present += 1,
            Ok(stored) => {
                info!(
                    path = %stored.artifact_path.display(),
                    bytes = stored.byte_size,
                    sha256 = stored.content_hash.as_deref().unwrap_or_default(),
                    "downloaded"
                );
                summary.downloaded += 1;
            }
            Err(err) => {
                warn!(file = %descriptor.file, kind = %err.kind(), error = %err, "download failed");
                summary.failed += 1;
            }
        }
    }

    summary
}

pub async fn run_import(config: ImportConfig, http_config: HttpClientConfig) -> Result<ImportSummary> {
    let output = if config.output.is_absolute() {
        config.output.clone()
    } else {
        std::env::current_dir()
            .context("resolving current directory")?
            .join(&config.output)
    };
    let store = SnapshotStore::open(&output)
        .await
        .with_context(|| format!("opening snapshot directory {}", output.display()))?;
    let http = HttpFetcher::new(http_config)?;
    let client = GeoSampaClient::new(config.host.clone(), http.clone());

    info!(host = %config.host, output = %output.display(), "starting import");
    Ok(import_snapshot(&client, &store, &http, &config.filter).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubTree {
        folders: HashMap<String, Vec<String>>,
        files: HashMap<String, Vec<String>>,
        broken: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl StubTree {
        fn folder(mut self, path: &str, children: &[&str]) -> Self {
            self.folders
                .insert(path.to_string(), children.iter().map(|s| s.to_string()).collect());
            self
        }

        fn files(mut self, path: &str, names: &[&str]) -> Self {
            self.files
                .insert(path.to_string(), names.iter().map(|s| s.to_string()).collect());
            self
        }

        fn broken(mut self, path: &str) -> Self {
            self.broken.push(path.to_string());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn answer(
            &self,
            level: Level,
            path: &str,
            map: &HashMap<String, Vec<String>>,
        ) -> Result<Vec<String>, CrawlError> {
            self.calls.lock().unwrap().push(path.to_string());
            if self.broken.iter().any(|b| b == path) {
                return Err(CrawlError::Protocol {
                    level,
                    folder: path.to_string(),
                    detail: "field \"d\" is missing".to_string(),
                });
            }
            Ok(map.get(path).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl FolderListing for StubTree {
        fn host(&self) -> &str {
            "http://stub"
        }

        async fn list_sub_folders(&self, level: Level, folder_path: &str) -> Result<Vec<String>, CrawlError> {
            self.answer(level, folder_path, &self.folders)
        }

        async fn list_files(&self, folder_path: &str) -> Result<Vec<String>, CrawlError> {
            self.answer(Level::Files, folder_path, &self.files)
        }
    }

    fn single_file_tree() -> StubTree {
        StubTree::default()
            .folder("TEMAS", &["A"])
            .folder("A", &["B"])
            .folder("A//B//", &["L"])
            .files("A//B//L", &["f.zip"])
    }

    #[test]
    fn sub_folder_listing_strips_counts_and_empty_segments() {
        assert_eq!(parse_sub_folders("a:1|b|"), vec!["a", "b"]);
        assert_eq!(parse_sub_folders("||01_Cartografia:42|"), vec!["01_Cartografia"]);
        assert_eq!(parse_files("x.zip|y:1.zip|"), vec!["x.zip", "y:1.zip"]);
    }

    #[test]
    fn listing_field_rejects_missing_or_non_string_payloads() {
        let ok = serde_json::json!({ "d": "a|b" });
        assert_eq!(listing_field(&ok).unwrap(), "a|b");
        assert!(listing_field(&serde_json::json!({ "Message": "err" })).is_err());
        assert!(listing_field(&serde_json::json!({ "d": null })).is_err());
    }

    #[tokio::test]
    async fn crawl_walks_exactly_four_levels() {
        let tree = single_file_tree();
        let filter = CrawlFilter::default();
        let found: Vec<FileDescriptor> = crawl(&tree, &filter).try_collect().await.unwrap();

        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(
            (d.theme.as_str(), d.sub_theme.as_str(), d.layer.as_str(), d.file.as_str()),
            ("A", "B", "L", "f.zip")
        );
        assert_eq!(
            d.link,
            "http://stub/PaginasPublicas/downloadArquivoOL.aspx?orig=DownloadCamadas&arqTipo=L&arq=A%5C%5CB%5C%5CL%5C%5Cf"
        );
        assert_eq!(tree.calls(), vec!["TEMAS", "A", "A//B//", "A//B//L"]);
    }

    #[tokio::test]
    async fn crawl_restarts_from_root_each_time() {
        let tree = single_file_tree();
        let filter = CrawlFilter::default();
        let first: Vec<_> = crawl(&tree, &filter).try_collect().await.unwrap();
        let second: Vec<_> = crawl(&tree, &filter).try_collect().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(tree.calls().iter().filter(|c| *c == "TEMAS").count(), 2);
    }

    #[tokio::test]
    async fn failed_branch_is_reported_and_siblings_continue() {
        let tree = StubTree::default()
            .folder("TEMAS", &["A", "C"])
            .broken("A")
            .folder("C", &["D"])
            .folder("C//D//", &["L"])
            .files("C//D//L", &["g.zip"]);
        let filter = CrawlFilter::default();
        let items: Vec<_> = crawl(&tree, &filter).collect().await;

        assert_eq!(items.len(), 2);
        let err = items[0].as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.level(), Level::SubThemes);
        assert_eq!(items[1].as_ref().unwrap().file, "g.zip");
    }

    #[tokio::test]
    async fn failed_root_listing_ends_the_walk() {
        let tree = StubTree::default().broken("TEMAS");
        let filter = CrawlFilter::default();
        let items: Vec<_> = crawl(&tree, &filter).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().level(), Level::Themes);
    }

    #[tokio::test]
    async fn filters_prune_unselected_branches() {
        let tree = StubTree::default()
            .folder("TEMAS", &["A", "Z"])
            .folder("A", &["B", "X"])
            .folder("A//B//", &["L"])
            .files("A//B//L", &["f.zip"])
            .folder("Z", &["B"]);
        let filter = CrawlFilter {
            theme: Some("A".into()),
            sub_theme: Some("B".into()),
        };
        let found: Vec<_> = crawl(&tree, &filter).try_collect().await.unwrap();
        assert_eq!(found.len(), 1);
        let calls = tree.calls();
        assert!(!calls.iter().any(|c| c == "Z"));
        assert!(!calls.iter().any(|c| c.starts_with("A//X")));
    }

    #[test]
    fn legacy_stem_removes_lowercase_three_letter_extensions() {
        assert_eq!(legacy_file_stem("a.zip"), "a");
        assert_eq!(legacy_file_stem("quadra.shp.zip"), "quadra");
        assert_eq!(legacy_file_stem("MAPA.ZIP"), "MAPA.ZIP");
    }

    #[test]
    fn download_url_uses_latin1_when_possible() {
        let url = download_url("http://h/", "Educação", "Escolas", "SHP", "rede.zip");
        assert!(url.starts_with("http://h/PaginasPublicas/downloadArquivoOL.aspx?"));
        assert!(url.ends_with("&arq=Educa%E7%E3o%5C%5CEscolas%5C%5CSHP%5C%5Crede"));
    }

    #[test]
    fn download_url_falls_back_to_utf8_outside_latin1() {
        let url = download_url("http://h", "Zona \u{2013} Sul", "S", "Shape File", "a/b.zip");
        assert!(url.contains("&arqTipo=Shape%20File&"));
        assert!(url.ends_with(
            "&arq=Zona%20%E2%80%93%20Sul%5C%5CS%5C%5CShape%20File%5C%5Ca%2Fb"
        ));
    }

    #[test]
    fn listing_paths_keep_forward_double_slashes() {
        assert_eq!(layer_listing_path("T", "S"), "T//S//");
        assert_eq!(file_listing_path("T", "S", "L"), "T//S//L");
        assert_eq!(download_path("T", "S", "L", "f.zip"), "T\\\\S\\\\L\\\\f");
    }
}
