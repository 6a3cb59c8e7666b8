//! Idempotent synchronization of a local GeoSampa snapshot into a CKAN catalog.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geosampa_core::{ErrorKind, FileDescriptor, PackageIdentity};
use geosampa_storage::{
    read_sidecar, FetchError, HttpClientConfig, HttpFetcher, SnapshotEntry, SnapshotStore,
    StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod ckan;

pub use ckan::{form_fields, CkanClient};

pub const PACKAGE_NOTES: &str =
    "Conjunto de dados extraido automaticamente de http://geosampa.prefeitura.sp.gov.br/";
pub const PACKAGE_AUTHOR: &str = "GeoSampa";
pub const PACKAGE_AUTHOR_EMAIL: &str = "geosampa@prefeitura.sp.gov.br";
pub const PACKAGE_SOURCE: &str = "http://geosampa.prefeitura.sp.gov.br/";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catalog request {action} failed: {source}")]
    Transport {
        action: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("catalog response to {action} was malformed: {detail}")]
    Protocol {
        action: &'static str,
        detail: String,
    },
    #[error("catalog rejected {action}: {detail}")]
    Rejected {
        action: &'static str,
        detail: String,
    },
    #[error("organization {0:?} not found in the catalog")]
    UnknownOrganization(String),
    #[error("missing setting: {0}")]
    MissingSetting(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport { .. } => ErrorKind::Network,
            SyncError::Protocol { .. } => ErrorKind::Protocol,
            SyncError::Rejected { .. }
            | SyncError::UnknownOrganization(_)
            | SyncError::MissingSetting(_) => ErrorKind::Catalog,
            SyncError::Store(err) => err.kind(),
        }
    }

    /// The request may or may not have been applied by the catalog.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// A dataset as returned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub title: String,
    pub notes: String,
    pub owner_org: String,
    pub private: bool,
    pub author: String,
    pub author_email: String,
    pub source: String,
    pub tags: Vec<TagRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub package_id: String,
    pub url: String,
    pub name: String,
    pub format: String,
    pub mimetype: Option<String>,
    pub cache_url: String,
    pub hash: String,
}

/// The subset of the CKAN action API used by the synchronizer.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn organization_list(&self) -> Result<Vec<Organization>, SyncError>;

    /// Packages matching `name:<name>`; the catalog may return loose matches.
    async fn package_search(&self, name: &str) -> Result<Vec<Package>, SyncError>;

    async fn package_create(&self, payload: &PackagePayload) -> Result<Package, SyncError>;

    async fn package_patch(&self, payload: &PackagePayload) -> Result<Package, SyncError>;

    async fn resource_search(&self, hash: &str) -> Result<Vec<Resource>, SyncError>;

    async fn resource_create(
        &self,
        payload: &ResourcePayload,
        upload: &Path,
    ) -> Result<Resource, SyncError>;

    async fn resource_patch(
        &self,
        payload: &ResourcePayload,
        upload: &Path,
    ) -> Result<Resource, SyncError>;
}

/// Supplies the catalog API key.
pub trait CredentialProvider: Send + Sync {
    fn api_key(&self) -> Result<String, SyncError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    api_key: Option<String>,
}

impl StaticCredentials {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn api_key(&self) -> Result<String, SyncError> {
        self.api_key
            .clone()
            .ok_or(SyncError::MissingSetting("CKAN API key (--api-key or CKAN_API_KEY)"))
    }
}

/// Chooses the organization that will own created packages.
#[async_trait]
pub trait OrganizationResolver: Send + Sync {
    async fn resolve(&self, available: &[Organization]) -> Result<Organization, SyncError>;
}

#[derive(Debug, Clone, Default)]
pub struct NamedOrganization {
    name: Option<String>,
}

impl NamedOrganization {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name: name.filter(|n| !n.is_empty()),
        }
    }
}

#[async_trait]
impl OrganizationResolver for NamedOrganization {
    async fn resolve(&self, available: &[Organization]) -> Result<Organization, SyncError> {
        let name = self.name.as_deref().ok_or(SyncError::MissingSetting(
            "CKAN organization (--organization or CKAN_ORGANIZATION)",
        ))?;
        available
            .iter()
            .find(|org| org.name == name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownOrganization(name.to_string()))
    }
}

/// Packages resolved so far in one synchronization run, keyed by slug.
#[derive(Debug, Default)]
pub struct PackageCache {
    entries: HashMap<String, Package>,
}

impl PackageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slug: &str) -> Option<&Package> {
        self.entries.get(slug)
    }

    pub fn insert(&mut self, slug: impl Into<String>, package: Package) {
        self.entries.insert(slug.into(), package);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageResolution {
    Cached,
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Synced {
        package: PackageResolution,
        resource: ResourceAction,
    },
    OrphanRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub sidecar: String,
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub organization: String,
    pub sidecars: usize,
    pub packages_created: usize,
    pub packages_updated: usize,
    pub resources_created: usize,
    pub resources_updated: usize,
    pub orphans_removed: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncRunSummary {
    fn new(organization: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            organization: organization.to_string(),
            sidecars: 0,
            packages_created: 0,
            packages_updated: 0,
            resources_created: 0,
            resources_updated: 0,
            orphans_removed: 0,
            failures: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.resources_created + self.resources_updated
    }

    pub fn skipped(&self) -> usize {
        self.orphans_removed
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, entry: &SnapshotEntry, outcome: Result<FileOutcome, SyncError>) {
        self.sidecars += 1;
        match outcome {
            Ok(FileOutcome::Synced { package, resource }) => {
                match package {
                    PackageResolution::Created => self.packages_created += 1,
                    PackageResolution::Updated => self.packages_updated += 1,
                    PackageResolution::Cached => {}
                }
                match resource {
                    ResourceAction::Created => self.resources_created += 1,
                    ResourceAction::Updated => self.resources_updated += 1,
                }
            }
            Ok(FileOutcome::OrphanRemoved) => self.orphans_removed += 1,
            Err(err) => {
                warn!(sidecar = %entry.sidecar_path.display(), kind = %err.kind(), error = %err, "sync failed");
                self.failures.push(SyncFailure {
                    sidecar: entry.sidecar_path.display().to_string(),
                    kind: err.kind(),
                    detail: err.to_string(),
                });
            }
        }
    }
}

/// Reconciles snapshot entries against the catalog on behalf of one organization.
pub struct CatalogSynchronizer<'a, C: CatalogClient + ?Sized> {
    catalog: &'a C,
    organization: Organization,
    public: bool,
}

impl<'a, C: CatalogClient + ?Sized> CatalogSynchronizer<'a, C> {
    /// Resolve the owning organization and build a synchronizer for it.
    pub async fn connect(
        catalog: &'a C,
        resolver: &dyn OrganizationResolver,
        public: bool,
    ) -> Result<Self, SyncError> {
        let organizations = catalog.organization_list().await?;
        let organization = resolver.resolve(&organizations).await?;
        info!(organization = %organization.name, public, "organization resolved");
        Ok(Self {
            catalog,
            organization,
            public,
        })
    }

    pub fn organization(&self) -> &Organization {
        &self.organization
    }

    pub fn package_payload(&self, identity: &PackageIdentity) -> PackagePayload {
        PackagePayload {
            id: None,
            name: identity.slug.clone(),
            title: identity.title.clone(),
            notes: PACKAGE_NOTES.to_string(),
            owner_org: self.organization.id.clone(),
            private: !self.public,
            author: PACKAGE_AUTHOR.to_string(),
            author_email: PACKAGE_AUTHOR_EMAIL.to_string(),
            source: PACKAGE_SOURCE.to_string(),
            tags: identity
                .tags()
                .into_iter()
                .map(|name| TagRef { name })
                .collect(),
        }
    }

    pub fn resource_payload(
        package: &Package,
        identity: &PackageIdentity,
        descriptor: &FileDescriptor,
    ) -> ResourcePayload {
        ResourcePayload {
            id: None,
            package_id: package.id.clone(),
            url: descriptor.link.clone(),
            name: descriptor.file.clone(),
            format: descriptor.layer.clone(),
            mimetype: descriptor
                .file
                .ends_with(".zip")
                .then(|| "application/zip".to_string()),
            cache_url: descriptor.link.clone(),
            hash: identity.resource_hash(&descriptor.file),
        }
    }

    /// Cache, else exact-name search + patch, else create.
    ///
    /// A create that fails without a confirmed outcome is followed by a second
    /// search, and an entry found there is adopted instead of reported.
    pub async fn resolve_package(
        &self,
        cache: &mut PackageCache,
        identity: &PackageIdentity,
    ) -> Result<(Package, PackageResolution), SyncError> {
        if let Some(package) = cache.get(&identity.slug) {
            return Ok((package.clone(), PackageResolution::Cached));
        }

        let mut payload = self.package_payload(identity);
        let (package, resolution) = match self.find_package(&identity.slug).await? {
            Some(found) => {
                payload.id = Some(found.id);
                let package = self.catalog.package_patch(&payload).await?;
                (package, PackageResolution::Updated)
            }
            None => match self.catalog.package_create(&payload).await {
                Ok(package) => (package, PackageResolution::Created),
                Err(err) if err.outcome_unknown() => {
                    warn!(slug = %identity.slug, error = %err, "package create unconfirmed, searching again");
                    let found = self.find_package(&identity.slug).await?.ok_or(err)?;
                    (found, PackageResolution::Created)
                }
                Err(err) => return Err(err),
            },
        };
        info!(slug = %identity.slug, ?resolution, "package resolved");

        cache.insert(identity.slug.clone(), package.clone());
        Ok((package, resolution))
    }

    /// Upsert the resource identified by `sha1(slug ++ file)` and upload the artifact.
    pub async fn resolve_resource(
        &self,
        package: &Package,
        identity: &PackageIdentity,
        descriptor: &FileDescriptor,
        artifact: &Path,
    ) -> Result<(Resource, ResourceAction), SyncError> {
        let mut payload = Self::resource_payload(package, identity, descriptor);
        match self.find_resource(&payload.hash).await? {
            Some(found) => {
                payload.id = Some(found.id);
                let resource = self.catalog.resource_patch(&payload, artifact).await?;
                Ok((resource, ResourceAction::Updated))
            }
            None => match self.catalog.resource_create(&payload, artifact).await {
                Ok(resource) => Ok((resource, ResourceAction::Created)),
                Err(err) if err.outcome_unknown() => {
                    warn!(hash = %payload.hash, error = %err, "resource create unconfirmed, searching again");
                    let found = self.find_resource(&payload.hash).await?.ok_or(err)?;
                    Ok((found, ResourceAction::Created))
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Exact-name match; the catalog's `name:` query also returns near matches.
    async fn find_package(&self, slug: &str) -> Result<Option<Package>, SyncError> {
        Ok(self
            .catalog
            .package_search(slug)
            .await?
            .into_iter()
            .find(|p| p.name == slug))
    }

    async fn find_resource(&self, hash: &str) -> Result<Option<Resource>, SyncError> {
        Ok(self
            .catalog
            .resource_search(hash)
            .await?
            .into_iter()
            .find(|r| r.hash.as_deref() == Some(hash)))
    }

    async fn sync_entry(
        &self,
        store: &SnapshotStore,
        cache: &mut PackageCache,
        entry: &SnapshotEntry,
    ) -> Result<FileOutcome, SyncError> {
        if !entry.artifact_present {
            warn!(
                artifact = %entry.artifact_path.display(),
                "artifact not found, deleting its metadata file"
            );
            store.remove_sidecar(entry).await?;
            return Ok(FileOutcome::OrphanRemoved);
        }

        let descriptor = read_sidecar(&entry.sidecar_path).await?;
        let identity = PackageIdentity::for_descriptor(&descriptor);
        let (package, package_resolution) = self.resolve_package(cache, &identity).await?;
        let (resource, resource_action) = self
            .resolve_resource(&package, &identity, &descriptor, &entry.artifact_path)
            .await?;
        info!(package = %package.name, resource = %resource.id, ?resource_action, "resource synced");

        Ok(FileOutcome::Synced {
            package: package_resolution,
            resource: resource_action,
        })
    }

    /// One full pass over the snapshot. Per-file failures land in the summary.
    pub async fn run(&self, store: &SnapshotStore) -> Result<SyncRunSummary, SyncError> {
        let mut summary = SyncRunSummary::new(&self.organization.name);
        let entries = store.scan().await?;
        let mut cache = PackageCache::new();

        for entry in &entries {
            let span = info_span!("sync_file", run_id = %summary.run_id, sidecar = %entry.sidecar_path.display());
            let outcome = self.sync_entry(store, &mut cache, entry).instrument(span).await;
            summary.record(entry, outcome);
        }

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            packages = cache.len(),
            "sync run finished"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub input: PathBuf,
    pub site: Option<String>,
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub public: bool,
}

impl ExportConfig {
    pub fn from_env() -> Self {
        Self {
            input: std::env::var("GEOSAMPA_INPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./")),
            site: std::env::var("CKAN_SITE").ok().filter(|v| !v.is_empty()),
            api_key: std::env::var("CKAN_API_KEY").ok().filter(|v| !v.is_empty()),
            organization: std::env::var("CKAN_ORGANIZATION").ok().filter(|v| !v.is_empty()),
            public: std::env::var("CKAN_PUBLIC")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

/// Export the snapshot at `config.input` into the configured CKAN site.
pub async fn run_export(
    config: ExportConfig,
    http_config: HttpClientConfig,
    credentials: &dyn CredentialProvider,
    resolver: &dyn OrganizationResolver,
) -> Result<SyncRunSummary> {
    let input = if config.input.is_absolute() {
        config.input.clone()
    } else {
        std::env::current_dir()
            .context("resolving current directory")?
            .join(&config.input)
    };
    let store = SnapshotStore::open(&input)
        .await
        .with_context(|| format!("opening snapshot directory {}", input.display()))?;
    let site = config
        .site
        .clone()
        .ok_or(SyncError::MissingSetting("CKAN site (--site or CKAN_SITE)"))?;
    let api_key = credentials.api_key()?;

    let client = CkanClient::new(site.clone(), api_key, HttpFetcher::new(http_config)?);
    let synchronizer = CatalogSynchronizer::connect(&client, resolver, config.public)
        .await
        .with_context(|| format!("resolving organization on {site}"))?;
    info!(site = %site, input = %input.display(), "starting export");
    Ok(synchronizer.run(&store).await?)
}
