//! CKAN action API implementation of [`CatalogClient`].

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use geosampa_storage::{FetchError, HttpFetcher, StoreError};
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::fs;
use tracing::debug;

use crate::{
    CatalogClient, Organization, Package, PackagePayload, Resource, ResourcePayload, SyncError,
};

#[derive(Debug, Deserialize)]
struct ActionResponse<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct SearchResult<T> {
    #[allow(dead_code)]
    count: usize,
    results: Vec<T>,
}

/// Whether a call may be resent after a transient failure.
///
/// Creates are sent once: the catalog may have stored the entry even when the
/// response is lost, and a resend would store it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Retried,
    Once,
}

#[derive(Debug, Clone)]
pub struct CkanClient {
    site: String,
    api_key: String,
    http: HttpFetcher,
}

impl CkanClient {
    pub fn new(site: impl Into<String>, api_key: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            site: site.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    pub fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{}", self.site, action)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        action: &'static str,
        delivery: Delivery,
        body: &JsonValue,
    ) -> Result<T, SyncError> {
        let url = self.action_url(action);
        debug!(action, ?delivery, "catalog call");
        let build = |client: &reqwest::Client| {
            client
                .post(&url)
                .header(AUTHORIZATION, self.api_key.as_str())
                .json(body)
        };
        let result = match delivery {
            Delivery::Retried => self.http.send(action, build).await,
            Delivery::Once => self.http.send_once(action, build).await,
        };
        decode_response(action, result).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        action: &'static str,
        delivery: Delivery,
        fields: Vec<(String, String)>,
        upload: &Path,
    ) -> Result<T, SyncError> {
        let url = self.action_url(action);
        let bytes = Bytes::from(fs::read(upload).await.map_err(|source| StoreError::Io {
            path: upload.to_path_buf(),
            source,
        })?);
        let length = bytes.len() as u64;
        let file_name = upload
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        debug!(action, ?delivery, file = %file_name, bytes = length, "catalog upload");
        let build = |client: &reqwest::Client| {
            let mut form = Form::new();
            for (key, value) in &fields {
                form = form.text(key.clone(), value.clone());
            }
            let part = Part::stream_with_length(bytes.clone(), length).file_name(file_name.clone());
            client
                .post(&url)
                .header(AUTHORIZATION, self.api_key.as_str())
                .multipart(form.part("upload", part))
        };
        let result = match delivery {
            Delivery::Retried => self.http.send(action, build).await,
            Delivery::Once => self.http.send_once(action, build).await,
        };
        decode_response(action, result).await
    }
}

async fn decode_response<T: DeserializeOwned>(
    action: &'static str,
    result: Result<reqwest::Response, FetchError>,
) -> Result<T, SyncError> {
    let text = match result {
        Ok(response) => response
            .text()
            .await
            .map_err(|err| SyncError::Transport {
                action,
                source: FetchError::Request(err),
            })?,
        // CKAN reports validation and authorization failures as 4xx with the usual envelope.
        Err(FetchError::HttpStatus { status, body, .. }) if (400..500).contains(&status) => {
            let detail = serde_json::from_str::<ActionResponse<JsonValue>>(&body)
                .ok()
                .and_then(|envelope| envelope.error)
                .map(|error| error.to_string())
                .unwrap_or(body);
            return Err(SyncError::Rejected {
                action,
                detail: format!("http {status}: {detail}"),
            });
        }
        Err(source) => return Err(SyncError::Transport { action, source }),
    };

    let envelope: ActionResponse<T> =
        serde_json::from_str(&text).map_err(|err| SyncError::Protocol {
            action,
            detail: err.to_string(),
        })?;
    if !envelope.success {
        return Err(SyncError::Rejected {
            action,
            detail: envelope
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "success=false".to_string()),
        });
    }
    envelope.result.ok_or_else(|| SyncError::Protocol {
        action,
        detail: "missing result".to_string(),
    })
}

/// Flatten a payload into multipart text fields, dropping nulls.
pub fn form_fields(payload: &impl Serialize) -> Result<Vec<(String, String)>, SyncError> {
    let value = serde_json::to_value(payload).map_err(|err| SyncError::Protocol {
        action: "encode",
        detail: err.to_string(),
    })?;
    let JsonValue::Object(map) = value else {
        return Err(SyncError::Protocol {
            action: "encode",
            detail: "payload is not an object".to_string(),
        });
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            JsonValue::Null => None,
            JsonValue::String(s) => Some((key, s)),
            other => Some((key, other.to_string())),
        })
        .collect())
}

#[async_trait]
impl CatalogClient for CkanClient {
    async fn organization_list(&self) -> Result<Vec<Organization>, SyncError> {
        self.call_json(
            "organization_list",
            Delivery::Retried,
            &json!({ "all_fields": true }),
        )
            .await
    }

    async fn package_search(&self, name: &str) -> Result<Vec<Package>, SyncError> {
        let found: SearchResult<Package> = self
            .call_json(
                "package_search",
                Delivery::Retried,
                &json!({
                    "fq": format!("name:{name}"),
                    "include_private": true,
                    "include_drafts": true,
                }),
            )
            .await?;
        Ok(found.results)
    }

    async fn package_create(&self, payload: &PackagePayload) -> Result<Package, SyncError> {
        self.call_json(
            "package_create",
            Delivery::Once,
            &to_body("package_create", payload)?,
        )
            .await
    }

    async fn package_patch(&self, payload: &PackagePayload) -> Result<Package, SyncError> {
        self.call_json(
            "package_patch",
            Delivery::Retried,
            &to_body("package_patch", payload)?,
        )
            .await
    }

    async fn resource_search(&self, hash: &str) -> Result<Vec<Resource>, SyncError> {
        let found: SearchResult<Resource> = self
            .call_json(
                "resource_search",
                Delivery::Retried,
                &json!({ "query": format!("hash:{hash}") }),
            )
            .await?;
        Ok(found.results)
    }

    async fn resource_create(
        &self,
        payload: &ResourcePayload,
        upload: &Path,
    ) -> Result<Resource, SyncError> {
        self.call_multipart("resource_create", Delivery::Once, form_fields(payload)?, upload)
            .await
    }

    async fn resource_patch(
        &self,
        payload: &ResourcePayload,
        upload: &Path,
    ) -> Result<Resource, SyncError> {
        self.call_multipart("resource_patch", Delivery::Retried, form_fields(payload)?, upload)
            .await
    }
}

fn to_body(action: &'static str, payload: &impl Serialize) -> Result<JsonValue, SyncError> {
    serde_json::to_value(payload).map_err(|err| SyncError::Protocol {
        action,
        detail: err.to_string(),
    })
}
