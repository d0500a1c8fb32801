//! Upstream OCDS client, release sources and release-to-row mapping.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bidbase_core::ocds::{Release, ReleasesResponse};
use bidbase_core::DateWindow;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod mapping;

pub use mapping::{map_release, map_releases, MappedReleases};

pub const DEFAULT_BASE_URL: &str = "https://ocds-api.etenders.gov.za/api/OCDSReleases";

#[derive(Debug, Clone)]
pub struct OcdsClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for OcdsClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fixture(#[from] anyhow::Error),
}

impl FetchError {
    /// Upstream HTTP status, when the failure was a non-success response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Anything that can hand the ingestion job one window of releases.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_releases(
        &self,
        window: &DateWindow,
        page_size: u32,
    ) -> Result<Vec<Release>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct OcdsClient {
    client: reqwest::Client,
    base_url: Url,
}

impl OcdsClient {
    pub fn new(config: OcdsClientConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing OCDS base url {}", config.base_url))?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "OCDS base url {} cannot carry a path",
            config.base_url
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// One upstream call for the window. A non-success status fails the call; there is no retry.
    pub async fn fetch_window(
        &self,
        window: &DateWindow,
        page_size: u32,
    ) -> Result<Vec<Release>, FetchError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("dateFrom", &window.from_param())
            .append_pair("dateTo", &window.to_param())
            .append_pair("PageSize", &page_size.to_string());

        let span = info_span!("ocds_fetch_window", window = %window, page_size);
        let body = self.get_bytes(url).instrument(span).await?;
        let response: ReleasesResponse =
            serde_json::from_slice(&body.bytes).map_err(|source| FetchError::Decode {
                url: body.url.clone(),
                source,
            })?;
        debug!(releases = response.releases.len(), url = %body.url, "decoded release window");
        Ok(response.releases)
    }

    /// Raw single-release payload, passed through untouched.
    pub async fn fetch_release_json(&self, ocid: &str) -> Result<serde_json::Value, FetchError> {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("release").push(ocid);
        }
        let span = info_span!("ocds_fetch_release", ocid);
        let body = self.get_bytes(url).instrument(span).await?;
        decode_value(body)
    }

    /// Forward an arbitrary query string to the releases endpoint.
    pub async fn proxy_releases_json(
        &self,
        raw_query: Option<&str>,
    ) -> Result<serde_json::Value, FetchError> {
        let mut url = self.base_url.clone();
        url.set_query(raw_query.filter(|q| !q.is_empty()));
        let span = info_span!("ocds_proxy_releases");
        let body = self.get_bytes(url).instrument(span).await?;
        decode_value(body)
    }

    async fn get_bytes(&self, url: Url) -> Result<FetchedBody, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let bytes = resp.bytes().await?.to_vec();
        Ok(FetchedBody {
            url: final_url,
            bytes,
        })
    }
}

#[async_trait]
impl ReleaseSource for OcdsClient {
    fn source_id(&self) -> &str {
        "ocds-api"
    }

    async fn fetch_releases(
        &self,
        window: &DateWindow,
        page_size: u32,
    ) -> Result<Vec<Release>, FetchError> {
        self.fetch_window(window, page_size).await
    }
}

struct FetchedBody {
    url: String,
    bytes: Vec<u8>,
}

fn decode_value(body: FetchedBody) -> Result<serde_json::Value, FetchError> {
    serde_json::from_slice(&body.bytes).map_err(|source| FetchError::Decode {
        url: body.url,
        source,
    })
}

/// Releases held in memory, typically loaded from a fixture file for offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticReleaseSource {
    label: String,
    releases: Vec<Release>,
}

impl StaticReleaseSource {
    pub fn new(label: impl Into<String>, releases: Vec<Release>) -> Self {
        Self {
            label: label.into(),
            releases,
        }
    }

    pub fn from_fixture(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let releases = load_release_fixture(path)?;
        Ok(Self::new(path.display().to_string(), releases))
    }
}

#[async_trait]
impl ReleaseSource for StaticReleaseSource {
    fn source_id(&self) -> &str {
        &self.label
    }

    async fn fetch_releases(
        &self,
        _window: &DateWindow,
        page_size: u32,
    ) -> Result<Vec<Release>, FetchError> {
        Ok(self
            .releases
            .iter()
            .take(page_size as usize)
            .cloned()
            .collect())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Response(ReleasesResponse),
    Bare(Vec<Release>),
}

/// Load releases from either an upstream-shaped `{ "releases": [...] }` file or a bare array.
pub fn load_release_fixture(path: impl AsRef<Path>) -> anyhow::Result<Vec<Release>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: FixtureFile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match parsed {
        FixtureFile::Response(r) => r.releases,
        FixtureFile::Bare(list) => list,
    })
}

pub fn default_fixture_path(workspace_root: impl Into<PathBuf>) -> PathBuf {
    workspace_root
        .into()
        .join("fixtures")
        .join("ocds")
        .join("sample_releases.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;

    fn window() -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
        )
    }

    #[test]
    fn client_rejects_unusable_base_urls() {
        let err = OcdsClient::new(OcdsClientConfig {
            base_url: "not a url".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("parsing OCDS base url"));

        let client = OcdsClient::new(OcdsClientConfig::default()).expect("default client");
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn http_status_errors_expose_the_code() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.to_string(), "http status 503 for https://example.test");
    }

    #[test]
    fn fixture_loader_accepts_both_shapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wrapped = dir.path().join("wrapped.json");
        let bare = dir.path().join("bare.json");
        std::fs::File::create(&wrapped)
            .unwrap()
            .write_all(br#"{"releases":[{"ocid":"a"},{"ocid":"b"}]}"#)
            .unwrap();
        std::fs::File::create(&bare)
            .unwrap()
            .write_all(br#"[{"ocid":"c"}]"#)
            .unwrap();

        assert_eq!(load_release_fixture(&wrapped).unwrap().len(), 2);
        assert_eq!(load_release_fixture(&bare).unwrap()[0].key(), Some("c"));
        assert!(load_release_fixture(dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn static_source_honours_page_size() {
        let releases = (0..5)
            .map(|i| Release {
                ocid: Some(format!("ocds-{i}")),
                ..Default::default()
            })
            .collect();
        let source = StaticReleaseSource::new("memory", releases);
        let got = source.fetch_releases(&window(), 3).await.unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(source.source_id(), "memory");
    }
}
