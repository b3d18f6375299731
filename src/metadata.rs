//! Bibliographic metadata (Crossref) and open-access availability (Unpaywall)
//! for one identifier, plus choosing which PDF link to follow.

use std::time::Duration;

use anyhow::Context as _;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::formats::{CrossrefWork, UnpaywallRecord};
use crate::http::{BackoffPolicy, backoff_request};

pub const METADATA_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct CrossrefEnvelope {
    #[serde(default)]
    message: Option<CrossrefWork>,
}

/// `{base}/works/{doi}`. Slashes inside the identifier stay path separators,
/// everything else is percent-encoded.
pub fn works_url(base: &str, doi: &str) -> anyhow::Result<Url> {
    endpoint_url(base, "works", doi)
}

/// `{base}/v2/{doi}?email={email}`.
pub fn oa_url(base: &str, doi: &str, email: &str) -> anyhow::Result<Url> {
    let mut url = endpoint_url(base, "v2", doi)?;
    url.query_pairs_mut().append_pair("email", email);
    Ok(url)
}

fn endpoint_url(base: &str, route: &str, doi: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("parse service base url: {base}"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow::anyhow!("service base url cannot have a path: {base}"))?
        .pop_if_empty()
        .push(route)
        .extend(doi.split('/'));
    Ok(url)
}

pub async fn fetch_metadata(
    client: &Client,
    policy: &BackoffPolicy,
    base: &str,
    doi: &str,
) -> anyhow::Result<CrossrefWork> {
    let url = works_url(base, doi)?;
    let response = backoff_request(
        client,
        policy,
        Method::GET,
        url.as_str(),
        Some(METADATA_TIMEOUT),
    )
    .await?
    .error_for_status()
    .with_context(|| format!("GET {url}"))?;

    let envelope: CrossrefEnvelope = response
        .json()
        .await
        .with_context(|| format!("parse crossref response: {url}"))?;
    Ok(envelope.message.unwrap_or_default())
}

/// A 404 means the service has never heard of the identifier, which is an
/// empty record rather than an error.
pub async fn fetch_oa_status(
    client: &Client,
    policy: &BackoffPolicy,
    base: &str,
    doi: &str,
    email: &str,
) -> anyhow::Result<UnpaywallRecord> {
    let url = oa_url(base, doi, email)?;
    let response = backoff_request(
        client,
        policy,
        Method::GET,
        url.as_str(),
        Some(METADATA_TIMEOUT),
    )
    .await?;

    if response.status() == StatusCode::NOT_FOUND {
        tracing::debug!(doi, "identifier unknown to open-access service");
        return Ok(UnpaywallRecord::default());
    }

    let response = response
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    response
        .json()
        .await
        .with_context(|| format!("parse unpaywall response: {url}"))
}

/// Best location first, then the remaining locations in listed order.
pub fn select_pdf_url(oa: &UnpaywallRecord) -> Option<String> {
    oa.best_oa_location
        .as_ref()
        .and_then(|location| location.pdf_candidate())
        .or_else(|| oa.oa_locations.iter().find_map(|location| location.pdf_candidate()))
        .map(str::to_owned)
}
