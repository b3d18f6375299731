use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// The `message` object of a Crossref `/works/{doi}` response.
///
/// Only the fields the report needs are typed; everything else is kept in
/// `extra` so cached entries keep the full payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CrossrefWork {
    #[serde(deserialize_with = "null_as_default")]
    pub title: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub container_title: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateParts>,
    #[serde(deserialize_with = "null_as_default")]
    pub author: Vec<CrossrefAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub work_type: Option<String>,
    #[serde(rename = "URL", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateParts {
    #[serde(rename = "date-parts", deserialize_with = "null_as_default")]
    pub date_parts: Vec<Vec<Option<i32>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossrefAuthor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CrossrefWork {
    pub fn title_text(&self) -> String {
        self.title.join("; ")
    }

    pub fn journal_text(&self) -> String {
        self.container_title.join("; ")
    }

    pub fn year(&self) -> Option<i32> {
        self.issued
            .as_ref()?
            .date_parts
            .first()?
            .first()
            .copied()
            .flatten()
    }

    pub fn authors_text(&self) -> String {
        self.author
            .iter()
            .map(CrossrefAuthor::display_name)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl CrossrefAuthor {
    pub fn display_name(&self) -> String {
        let given = self.given.as_deref().unwrap_or_default();
        let family = self.family.as_deref().unwrap_or_default();
        format!("{given} {family}").trim().to_owned()
    }
}

/// An Unpaywall `/v2/{doi}` record. The default value stands for "not known
/// to the service".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpaywallRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_oa: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_oa_location: Option<OaLocation>,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub oa_locations: Vec<OaLocation>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OaLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_for_pdf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OaLocation {
    /// `url_for_pdf`, else `url`; blank strings do not count.
    pub fn pdf_candidate(&self) -> Option<&str> {
        non_blank(self.url_for_pdf.as_deref()).or_else(|| non_blank(self.url.as_deref()))
    }
}

impl UnpaywallRecord {
    pub fn license(&self) -> Option<String> {
        self.best_oa_location
            .as_ref()
            .and_then(|location| location.license.clone())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Outcome of scanning one PDF for the target strings. Also the payload of
/// the `matches` cache namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOutcome {
    pub found: bool,
    /// Needles that matched, in order of first match.
    pub matches: Vec<String>,
    /// 1-based page numbers with at least one match, ascending.
    pub pages: Vec<u32>,
}

/// One report row per identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub doi: String,
    pub title: String,
    pub journal: String,
    pub year: Option<i32>,
    pub authors: String,
    pub publisher: String,
    #[serde(rename = "type")]
    pub work_type: String,
    pub crossref_url: String,
    pub is_oa: Option<bool>,
    pub oa_license: Option<String>,
    pub pdf_url: String,
    /// Set by Stage 1 when a PDF sits in the staging directory.
    pub pdf_temp_path: Option<PathBuf>,
    /// Set once the PDF has been routed.
    pub pdf_final_path: Option<PathBuf>,
    pub match_found: bool,
    pub matched_strings: Vec<String>,
    pub match_pages: Vec<u32>,
}

impl ResultRow {
    pub fn new(doi: &str, work: &CrossrefWork, oa: &UnpaywallRecord) -> Self {
        Self {
            doi: doi.to_owned(),
            title: work.title_text(),
            journal: work.journal_text(),
            year: work.year(),
            authors: work.authors_text(),
            publisher: work.publisher.clone().unwrap_or_default(),
            work_type: work.work_type.clone().unwrap_or_default(),
            crossref_url: work.url.clone().unwrap_or_default(),
            is_oa: oa.is_oa,
            oa_license: oa.license(),
            ..Self::default()
        }
    }

    pub fn apply_outcome(&mut self, outcome: &MatchOutcome) {
        self.match_found = outcome.found;
        self.matched_strings = outcome.matches.clone();
        self.match_pages = outcome.pages.clone();
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
