//! Open Contracting Data Standard release shapes as served by the eTenders API.
//!
//! Every field is optional: the upstream feed routinely omits nested objects, so
//! consumers must tolerate gaps anywhere in `Release -> tender -> {tenderPeriod,
//! procuringEntity, value, documents}`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{ProcuringEntity, Tender, TenderDocument, TenderValue};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReleasesResponse {
    #[serde(default)]
    pub releases: Vec<Release>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    #[serde(default)]
    pub ocid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tender: Option<OcdsTender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer: Option<ProcuringEntity>,
}

impl Release {
    /// The release key, if present and not blank.
    pub fn key(&self) -> Option<&str> {
        self.ocid.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcdsTender {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procurement_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procurement_method_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_procurement_category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_procurement_categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tender_period: Option<Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procuring_entity: Option<ProcuringEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<TenderValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<OcdsDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcdsDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_modified: Option<String>,
}

/// Parse an upstream timestamp: RFC 3339, then naive `YYYY-MM-DDTHH:MM:SS[.f]` as UTC,
/// then a bare date at midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Tender {
    /// Rebuild the upstream release shape from a stored row so API consumers see
    /// the same payload whether they hit the store or the upstream proxy.
    pub fn to_release(&self, documents: &[TenderDocument]) -> Release {
        let tender_period = if self.start_date.is_some() || self.end_date.is_some() {
            Some(Period {
                start_date: self.start_date.map(format_timestamp),
                end_date: self.end_date.map(format_timestamp),
            })
        } else {
            None
        };

        Release {
            ocid: Some(self.ocid.clone()),
            id: None,
            date: self.published_date.map(format_timestamp),
            language: None,
            tag: Vec::new(),
            tender: Some(OcdsTender {
                id: self.id.clone(),
                title: Some(self.title.clone()),
                description: self.description.clone(),
                procurement_method: self.procurement_method.clone(),
                procurement_method_details: self.procurement_method_details.clone(),
                main_procurement_category: self.main_procurement_category.clone(),
                additional_procurement_categories: Vec::new(),
                status: self.status.clone(),
                tender_period,
                procuring_entity: self.procuring_entity.clone(),
                value: self.value.clone(),
                documents: documents.iter().map(OcdsDocument::from).collect(),
            }),
            buyer: None,
        }
    }
}

impl From<&TenderDocument> for OcdsDocument {
    fn from(doc: &TenderDocument) -> Self {
        Self {
            id: doc.document_id.clone(),
            title: doc.title.clone(),
            description: doc.description.clone(),
            url: doc.url.clone(),
            format: doc.format.clone(),
            date_published: doc.date_published.map(format_timestamp),
            date_modified: doc.date_modified.map(format_timestamp),
        }
    }
}
