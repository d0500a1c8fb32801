//! Core domain model for BidBase: stored tenders, filter criteria and facet statistics.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub mod ocds;

/// Placeholder title used when an upstream release carries none.
pub const UNTITLED_TENDER: &str = "Untitled Tender";

/// Semi-structured `{id, name}` object stored in the `procuring_entity` JSON column.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcuringEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Semi-structured `{amount, currency}` object stored in the `value` JSON column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TenderValue {
    #[serde(
        default,
        deserialize_with = "deserialize_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

// Upstream occasionally sends amounts as strings.
fn deserialize_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Amount>::deserialize(deserializer)? {
        Some(Amount::Number(n)) => Some(n),
        Some(Amount::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// One stored procurement opportunity, keyed by its OCID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tender {
    pub ocid: String,
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub procurement_method: Option<String>,
    pub procurement_method_details: Option<String>,
    pub main_procurement_category: Option<String>,
    pub status: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub procuring_entity: Option<ProcuringEntity>,
    pub value: Option<TenderValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tender {
    /// Explicit status override if present, otherwise active until the closing date passes.
    pub fn derived_status(&self, now: DateTime<Utc>) -> &str {
        if let Some(status) = self.status.as_deref() {
            return status;
        }
        match self.end_date {
            Some(end) if end < now => "closed",
            _ => "active",
        }
    }

    pub fn value_amount(&self) -> Option<f64> {
        self.value.as_ref().and_then(|v| v.amount)
    }

    pub fn entity_name(&self) -> Option<&str> {
        self.procuring_entity.as_ref().and_then(|e| e.name.as_deref())
    }
}

/// Upsert payload for the `tenders` table.
///
/// On conflict only `title`, `description`, `end_date` and `value` are refreshed;
/// every other column keeps the value from the first ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTender {
    pub ocid: String,
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub procurement_method: Option<String>,
    pub procurement_method_details: Option<String>,
    pub main_procurement_category: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub procuring_entity: Option<ProcuringEntity>,
    pub value: Option<TenderValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderDocument {
    pub id: i64,
    pub tender_ocid: String,
    pub document_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub format: Option<String>,
    pub date_published: Option<DateTime<Utc>>,
    pub date_modified: Option<DateTime<Utc>>,
}

/// Upsert payload for `tender_documents`, keyed by `(tender_ocid, document_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTenderDocument {
    pub tender_ocid: String,
    pub document_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub format: Option<String>,
    pub date_published: Option<DateTime<Utc>>,
    pub date_modified: Option<DateTime<Utc>>,
}

/// Error returned when a query-string enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Active,
    Closed,
    All,
}

impl StatusFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

impl FromStr for StatusFilter {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "all" => Ok(Self::All),
            other => Err(UnknownVariant {
                kind: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    #[default]
    PublishedDate,
    EndDate,
    Value,
}

impl SortBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PublishedDate => "publishedDate",
            Self::EndDate => "endDate",
            Self::Value => "value",
        }
    }
}

impl FromStr for SortBy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publishedDate" => Ok(Self::PublishedDate),
            "endDate" => Ok(Self::EndDate),
            "value" => Ok(Self::Value),
            other => Err(UnknownVariant {
                kind: "sort field",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(UnknownVariant {
                kind: "sort order",
                value: other.to_string(),
            }),
        }
    }
}

/// Request-scoped filter criteria. Absent fields and empty lists contribute no predicate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenderFilters {
    pub keyword: Option<String>,
    pub procuring_entity: Vec<String>,
    pub procurement_category: Vec<String>,
    pub procurement_method: Vec<String>,
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
    pub value_currency: Option<String>,
    pub closing_date_from: Option<DateTime<Utc>>,
    pub closing_date_to: Option<DateTime<Utc>>,
    pub published_date_from: Option<DateTime<Utc>>,
    pub published_date_to: Option<DateTime<Utc>>,
    pub status: Option<StatusFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderSearchParams {
    pub filters: TenderFilters,
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl TenderSearchParams {
    pub fn new(filters: TenderFilters, page: u32, limit: u32) -> Self {
        Self {
            filters,
            page,
            limit,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
        }
    }

    pub fn sorted(mut self, sort_by: SortBy, sort_order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.sort_order = sort_order;
        self
    }

    /// `(page - 1) * limit`, treating page 0 as the first page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderPage {
    pub tenders: Vec<Tender>,
    pub total_count: u64,
    pub current_page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOption {
    pub value: String,
    pub label: String,
    pub count: u64,
}

impl FilterOption {
    pub fn new(value: impl Into<String>, count: u64) -> Self {
        let value = value.into();
        Self {
            label: value.clone(),
            value,
            count,
        }
    }
}

/// Facet breakdown over the whole `tenders` table, independent of any applied filters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStats {
    pub procuring_entities: Vec<FilterOption>,
    pub procurement_categories: Vec<FilterOption>,
    pub procurement_methods: Vec<FilterOption>,
    pub total_count: u64,
    pub active_count: u64,
    pub closed_count: u64,
}

/// Inclusive calendar-date window sent upstream as `dateFrom`/`dateTo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn last_days(today: NaiveDate, days: u64) -> Self {
        let from = today
            .checked_sub_days(chrono::Days::new(days))
            .unwrap_or(NaiveDate::MIN);
        Self { from, to: today }
    }

    pub fn last_months(today: NaiveDate, months: u32) -> Self {
        let from = today
            .checked_sub_months(Months::new(months))
            .unwrap_or(NaiveDate::MIN);
        Self { from, to: today }
    }

    pub fn is_ordered(&self) -> bool {
        self.from <= self.to
    }

    pub fn from_param(&self) -> String {
        self.from.format("%Y-%m-%d").to_string()
    }

    pub fn to_param(&self) -> String {
        self.to.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from_param(), self.to_param())
    }
}
