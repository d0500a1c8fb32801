//! Query-string <-> `TenderSearchParams`, including repeated keys and the upstream-style
//! `PageNumber`/`PageSize` aliases.

use std::str::FromStr;

use bidbase_core::ocds::{format_timestamp, parse_timestamp};
use bidbase_core::{SortBy, SortOrder, StatusFilter, TenderFilters, TenderSearchParams};
use chrono::{DateTime, Utc};
use url::form_urlencoded;

use crate::error::ApiError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 1000;

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {key}: `{raw}`")))
}

// `f64::from_str` takes `NaN` and `inf`; neither is a usable bound.
fn parse_amount(key: &str, raw: &str) -> Result<f64, ApiError> {
    let amount: f64 = parse_number(key, raw)?;
    if !amount.is_finite() {
        return Err(ApiError::BadRequest(format!("invalid {key}: `{raw}`")));
    }
    Ok(amount)
}

fn parse_date(key: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    parse_timestamp(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid {key}: `{raw}`")))
}

fn parse_variant<T>(raw: &str) -> Result<T, ApiError>
where
    T: FromStr<Err = bidbase_core::UnknownVariant>,
{
    raw.parse().map_err(|err: bidbase_core::UnknownVariant| ApiError::BadRequest(err.to_string()))
}

/// Parse a raw query string. Blank values count as absent and a repeated scalar key
/// keeps its last value; `status` falls back to
/// `active` when missing or unrecognised; page size is capped at [`MAX_PAGE_SIZE`].
pub fn parse_search_query(raw: Option<&str>) -> Result<TenderSearchParams, ApiError> {
    let mut filters = TenderFilters::default();
    let mut page = 1u32;
    let mut limit = DEFAULT_PAGE_SIZE;
    let mut sort_by = SortBy::default();
    let mut sort_order = SortOrder::default();

    for (key, value) in form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
        let (key, value): (&str, &str) = (&key, &value);
        if value.trim().is_empty() {
            continue;
        }
        match key {
            "keyword" => filters.keyword = Some(value.to_string()),
            "procuringEntity" => filters.procuring_entity.push(value.to_string()),
            "procurementCategory" => filters.procurement_category.push(value.to_string()),
            "procurementMethod" => filters.procurement_method.push(value.to_string()),
            "valueMin" => filters.value_min = Some(parse_amount("valueMin", value)?),
            "valueMax" => filters.value_max = Some(parse_amount("valueMax", value)?),
            "valueCurrency" => filters.value_currency = Some(value.to_string()),
            "closingDateFrom" => {
                filters.closing_date_from = Some(parse_date("closingDateFrom", value)?)
            }
            "closingDateTo" => filters.closing_date_to = Some(parse_date("closingDateTo", value)?),
            "publishedDateFrom" => {
                filters.published_date_from = Some(parse_date("publishedDateFrom", value)?)
            }
            "publishedDateTo" => {
                filters.published_date_to = Some(parse_date("publishedDateTo", value)?)
            }
            "status" => filters.status = value.parse().ok(),
            "page" | "PageNumber" => page = parse_number(key, value)?,
            "pageSize" | "PageSize" | "limit" => limit = parse_number(key, value)?,
            "sortBy" => sort_by = parse_variant(value)?,
            "sortOrder" => sort_order = parse_variant(value)?,
            _ => {}
        }
    }

    if filters.status.is_none() {
        filters.status = Some(StatusFilter::Active);
    }

    Ok(TenderSearchParams::new(filters, page.max(1), limit.clamp(1, MAX_PAGE_SIZE))
        .sorted(sort_by, sort_order))
}

/// Serialize back into the query-string form accepted by [`parse_search_query`].
pub fn to_query_string(params: &TenderSearchParams) -> String {
    let filters = &params.filters;
    let mut out = form_urlencoded::Serializer::new(String::new());

    if let Some(keyword) = &filters.keyword {
        out.append_pair("keyword", keyword);
    }
    for entity in &filters.procuring_entity {
        out.append_pair("procuringEntity", entity);
    }
    for category in &filters.procurement_category {
        out.append_pair("procurementCategory", category);
    }
    for method in &filters.procurement_method {
        out.append_pair("procurementMethod", method);
    }
    if let Some(min) = filters.value_min {
        out.append_pair("valueMin", &min.to_string());
    }
    if let Some(max) = filters.value_max {
        out.append_pair("valueMax", &max.to_string());
    }
    if let Some(currency) = &filters.value_currency {
        out.append_pair("valueCurrency", currency);
    }
    let dates = [
        ("closingDateFrom", filters.closing_date_from),
        ("closingDateTo", filters.closing_date_to),
        ("publishedDateFrom", filters.published_date_from),
        ("publishedDateTo", filters.published_date_to),
    ];
    for (key, ts) in dates {
        if let Some(ts) = ts {
            out.append_pair(key, &format_timestamp(ts));
        }
    }
    if let Some(status) = filters.status {
        out.append_pair("status", status.as_str());
    }
    out.append_pair("page", &params.page.to_string());
    out.append_pair("pageSize", &params.limit.to_string());
    out.append_pair("sortBy", params.sort_by.as_str());
    out.append_pair("sortOrder", params.sort_order.as_str());
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_apply_when_query_is_empty() {
        let params = parse_search_query(None).unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.limit, DEFAULT_PAGE_SIZE);
        assert_eq!(params.filters.status, Some(StatusFilter::Active));
        assert_eq!(params.sort_by, SortBy::PublishedDate);
        assert_eq!(params.sort_order, SortOrder::Desc);
    }

    #[test]
    fn repeated_keys_and_upstream_aliases() {
        let params = parse_search_query(Some(
            "procuringEntity=City%20of%20X&procuringEntity=City+of+Y&PageNumber=3&PageSize=5000\
             &status=closed&valueMin=200&closingDateTo=2025-06-30&sortBy=value&sortOrder=asc",
        ))
        .unwrap();
        assert_eq!(params.filters.procuring_entity, vec!["City of X", "City of Y"]);
        assert_eq!(params.page, 3);
        assert_eq!(params.limit, MAX_PAGE_SIZE);
        assert_eq!(params.filters.status, Some(StatusFilter::Closed));
        assert_eq!(params.filters.value_min, Some(200.0));
        assert_eq!(
            params.filters.closing_date_to,
            Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).single()
        );
        assert_eq!(params.sort_by, SortBy::Value);
        assert_eq!(params.sort_order, SortOrder::Asc);
    }

    #[test]
    fn repeated_scalar_keys_keep_the_last_value() {
        let params =
            parse_search_query(Some("keyword=road&keyword=bridge&valueMin=1&valueMin=5&page=2&page=4"))
                .unwrap();
        assert_eq!(params.filters.keyword.as_deref(), Some("bridge"));
        assert_eq!(params.filters.value_min, Some(5.0));
        assert_eq!(params.page, 4);
    }

    #[test]
    fn unknown_status_falls_back_to_active() {
        let params = parse_search_query(Some("status=pending&keyword=")).unwrap();
        assert_eq!(params.filters.status, Some(StatusFilter::Active));
        assert_eq!(params.filters.keyword, None);
    }

    #[test]
    fn malformed_numbers_and_dates_are_rejected() {
        for query in [
            "valueMin=lots",
            "page=two",
            "pageSize=-1",
            "closingDateFrom=tomorrow",
            "sortBy=relevance",
            "valueMin=NaN",
            "valueMax=inf",
            "valueMin=-infinity",
        ] {
            let err = parse_search_query(Some(query)).unwrap_err();
            assert!(matches!(err, ApiError::BadRequest(_)), "{query}");
        }
    }

    #[test]
    fn serialized_query_parses_back_to_the_same_params() {
        let params = parse_search_query(Some(
            "keyword=road%20%26%20bridge&procurementMethod=open&procurementMethod=limited\
             &valueMax=900.5&valueCurrency=ZAR&publishedDateFrom=2025-01-01T00:00:00Z\
             &status=all&page=2&pageSize=50&sortBy=endDate",
        ))
        .unwrap();
        let query = to_query_string(&params);
        assert!(query.contains("keyword=road+%26+bridge"));
        assert_eq!(parse_search_query(Some(&query)).unwrap(), params);
    }
}
