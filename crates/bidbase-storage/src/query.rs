//! Filter compilation: `TenderFilters` -> typed predicate list -> SQL or in-memory evaluation.
//!
//! The page query and the count query of one request are rendered from the same
//! compiled list, so their predicates cannot drift apart.

use std::cmp::Ordering;

use bidbase_core::{SortBy, SortOrder, StatusFilter, Tender, TenderFilters};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

pub(crate) const AMOUNT_EXPR: &str = "CAST(value->>'amount' AS NUMERIC)";

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Case-insensitive substring on title OR description.
    Keyword(String),
    /// Any of the substrings against `procuring_entity->>'name'`.
    EntityNameAny(Vec<String>),
    CategoryAny(Vec<String>),
    /// Any of the substrings against procurement method OR method details.
    MethodAny(Vec<String>),
    Value {
        min: Option<f64>,
        max: Option<f64>,
        currency: Option<String>,
    },
    ClosingFrom(DateTime<Utc>),
    ClosingTo(DateTime<Utc>),
    PublishedFrom(DateTime<Utc>),
    PublishedTo(DateTime<Utc>),
    /// `end_date >= now OR status = 'active'`.
    ActiveAt(DateTime<Utc>),
    /// `end_date <= now OR status = 'closed'`.
    ClosedAt(DateTime<Utc>),
}

fn non_empty(values: &[String]) -> Vec<String> {
    values.iter().filter(|v| !v.is_empty()).cloned().collect()
}

/// Accumulate one predicate per active filter; the caller ANDs them together.
pub fn compile_predicates(filters: &TenderFilters, now: DateTime<Utc>) -> Vec<Predicate> {
    let mut predicates = Vec::new();

    if let Some(keyword) = filters.keyword.as_deref().filter(|k| !k.is_empty()) {
        predicates.push(Predicate::Keyword(keyword.to_string()));
    }

    let entities = non_empty(&filters.procuring_entity);
    if !entities.is_empty() {
        predicates.push(Predicate::EntityNameAny(entities));
    }

    let categories = non_empty(&filters.procurement_category);
    if !categories.is_empty() {
        predicates.push(Predicate::CategoryAny(categories));
    }

    let methods = non_empty(&filters.procurement_method);
    if !methods.is_empty() {
        predicates.push(Predicate::MethodAny(methods));
    }

    // Currency only narrows an explicit amount range.
    if filters.value_min.is_some() || filters.value_max.is_some() {
        predicates.push(Predicate::Value {
            min: filters.value_min,
            max: filters.value_max,
            currency: filters.value_currency.clone().filter(|c| !c.is_empty()),
        });
    }

    if let Some(from) = filters.closing_date_from {
        predicates.push(Predicate::ClosingFrom(from));
    }
    if let Some(to) = filters.closing_date_to {
        predicates.push(Predicate::ClosingTo(to));
    }
    if let Some(from) = filters.published_date_from {
        predicates.push(Predicate::PublishedFrom(from));
    }
    if let Some(to) = filters.published_date_to {
        predicates.push(Predicate::PublishedTo(to));
    }

    match filters.status {
        Some(StatusFilter::Active) => predicates.push(Predicate::ActiveAt(now)),
        Some(StatusFilter::Closed) => predicates.push(Predicate::ClosedAt(now)),
        Some(StatusFilter::All) | None => {}
    }

    predicates
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

// NULL columns never satisfy a comparison, mirroring SQL three-valued logic under WHERE.
fn at_least<T: PartialOrd>(value: Option<T>, bound: T) -> bool {
    value.map(|v| v >= bound).unwrap_or(false)
}

fn at_most<T: PartialOrd>(value: Option<T>, bound: T) -> bool {
    value.map(|v| v <= bound).unwrap_or(false)
}

impl Predicate {
    pub fn matches(&self, tender: &Tender) -> bool {
        match self {
            Self::Keyword(kw) => {
                contains_ci(Some(&tender.title), kw) || contains_ci(tender.description.as_deref(), kw)
            }
            Self::EntityNameAny(names) => names
                .iter()
                .any(|n| contains_ci(tender.entity_name(), n)),
            Self::CategoryAny(categories) => categories
                .iter()
                .any(|c| contains_ci(tender.main_procurement_category.as_deref(), c)),
            Self::MethodAny(methods) => methods.iter().any(|m| {
                contains_ci(tender.procurement_method.as_deref(), m)
                    || contains_ci(tender.procurement_method_details.as_deref(), m)
            }),
            Self::Value { min, max, currency } => {
                let amount = tender.value_amount();
                min.map_or(true, |min| at_least(amount, min))
                    && max.map_or(true, |max| at_most(amount, max))
                    && currency.as_deref().map_or(true, |c| {
                        tender.value.as_ref().and_then(|v| v.currency.as_deref()) == Some(c)
                    })
            }
            Self::ClosingFrom(from) => at_least(tender.end_date, *from),
            Self::ClosingTo(to) => at_most(tender.end_date, *to),
            Self::PublishedFrom(from) => at_least(tender.published_date, *from),
            Self::PublishedTo(to) => at_most(tender.published_date, *to),
            Self::ActiveAt(now) => {
                at_least(tender.end_date, *now) || tender.status.as_deref() == Some("active")
            }
            Self::ClosedAt(now) => {
                at_most(tender.end_date, *now) || tender.status.as_deref() == Some("closed")
            }
        }
    }
}

pub fn matches_all(predicates: &[Predicate], tender: &Tender) -> bool {
    predicates.iter().all(|p| p.matches(tender))
}

/// `%needle%` with LIKE metacharacters escaped, so user input is matched literally.
pub fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

fn push_ilike_any(qb: &mut QueryBuilder<'_, Postgres>, column: &str, needles: &[String]) {
    qb.push("(");
    for (i, needle) in needles.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push(column).push(" ILIKE ").push_bind(like_pattern(needle));
    }
    qb.push(")");
}

fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::Keyword(kw) => {
            let pattern = like_pattern(kw);
            qb.push("(title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        Predicate::EntityNameAny(names) => push_ilike_any(qb, "procuring_entity->>'name'", names),
        Predicate::CategoryAny(categories) => {
            push_ilike_any(qb, "main_procurement_category", categories)
        }
        Predicate::MethodAny(methods) => {
            qb.push("(");
            for (i, method) in methods.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                let pattern = like_pattern(method);
                qb.push("(procurement_method ILIKE ")
                    .push_bind(pattern.clone())
                    .push(" OR procurement_method_details ILIKE ")
                    .push_bind(pattern)
                    .push(")");
            }
            qb.push(")");
        }
        Predicate::Value { min, max, currency } => {
            qb.push("(");
            let mut first = true;
            let mut and = |qb: &mut QueryBuilder<'_, Postgres>| {
                if !first {
                    qb.push(" AND ");
                }
                first = false;
            };
            if let Some(min) = min {
                and(qb);
                qb.push(AMOUNT_EXPR)
                    .push(" >= CAST(")
                    .push_bind(*min)
                    .push(" AS NUMERIC)");
            }
            if let Some(max) = max {
                and(qb);
                qb.push(AMOUNT_EXPR)
                    .push(" <= CAST(")
                    .push_bind(*max)
                    .push(" AS NUMERIC)");
            }
            if let Some(currency) = currency {
                and(qb);
                qb.push("value->>'currency' = ").push_bind(currency.clone());
            }
            qb.push(")");
        }
        Predicate::ClosingFrom(ts) => {
            qb.push("end_date >= ").push_bind(*ts);
        }
        Predicate::ClosingTo(ts) => {
            qb.push("end_date <= ").push_bind(*ts);
        }
        Predicate::PublishedFrom(ts) => {
            qb.push("published_date >= ").push_bind(*ts);
        }
        Predicate::PublishedTo(ts) => {
            qb.push("published_date <= ").push_bind(*ts);
        }
        Predicate::ActiveAt(now) => {
            qb.push("(end_date >= ")
                .push_bind(*now)
                .push(" OR status = 'active')");
        }
        Predicate::ClosedAt(now) => {
            qb.push("(end_date <= ")
                .push_bind(*now)
                .push(" OR status = 'closed')");
        }
    }
}

/// Append ` WHERE p1 AND p2 ...`; nothing at all for an empty list.
pub fn push_where(qb: &mut QueryBuilder<'_, Postgres>, predicates: &[Predicate]) {
    for (i, predicate) in predicates.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        push_predicate(qb, predicate);
    }
}

/// ORDER BY body. Date columns keep Postgres' default null placement; value sorts
/// nulls last in both directions. `ocid` breaks ties so pages never overlap.
pub fn order_clause(sort_by: SortBy, sort_order: SortOrder) -> &'static str {
    match (sort_by, sort_order) {
        (SortBy::PublishedDate, SortOrder::Asc) => "published_date ASC, ocid ASC",
        (SortBy::PublishedDate, SortOrder::Desc) => "published_date DESC, ocid ASC",
        (SortBy::EndDate, SortOrder::Asc) => "end_date ASC, ocid ASC",
        (SortBy::EndDate, SortOrder::Desc) => "end_date DESC, ocid ASC",
        (SortBy::Value, SortOrder::Asc) => {
            "CAST(value->>'amount' AS NUMERIC) ASC NULLS LAST, ocid ASC"
        }
        (SortBy::Value, SortOrder::Desc) => {
            "CAST(value->>'amount' AS NUMERIC) DESC NULLS LAST, ocid ASC"
        }
    }
}

fn compare_nullable<T: PartialOrd>(
    a: Option<T>,
    b: Option<T>,
    order: SortOrder,
    nulls_always_last: bool,
) -> Ordering {
    // Postgres sorts NULL as larger than any value unless told otherwise.
    let null_first = !nulls_always_last && order == SortOrder::Desc;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => {
            if null_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Some(_), None) => {
            if null_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Some(x), Some(y)) => {
            let ord = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        }
    }
}

/// In-memory equivalent of [`order_clause`].
pub fn compare_tenders(a: &Tender, b: &Tender, sort_by: SortBy, order: SortOrder) -> Ordering {
    let primary = match sort_by {
        SortBy::PublishedDate => compare_nullable(a.published_date, b.published_date, order, false),
        SortBy::EndDate => compare_nullable(a.end_date, b.end_date, order, false),
        SortBy::Value => compare_nullable(a.value_amount(), b.value_amount(), order, true),
    };
    primary.then_with(|| a.ocid.cmp(&b.ocid))
}
