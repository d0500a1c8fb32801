use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bidbase_core::{
    FilterOption, FilterStats, NewTender, NewTenderDocument, Tender, TenderDocument, TenderPage,
    TenderSearchParams,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::query::{compare_tenders, compile_predicates, matches_all, Predicate};
use crate::{StoreError, StoreOverview, TenderHeadline, TenderStore, FACET_LIMIT};

/// Process-local store with the same upsert, filter and ordering rules as Postgres.
/// Used for offline runs and tests.
#[derive(Debug, Default)]
pub struct MemoryTenderStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tenders: BTreeMap<String, Tender>,
    documents: Vec<TenderDocument>,
    next_document_id: i64,
}

impl MemoryTenderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the status override on a stored tender. Ingestion never writes this column.
    pub async fn set_status(&self, ocid: &str, status: Option<&str>) -> bool {
        let mut state = self.state.write().await;
        match state.tenders.get_mut(ocid) {
            Some(tender) => {
                tender.status = status.map(str::to_string);
                true
            }
            None => false,
        }
    }

    /// Append a document row without the uniqueness check, as legacy data could contain.
    pub async fn insert_raw_document(&self, mut document: TenderDocument) -> i64 {
        let mut state = self.state.write().await;
        state.next_document_id += 1;
        document.id = state.next_document_id;
        let id = document.id;
        state.documents.push(document);
        id
    }
}

fn facet<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<FilterOption> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for value in values.flatten().filter(|v| !v.is_empty()) {
        *counts.entry(value).or_default() += 1;
    }
    let mut options: Vec<FilterOption> = counts
        .into_iter()
        .map(|(value, count)| FilterOption::new(value, count))
        .collect();
    options.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    options.truncate(FACET_LIMIT);
    options
}

fn count_matching(tenders: &BTreeMap<String, Tender>, predicate: &Predicate) -> u64 {
    tenders.values().filter(|t| predicate.matches(t)).count() as u64
}

#[async_trait]
impl TenderStore for MemoryTenderStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert_tenders(&self, batch: &[NewTender]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        for row in batch {
            match state.tenders.get_mut(&row.ocid) {
                Some(existing) => {
                    existing.title = row.title.clone();
                    existing.description = row.description.clone();
                    existing.end_date = row.end_date;
                    existing.value = row.value.clone();
                    existing.updated_at = now;
                }
                None => {
                    let tender = Tender {
                        ocid: row.ocid.clone(),
                        id: row.id.clone(),
                        title: row.title.clone(),
                        description: row.description.clone(),
                        procurement_method: row.procurement_method.clone(),
                        procurement_method_details: row.procurement_method_details.clone(),
                        main_procurement_category: row.main_procurement_category.clone(),
                        status: None,
                        published_date: row.published_date,
                        start_date: row.start_date,
                        end_date: row.end_date,
                        procuring_entity: row.procuring_entity.clone(),
                        value: row.value.clone(),
                        created_at: now,
                        updated_at: now,
                    };
                    state.tenders.insert(row.ocid.clone(), tender);
                }
            }
        }
        Ok(batch.len() as u64)
    }

    async fn upsert_documents(&self, batch: &[NewTenderDocument]) -> Result<u64, StoreError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(orphan) = batch.iter().find(|d| !state.tenders.contains_key(&d.tender_ocid)) {
            return Err(StoreError::Constraint(format!(
                "document {} references unknown tender {}",
                orphan.document_id, orphan.tender_ocid
            )));
        }

        for row in batch {
            let existing = state.documents.iter_mut().find(|d| {
                d.tender_ocid == row.tender_ocid
                    && d.document_id.as_deref() == Some(row.document_id.as_str())
            });
            match existing {
                Some(doc) => {
                    doc.title = row.title.clone();
                    doc.description = row.description.clone();
                    doc.url = row.url.clone();
                    doc.format = row.format.clone();
                    doc.date_published = row.date_published;
                    doc.date_modified = row.date_modified;
                }
                None => {
                    state.next_document_id += 1;
                    let id = state.next_document_id;
                    state.documents.push(TenderDocument {
                        id,
                        tender_ocid: row.tender_ocid.clone(),
                        document_id: Some(row.document_id.clone()),
                        title: row.title.clone(),
                        description: row.description.clone(),
                        url: row.url.clone(),
                        format: row.format.clone(),
                        date_published: row.date_published,
                        date_modified: row.date_modified,
                    });
                }
            }
        }
        Ok(batch.len() as u64)
    }

    async fn search_tenders(
        &self,
        params: &TenderSearchParams,
        now: DateTime<Utc>,
    ) -> Result<TenderPage, StoreError> {
        let predicates = compile_predicates(&params.filters, now);
        let state = self.state.read().await;

        let mut matched: Vec<&Tender> = state
            .tenders
            .values()
            .filter(|t| matches_all(&predicates, t))
            .collect();
        matched.sort_by(|a, b| compare_tenders(a, b, params.sort_by, params.sort_order));

        let total_count = matched.len() as u64;
        let offset = usize::try_from(params.offset()).unwrap_or(usize::MAX);
        let tenders = matched
            .into_iter()
            .skip(offset)
            .take(params.limit as usize)
            .cloned()
            .collect();

        Ok(TenderPage {
            tenders,
            total_count,
            current_page: params.page.max(1),
        })
    }

    async fn filter_stats(&self, now: DateTime<Utc>) -> Result<FilterStats, StoreError> {
        let state = self.state.read().await;
        let tenders = state.tenders.values();
        Ok(FilterStats {
            procuring_entities: facet(tenders.clone().map(Tender::entity_name)),
            procurement_categories: facet(
                tenders
                    .clone()
                    .map(|t| t.main_procurement_category.as_deref()),
            ),
            procurement_methods: facet(
                tenders
                    .clone()
                    .map(|t| t.procurement_method_details.as_deref()),
            ),
            total_count: state.tenders.len() as u64,
            active_count: count_matching(&state.tenders, &Predicate::ActiveAt(now)),
            closed_count: count_matching(&state.tenders, &Predicate::ClosedAt(now)),
        })
    }

    async fn get_tender(&self, ocid: &str) -> Result<Option<Tender>, StoreError> {
        Ok(self.state.read().await.tenders.get(ocid).cloned())
    }

    async fn tender_documents(&self, ocid: &str) -> Result<Vec<TenderDocument>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .iter()
            .filter(|d| d.tender_ocid == ocid)
            .cloned()
            .collect())
    }

    async fn cleanup_duplicate_documents(&self) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let mut keep: HashMap<(String, Option<String>), i64> = HashMap::new();
        for doc in &state.documents {
            let key = (doc.tender_ocid.clone(), doc.document_id.clone());
            let min = keep.entry(key).or_insert(doc.id);
            *min = (*min).min(doc.id);
        }
        let before = state.documents.len();
        state.documents.retain(|d| {
            keep.get(&(d.tender_ocid.clone(), d.document_id.clone())) == Some(&d.id)
        });
        Ok((before - state.documents.len()) as u64)
    }

    async fn overview(&self, recent: usize) -> Result<StoreOverview, StoreError> {
        let state = self.state.read().await;
        let mut recent_tenders: Vec<&Tender> = state.tenders.values().collect();
        // Same ordering as `published_date DESC NULLS LAST, ocid ASC`.
        recent_tenders.sort_by(|a, b| match (a.published_date, b.published_date) {
            (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.ocid.cmp(&b.ocid)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.ocid.cmp(&b.ocid),
        });

        let sample_with_documents = state
            .tenders
            .values()
            .find(|t| state.documents.iter().any(|d| d.tender_ocid == t.ocid))
            .map(|t| TenderHeadline {
                ocid: t.ocid.clone(),
                title: t.title.clone(),
            });

        Ok(StoreOverview {
            tender_count: state.tenders.len() as u64,
            document_count: state.documents.len() as u64,
            recent_tenders: recent_tenders.into_iter().take(recent).cloned().collect(),
            sample_with_documents,
        })
    }
}
