use std::collections::HashMap;

use bidbase_core::ocds::{parse_timestamp, Release};
use bidbase_core::{NewTender, NewTenderDocument, UNTITLED_TENDER};
use tracing::warn;

/// Rows derived from one window of releases, ready for batched upserts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedReleases {
    pub tenders: Vec<NewTender>,
    pub documents: Vec<NewTenderDocument>,
    pub skipped_releases: usize,
    pub skipped_documents: usize,
}

/// Map one release into its tender row and documents. Releases without an OCID yield `None`.
pub fn map_release(release: &Release) -> Option<(NewTender, Vec<NewTenderDocument>, usize)> {
    let ocid = release.key()?.to_string();
    let tender = release.tender.as_ref();
    let period = tender.and_then(|t| t.tender_period.as_ref());

    let row = NewTender {
        ocid: ocid.clone(),
        id: tender.and_then(|t| t.id.clone()),
        title: tender
            .and_then(|t| t.title.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(UNTITLED_TENDER)
            .to_string(),
        description: tender.and_then(|t| t.description.clone()),
        procurement_method: tender.and_then(|t| t.procurement_method.clone()),
        procurement_method_details: tender.and_then(|t| t.procurement_method_details.clone()),
        main_procurement_category: tender.and_then(|t| t.main_procurement_category.clone()),
        published_date: release.date.as_deref().and_then(parse_timestamp),
        start_date: period
            .and_then(|p| p.start_date.as_deref())
            .and_then(parse_timestamp),
        end_date: period
            .and_then(|p| p.end_date.as_deref())
            .and_then(parse_timestamp),
        procuring_entity: tender
            .and_then(|t| t.procuring_entity.clone())
            .or_else(|| release.buyer.clone()),
        value: tender.and_then(|t| t.value.clone()),
    };

    let mut skipped = 0usize;
    let documents = tender
        .map(|t| t.documents.as_slice())
        .unwrap_or_default()
        .iter()
        .filter_map(|doc| {
            let Some(document_id) = doc.id.as_deref().map(str::trim).filter(|s| !s.is_empty())
            else {
                skipped += 1;
                return None;
            };
            Some(NewTenderDocument {
                tender_ocid: ocid.clone(),
                document_id: document_id.to_string(),
                title: doc.title.clone(),
                description: doc.description.clone(),
                url: doc.url.clone(),
                format: doc.format.clone(),
                date_published: doc.date_published.as_deref().and_then(parse_timestamp),
                date_modified: doc.date_modified.as_deref().and_then(parse_timestamp),
            })
        })
        .collect();

    Some((row, documents, skipped))
}

/// Map a whole window. Duplicate keys collapse to their last occurrence while keeping
/// first-seen order, so no single bulk upsert touches the same row twice.
pub fn map_releases(releases: &[Release]) -> MappedReleases {
    let mut out = MappedReleases::default();
    let mut tender_index: HashMap<String, usize> = HashMap::new();
    let mut document_index: HashMap<(String, String), usize> = HashMap::new();

    for (position, release) in releases.iter().enumerate() {
        let Some((tender, documents, skipped_docs)) = map_release(release) else {
            warn!(position, release_id = ?release.id, "skipping release without ocid");
            out.skipped_releases += 1;
            continue;
        };
        if skipped_docs > 0 {
            warn!(ocid = %tender.ocid, skipped_docs, "skipping documents without id");
        }
        out.skipped_documents += skipped_docs;

        match tender_index.get(&tender.ocid) {
            Some(&idx) => out.tenders[idx] = tender,
            None => {
                tender_index.insert(tender.ocid.clone(), out.tenders.len());
                out.tenders.push(tender);
            }
        }

        for doc in documents {
            let key = (doc.tender_ocid.clone(), doc.document_id.clone());
            match document_index.get(&key) {
                Some(&idx) => out.documents[idx] = doc,
                None => {
                    document_index.insert(key, out.documents.len());
                    out.documents.push(doc);
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidbase_core::ocds::{OcdsDocument, OcdsTender, Period};
    use bidbase_core::{ProcuringEntity, TenderValue};
    use chrono::{TimeZone, Utc};

    fn release(ocid: &str, title: Option<&str>) -> Release {
        Release {
            ocid: Some(ocid.to_string()),
            date: Some("2025-02-01T08:30:00Z".into()),
            tender: Some(OcdsTender {
                id: Some(format!("{ocid}-t")),
                title: title.map(str::to_string),
                procurement_method: Some("open".into()),
                tender_period: Some(Period {
                    start_date: Some("2025-02-01T09:00:00".into()),
                    end_date: Some("2025-03-01T11:00:00Z".into()),
                }),
                value: Some(TenderValue {
                    amount: Some(1000.0),
                    currency: Some("ZAR".into()),
                }),
                documents: vec![OcdsDocument {
                    id: Some("doc-1".into()),
                    title: Some("Spec".into()),
                    url: Some("https://example.test/spec.pdf".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn maps_fields_and_defaults_missing_title() {
        let (row, docs, skipped) = map_release(&release("ocds-1", None)).expect("keyed release");
        assert_eq!(row.title, UNTITLED_TENDER);
        assert_eq!(row.id.as_deref(), Some("ocds-1-t"));
        assert_eq!(
            row.published_date,
            Utc.with_ymd_and_hms(2025, 2, 1, 8, 30, 0).single()
        );
        assert_eq!(
            row.start_date,
            Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).single()
        );
        assert_eq!(row.end_date, Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).single());
        assert_eq!(row.value.and_then(|v| v.amount), Some(1000.0));
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].tender_ocid, "ocds-1");
        assert_eq!(skipped, 0);
    }

    #[test]
    fn buyer_fills_in_for_missing_procuring_entity() {
        let mut r = release("ocds-2", Some("Roads"));
        r.buyer = Some(ProcuringEntity {
            id: Some("za-1".into()),
            name: Some("City of X".into()),
        });
        let (row, _, _) = map_release(&r).unwrap();
        assert_eq!(row.procuring_entity.unwrap().name.as_deref(), Some("City of X"));

        r.tender.as_mut().unwrap().procuring_entity = Some(ProcuringEntity {
            id: None,
            name: Some("Dept of Y".into()),
        });
        let (row, _, _) = map_release(&r).unwrap();
        assert_eq!(row.procuring_entity.unwrap().name.as_deref(), Some("Dept of Y"));
    }

    #[test]
    fn release_without_tender_still_maps() {
        let r = Release {
            ocid: Some("ocds-bare".into()),
            ..Default::default()
        };
        let (row, docs, _) = map_release(&r).unwrap();
        assert_eq!(row.title, UNTITLED_TENDER);
        assert!(row.end_date.is_none());
        assert!(docs.is_empty());
    }

    #[test]
    fn unkeyed_releases_and_documents_are_skipped() {
        let mut keyed = release("ocds-3", Some("Water"));
        keyed
            .tender
            .as_mut()
            .unwrap()
            .documents
            .push(OcdsDocument::default());
        let unkeyed = Release {
            ocid: None,
            ..release("ignored", Some("No key"))
        };

        let mapped = map_releases(&[keyed, unkeyed]);
        assert_eq!(mapped.tenders.len(), 1);
        assert_eq!(mapped.skipped_releases, 1);
        assert_eq!(mapped.documents.len(), 1);
        assert_eq!(mapped.skipped_documents, 1);
    }

    #[test]
    fn duplicates_collapse_to_last_occurrence() {
        let first = release("ocds-4", Some("First title"));
        let mut second = release("ocds-4", Some("Second title"));
        second.tender.as_mut().unwrap().documents[0].title = Some("Spec v2".into());
        let other = release("ocds-5", Some("Other"));

        let mapped = map_releases(&[first, other, second]);
        assert_eq!(mapped.tenders.len(), 2);
        assert_eq!(mapped.tenders[0].ocid, "ocds-4");
        assert_eq!(mapped.tenders[0].title, "Second title");
        assert_eq!(mapped.documents.len(), 2);
        assert_eq!(mapped.documents[0].title.as_deref(), Some("Spec v2"));
    }
}
