use std::path::Path;
use std::sync::Arc;

use bidbase_core::{StatusFilter, TenderFilters, TenderSearchParams};
use bidbase_ocds::{default_fixture_path, StaticReleaseSource};
use bidbase_storage::{MemoryTenderStore, TenderStore};
use bidbase_sync::SyncPipeline;
use chrono::{NaiveDate, TimeZone, Utc};

fn workspace_root() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn fixture_backfill_populates_store() {
    let source = StaticReleaseSource::from_fixture(default_fixture_path(workspace_root()))
        .expect("fixture loads");
    let store = Arc::new(MemoryTenderStore::new());
    let pipeline = SyncPipeline::new(store.clone(), Arc::new(source));

    let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    let summary = pipeline.run_backfill(today).await.expect("sync succeeds");
    assert_eq!(summary.fetched_releases, 4);
    assert_eq!(summary.processed_releases, 3);
    assert_eq!(summary.skipped_releases, 1);
    assert_eq!(summary.documents_upserted, 2);
    assert_eq!(summary.skipped_documents, 1);
    assert_eq!(summary.date_from, NaiveDate::from_ymd_opt(2024, 9, 1).unwrap());

    let again = pipeline.run_backfill(today).await.expect("second sync succeeds");
    assert_eq!(again.processed_releases, 3);

    let overview = store.overview(2).await.unwrap();
    assert_eq!(overview.tender_count, 3);
    assert_eq!(overview.document_count, 2);
    assert_eq!(overview.recent_tenders.len(), 2);
    assert_eq!(
        overview.sample_with_documents.map(|h| h.ocid).as_deref(),
        Some("ocds-9t57fa-100001")
    );

    let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single().unwrap();
    let filters = TenderFilters {
        keyword: Some("ROAD".into()),
        status: Some(StatusFilter::All),
        ..Default::default()
    };
    let page = store
        .search_tenders(&TenderSearchParams::new(filters, 1, 20), now)
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.tenders[0].ocid, "ocds-9t57fa-100001");
}
