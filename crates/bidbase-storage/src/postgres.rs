use async_trait::async_trait;
use bidbase_core::{
    FilterOption, FilterStats, NewTender, NewTenderDocument, ProcuringEntity, Tender,
    TenderDocument, TenderPage, TenderSearchParams, TenderValue,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::query::{compile_predicates, order_clause, push_where, Predicate};
use crate::{StoreError, StoreOverview, TenderHeadline, TenderStore, FACET_LIMIT};

const TENDER_COLUMNS: &str = "ocid, id, title, description, procurement_method, \
    procurement_method_details, main_procurement_category, status, published_date, \
    start_date, end_date, procuring_entity, value, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, tender_ocid, document_id, title, description, url, \
    format, date_published, date_modified";

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgTenderStore {
    pool: PgPool,
}

impl PgTenderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        Ok(Self::new(connect_pool(database_url, max_connections).await?))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn count_where(&self, predicates: &[Predicate]) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tenders");
        push_where(&mut qb, predicates);
        let n: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(to_count(n))
    }

    async fn facet(&self, expr: &str) -> Result<Vec<FilterOption>, StoreError> {
        let sql = format!(
            "SELECT {expr} AS value, COUNT(*) AS n FROM tenders \
             WHERE {expr} IS NOT NULL AND {expr} <> '' \
             GROUP BY 1 ORDER BY 2 DESC, 1 ASC LIMIT {FACET_LIMIT}"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value: String = row.try_get("value")?;
            let n: i64 = row.try_get("n")?;
            out.push(FilterOption::new(value, to_count(n)));
        }
        Ok(out)
    }
}

fn to_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn tender_from_row(row: &PgRow) -> Result<Tender, sqlx::Error> {
    let procuring_entity: Option<Json<ProcuringEntity>> = row.try_get("procuring_entity")?;
    let value: Option<Json<TenderValue>> = row.try_get("value")?;
    Ok(Tender {
        ocid: row.try_get("ocid")?,
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        procurement_method: row.try_get("procurement_method")?,
        procurement_method_details: row.try_get("procurement_method_details")?,
        main_procurement_category: row.try_get("main_procurement_category")?,
        status: row.try_get("status")?,
        published_date: row.try_get("published_date")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        procuring_entity: procuring_entity.map(|j| j.0),
        value: value.map(|j| j.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<TenderDocument, sqlx::Error> {
    Ok(TenderDocument {
        id: row.try_get("id")?,
        tender_ocid: row.try_get("tender_ocid")?,
        document_id: row.try_get("document_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        format: row.try_get("format")?,
        date_published: row.try_get("date_published")?,
        date_modified: row.try_get("date_modified")?,
    })
}

/// Bulk tender upsert. Identity, classification, dates other than `end_date`, and the
/// procuring entity are write-once; a later ingestion never rewrites them.
pub(crate) fn tender_upsert_query(batch: &[NewTender]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO tenders (ocid, id, title, description, procurement_method, \
         procurement_method_details, main_procurement_category, published_date, start_date, \
         end_date, procuring_entity, value, updated_at) ",
    );
    qb.push_values(batch, |mut b, t| {
        b.push_bind(t.ocid.clone())
            .push_bind(t.id.clone())
            .push_bind(t.title.clone())
            .push_bind(t.description.clone())
            .push_bind(t.procurement_method.clone())
            .push_bind(t.procurement_method_details.clone())
            .push_bind(t.main_procurement_category.clone())
            .push_bind(t.published_date)
            .push_bind(t.start_date)
            .push_bind(t.end_date)
            .push_bind(t.procuring_entity.clone().map(Json))
            .push_bind(t.value.clone().map(Json))
            .push("NOW()");
    });
    qb.push(
        " ON CONFLICT (ocid) DO UPDATE SET \
         title = EXCLUDED.title, \
         description = EXCLUDED.description, \
         end_date = EXCLUDED.end_date, \
         value = EXCLUDED.value, \
         updated_at = NOW()",
    );
    qb
}

pub(crate) fn document_upsert_query(batch: &[NewTenderDocument]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO tender_documents (tender_ocid, document_id, title, description, url, \
         format, date_published, date_modified) ",
    );
    qb.push_values(batch, |mut b, d| {
        b.push_bind(d.tender_ocid.clone())
            .push_bind(d.document_id.clone())
            .push_bind(d.title.clone())
            .push_bind(d.description.clone())
            .push_bind(d.url.clone())
            .push_bind(d.format.clone())
            .push_bind(d.date_published)
            .push_bind(d.date_modified);
    });
    qb.push(
        " ON CONFLICT (tender_ocid, document_id) DO UPDATE SET \
         title = EXCLUDED.title, \
         description = EXCLUDED.description, \
         url = EXCLUDED.url, \
         format = EXCLUDED.format, \
         date_published = EXCLUDED.date_published, \
         date_modified = EXCLUDED.date_modified",
    );
    qb
}

pub(crate) fn search_queries(
    params: &TenderSearchParams,
    now: DateTime<Utc>,
) -> (QueryBuilder<'static, Postgres>, QueryBuilder<'static, Postgres>) {
    let predicates = compile_predicates(&params.filters, now);

    let mut page = QueryBuilder::new(format!("SELECT {TENDER_COLUMNS} FROM tenders"));
    push_where(&mut page, &predicates);
    page.push(" ORDER BY ")
        .push(order_clause(params.sort_by, params.sort_order))
        .push(" LIMIT ")
        .push_bind(i64::from(params.limit))
        .push(" OFFSET ")
        .push_bind(i64::try_from(params.offset()).unwrap_or(i64::MAX));

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM tenders");
    push_where(&mut count, &predicates);

    (page, count)
}

#[async_trait]
impl TenderStore for PgTenderStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_tenders(&self, batch: &[NewTender]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let result = tender_upsert_query(batch).build().execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), batch = batch.len(), "upserted tenders");
        Ok(result.rows_affected())
    }

    async fn upsert_documents(&self, batch: &[NewTenderDocument]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let result = document_upsert_query(batch).build().execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), batch = batch.len(), "upserted documents");
        Ok(result.rows_affected())
    }

    async fn search_tenders(
        &self,
        params: &TenderSearchParams,
        now: DateTime<Utc>,
    ) -> Result<TenderPage, StoreError> {
        let (mut page_q, mut count_q) = search_queries(params, now);
        let (rows, total) = tokio::try_join!(
            page_q.build().fetch_all(&self.pool),
            count_q.build_query_scalar::<i64>().fetch_one(&self.pool),
        )?;

        let tenders = rows
            .iter()
            .map(tender_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TenderPage {
            tenders,
            total_count: to_count(total),
            current_page: params.page.max(1),
        })
    }

    async fn filter_stats(&self, now: DateTime<Utc>) -> Result<FilterStats, StoreError> {
        let active_at = [Predicate::ActiveAt(now)];
        let closed_at = [Predicate::ClosedAt(now)];
        let (procuring_entities, procurement_categories, procurement_methods, total, active, closed) =
            tokio::try_join!(
                self.facet("procuring_entity->>'name'"),
                self.facet("main_procurement_category"),
                self.facet("procurement_method_details"),
                self.count_where(&[]),
                self.count_where(&active_at),
                self.count_where(&closed_at),
            )?;
        Ok(FilterStats {
            procuring_entities,
            procurement_categories,
            procurement_methods,
            total_count: total,
            active_count: active,
            closed_count: closed,
        })
    }

    async fn get_tender(&self, ocid: &str) -> Result<Option<Tender>, StoreError> {
        let sql = format!("SELECT {TENDER_COLUMNS} FROM tenders WHERE ocid = $1");
        let row = sqlx::query(&sql)
            .bind(ocid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(tender_from_row).transpose()?)
    }

    async fn tender_documents(&self, ocid: &str) -> Result<Vec<TenderDocument>, StoreError> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM tender_documents WHERE tender_ocid = $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(ocid).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(document_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn cleanup_duplicate_documents(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tender_documents
             WHERE id NOT IN (
                SELECT MIN(id)
                  FROM tender_documents
                 GROUP BY tender_ocid, document_id
             )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn overview(&self, recent: usize) -> Result<StoreOverview, StoreError> {
        let tender_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders")
            .fetch_one(&self.pool)
            .await?;
        let document_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tender_documents")
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT {TENDER_COLUMNS} FROM tenders \
             ORDER BY published_date DESC NULLS LAST, ocid ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(recent).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        let recent_tenders = rows
            .iter()
            .map(tender_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let sample = sqlx::query(
            r#"
            SELECT t.ocid, t.title
              FROM tenders t
             WHERE EXISTS (SELECT 1 FROM tender_documents d WHERE d.tender_ocid = t.ocid)
             ORDER BY t.ocid
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        let sample_with_documents = match sample {
            Some(row) => Some(TenderHeadline {
                ocid: row.try_get("ocid")?,
                title: row.try_get("title")?,
            }),
            None => None,
        };

        Ok(StoreOverview {
            tender_count: to_count(tender_count),
            document_count: to_count(document_count),
            recent_tenders,
            sample_with_documents,
        })
    }
}
