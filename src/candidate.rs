//! Candidate discovery: the day-window watermark scan over the catalog,
//! plus the admission filter that consults Failure Memory.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use cid::Cid;

use crate::catalog::Catalog;
use crate::emit;
use crate::error::{BackupErrorKind, CatalogError, FailureStoreError};
use crate::failures::FailureStore;
use crate::metrics::events::CandidatesDiscovered;

/// One unit of backup work.
#[derive(Debug, Clone)]
pub struct BackupCandidate {
    /// Catalog row id, used for backup registration.
    pub upload_id: String,
    /// The root CID to export. This is the CID the uploader pinned.
    pub source_cid: Cid,
    /// The normalized content CID, logged alongside outcomes.
    pub content_cid: Cid,
    pub user_id: String,
}

/// Scan position: a calendar day plus a row offset within that day.
///
/// The window is left-inclusive, right-exclusive: `[day, day + 1)`. Scanning
/// one day at a time keeps OFFSET paging cheap even on catalogs with years
/// of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub day: NaiveDate,
    pub offset: i64,
}

impl Watermark {
    pub fn new(day: NaiveDate) -> Self {
        Self { day, offset: 0 }
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.day
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc()
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        Self {
            day: next_day(self.day),
            offset: 0,
        }
        .window_start()
    }

    /// Move to the next day, resetting the row offset.
    pub fn advance(&mut self) {
        self.day = next_day(self.day);
        self.offset = 0;
    }
}

fn next_day(day: NaiveDate) -> NaiveDate {
    day.checked_add_days(Days::new(1))
        .expect("scan dates are nowhere near the calendar limit")
}

/// Decides whether a discovered candidate should be attempted.
#[async_trait]
pub trait AdmissionFilter: Send + Sync {
    async fn should_admit(&self, cid: &Cid) -> Result<bool, FailureStoreError>;
}

/// Admits everything. Used when no failure memory is configured.
pub struct AdmitAll;

#[async_trait]
impl AdmissionFilter for AdmitAll {
    async fn should_admit(&self, _cid: &Cid) -> Result<bool, FailureStoreError> {
        Ok(true)
    }
}

/// Admits candidates with no recorded failure, plus candidates whose last
/// failure carries a retryable code.
pub struct RetryPolicyFilter {
    store: Arc<dyn FailureStore>,
    retryable: HashSet<BackupErrorKind>,
}

impl RetryPolicyFilter {
    pub fn new(store: Arc<dyn FailureStore>, retryable_codes: &[String]) -> Self {
        let retryable = retryable_codes
            .iter()
            .filter_map(|code| {
                let kind = BackupErrorKind::from_code(code);
                if kind.is_none() {
                    tracing::warn!(code, "ignoring unknown retryable error code");
                }
                kind
            })
            .collect();
        Self { store, retryable }
    }
}

#[async_trait]
impl AdmissionFilter for RetryPolicyFilter {
    async fn should_admit(&self, cid: &Cid) -> Result<bool, FailureStoreError> {
        match self.store.classify(cid).await? {
            None => Ok(true),
            Some(kind) => Ok(self.retryable.contains(&kind)),
        }
    }
}

/// Pull-based stream of admitted backup candidates.
///
/// Pages through the catalog one day window at a time, applying the
/// admission filter to every row. Exhausted when the window start passes
/// the current wall clock.
pub struct CandidateSource {
    catalog: Arc<dyn Catalog>,
    filter: Arc<dyn AdmissionFilter>,
    watermark: Watermark,
    page_size: i64,
    buf: VecDeque<BackupCandidate>,
    done: bool,
}

impl CandidateSource {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        filter: Arc<dyn AdmissionFilter>,
        start_date: NaiveDate,
        page_size: i64,
    ) -> Self {
        Self {
            catalog,
            filter,
            watermark: Watermark::new(start_date),
            page_size,
            buf: VecDeque::new(),
            done: false,
        }
    }

    /// Fetch up to `n` admitted candidates, or fewer once the scan is
    /// exhausted. An empty result means the scan is complete.
    pub async fn next_batch(&mut self, n: usize) -> Result<Vec<BackupCandidate>, CatalogError> {
        while self.buf.len() < n && !self.done {
            self.fill_buffer().await?;
        }
        Ok(self.buf.drain(..self.buf.len().min(n)).collect())
    }

    async fn fill_buffer(&mut self) -> Result<(), CatalogError> {
        if self.watermark.window_start() > Utc::now() {
            self.done = true;
            return Ok(());
        }

        let rows = self
            .catalog
            .fetch_page(
                self.watermark.window_start(),
                self.watermark.window_end(),
                self.watermark.offset,
                self.page_size,
            )
            .await?;

        if rows.is_empty() {
            self.watermark.advance();
            return Ok(());
        }

        tracing::debug!(
            day = %self.watermark.day,
            offset = self.watermark.offset,
            rows = rows.len(),
            "fetched candidate page"
        );
        self.watermark.offset += rows.len() as i64;
        emit!(CandidatesDiscovered {
            count: rows.len() as u64,
        });

        for row in rows {
            let source_cid = match Cid::from_str(&row.source_cid) {
                Ok(cid) => cid,
                Err(e) => {
                    tracing::warn!(
                        upload_id = %row.id,
                        cid = %row.source_cid,
                        error = %e,
                        "skipping row with unparseable source cid"
                    );
                    continue;
                }
            };
            // content_cid is normalized at write time, fall back to the
            // source cid if it fails to parse anyway.
            let content_cid = Cid::from_str(&row.content_cid).unwrap_or(source_cid);

            let admit = match self.filter.should_admit(&source_cid).await {
                Ok(admit) => admit,
                Err(e) => {
                    // Failure memory is advisory: on error, attempt the
                    // backup rather than silently dropping it.
                    tracing::warn!(cid = %source_cid, error = %e, "admission check failed, admitting");
                    true
                }
            };
            if !admit {
                tracing::debug!(cid = %source_cid, "candidate held back by failure memory");
                continue;
            }

            self.buf.push_back(BackupCandidate {
                upload_id: row.id,
                source_cid,
                content_cid,
                user_id: row.user_id,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::UploadRow;
    use std::sync::Mutex;

    const CID_V0: &str = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";

    struct FakeCatalog {
        // one entry per day offset from start
        days: Mutex<Vec<Vec<UploadRow>>>,
        start: NaiveDate,
    }

    #[async_trait]
    impl Catalog for FakeCatalog {
        async fn count_pending(&self, _since: DateTime<Utc>) -> Result<i64, CatalogError> {
            Ok(0)
        }

        async fn fetch_page(
            &self,
            from: DateTime<Utc>,
            _to: DateTime<Utc>,
            offset: i64,
            limit: i64,
        ) -> Result<Vec<UploadRow>, CatalogError> {
            let day_idx = (from.date_naive() - self.start).num_days() as usize;
            let days = self.days.lock().unwrap();
            let Some(day) = days.get(day_idx) else {
                return Ok(vec![]);
            };
            Ok(day
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn register_backup(
            &self,
            _upload_id: &str,
            _url: &str,
            _registered_at: DateTime<Utc>,
        ) -> Result<(), CatalogError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn row(id: &str, cid: &str) -> UploadRow {
        UploadRow {
            id: id.to_string(),
            source_cid: cid.to_string(),
            content_cid: cid.to_string(),
            user_id: "user-1".to_string(),
        }
    }

    #[test]
    fn test_watermark_window_bounds() {
        let wm = Watermark::new(NaiveDate::from_ymd_opt(2023, 5, 10).unwrap());
        assert_eq!(wm.window_start().to_rfc3339(), "2023-05-10T00:00:00+00:00");
        assert_eq!(wm.window_end().to_rfc3339(), "2023-05-11T00:00:00+00:00");
    }

    #[test]
    fn test_watermark_advance_resets_offset() {
        let mut wm = Watermark::new(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
        wm.offset = 42;
        wm.advance();
        assert_eq!(wm.day, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(wm.offset, 0);
    }

    #[tokio::test]
    async fn test_scan_crosses_empty_days_and_terminates() {
        crate::metrics::server::init_test();
        let start = Utc::now().date_naive() - Days::new(2);
        let catalog = Arc::new(FakeCatalog {
            // day 0 has rows, day 1 is empty, day 2 (today) has one row
            days: Mutex::new(vec![
                vec![row("u1", CID_V0), row("u2", CID_V0)],
                vec![],
                vec![row("u3", CID_V0)],
            ]),
            start,
        });

        let mut source = CandidateSource::new(catalog, Arc::new(AdmitAll), start, 100);
        let batch = source.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].upload_id, "u1");
        assert_eq!(batch[2].upload_id, "u3");

        let batch = source.next_batch(10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_cid_rows_are_skipped() {
        crate::metrics::server::init_test();
        let start = Utc::now().date_naive();
        let catalog = Arc::new(FakeCatalog {
            days: Mutex::new(vec![vec![row("u1", "not-a-cid"), row("u2", CID_V0)]]),
            start,
        });

        let mut source = CandidateSource::new(catalog, Arc::new(AdmitAll), start, 100);
        let batch = source.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].upload_id, "u2");
    }

    #[tokio::test]
    async fn test_retry_filter_keys_on_last_failure_code() {
        use crate::failures::MemoryFailureStore;

        crate::metrics::server::init_test();
        let store = Arc::new(MemoryFailureStore::default());
        let cid = Cid::from_str(CID_V0).unwrap();
        let filter = RetryPolicyFilter::new(store.clone(), &["ERR_TIMEOUT".to_string()]);

        // No failure on record: admitted.
        assert!(filter.should_admit(&cid).await.unwrap());

        store
            .record(&cid, BackupErrorKind::TooBig, "too big", Utc::now())
            .await
            .unwrap();
        assert!(!filter.should_admit(&cid).await.unwrap());

        // A later timeout failure supersedes the ERR_TOO_BIG record.
        store
            .record(&cid, BackupErrorKind::Timeout, "timed out", Utc::now())
            .await
            .unwrap();
        assert!(filter.should_admit(&cid).await.unwrap());

        store.clear(&cid).await.unwrap();
        assert!(filter.should_admit(&cid).await.unwrap());
    }
}
