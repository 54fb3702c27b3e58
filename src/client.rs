//! Remote row store client.
//!
//! A thin wrapper over a [`RowBackend`]. It splits batch requests the backend would refuse, retries calls that
//! failed for transient reasons, and bounds every attempt with a timeout. It keeps no state between calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::BackendError;
use crate::error::Result;
use crate::error::StoreError;
use crate::traits::RowBackend;
use crate::types::RangeSpec;
use crate::types::RangeUpdate;
use crate::types::Row;
use crate::types::RowOffset;

#[derive(Debug)]
pub struct RowStoreClient<B>
where
    B: RowBackend,
{
    backend:              Arc<B>,
    max_ranges_per_batch: usize,
    max_retries:          u32,
    base_retry_delay:     Duration,
    max_retry_delay:      Duration,
    call_timeout:         Duration,
}

impl<B> RowStoreClient<B>
where
    B: RowBackend,
{
    pub fn new(backend: Arc<B>, config: &StoreConfig) -> Self {
        Self {
            backend,
            max_ranges_per_batch: config.max_ranges_per_batch().max(1),
            max_retries: config.max_retries(),
            base_retry_delay: config.base_retry_delay(),
            max_retry_delay: config.max_retry_delay(),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[instrument(level = "trace", skip(self), fields(range = %range))]
    pub async fn read_range(&self, range: &RangeSpec) -> Result<Vec<Row>> {
        self.call("read_range", || self.backend.read_range(range)).await
    }

    /// A single data row, `None` if the table ends before it.
    pub async fn read_row(&self, table: &str, offset: RowOffset, columns: usize) -> Result<Option<Row>> {
        let rows = self.read_range(&RangeSpec::data_row(table, offset, columns)).await?;
        Ok(rows.into_iter().next())
    }

    /// Read any number of ranges. Requests over the batch limit go out as several sequential calls; results come back
    /// in request order.
    #[instrument(level = "trace", skip(self, ranges), fields(ranges = ranges.len()))]
    pub async fn batch_read(&self, ranges: &[RangeSpec]) -> Result<Vec<Vec<Row>>> {
        let mut results = Vec::with_capacity(ranges.len());
        for chunk in ranges.chunks(self.max_ranges_per_batch) {
            let rows = self.call("batch_read", || self.backend.batch_read(chunk)).await?;
            if rows.len() != chunk.len() {
                return Err(StoreError::Fatal {
                    operation: "batch_read",
                    source:    BackendError::Malformed(format!(
                        "requested {} ranges, received {} results",
                        chunk.len(),
                        rows.len()
                    )),
                });
            }
            results.extend(rows);
        }
        Ok(results)
    }

    /// Write any number of ranges. Returns the number of updated cells.
    #[instrument(level = "trace", skip(self, updates), fields(updates = updates.len()))]
    pub async fn batch_write(&self, updates: &[RangeUpdate]) -> Result<usize> {
        let mut cells = 0;
        for chunk in updates.chunks(self.max_ranges_per_batch) {
            cells += self.call("batch_write", || self.backend.batch_write(chunk)).await?;
        }
        Ok(cells)
    }

    pub async fn write_row(&self, table: &str, offset: RowOffset, row: Row) -> Result<usize> {
        let update = RangeUpdate {
            range: RangeSpec::data_row(table, offset, row.len()),
            rows:  vec![row],
        };
        self.batch_write(std::slice::from_ref(&update)).await
    }

    /// Blank every cell of a data row. The row itself stays so offsets of the following rows don't move.
    pub async fn clear_row(&self, table: &str, offset: RowOffset, columns: usize) -> Result<usize> {
        self.write_row(table, offset, vec![String::new(); columns]).await
    }

    #[instrument(level = "trace", skip(self, row))]
    pub async fn append_row(&self, table: &str, row: Row) -> Result<RowOffset> {
        self.call("append_row", || self.backend.append_row(table, row.clone())).await
    }

    pub async fn modified_at(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        self.call("modified_at", || self.backend.modified_at(table)).await
    }

    /// Make sure the header row of `table` is exactly `expected`. Trailing empty cells are ignored.
    #[instrument(level = "debug", skip(self, expected))]
    pub async fn verify_header(&self, table: &str, expected: &[&str]) -> Result<()> {
        let rows = self.read_range(&RangeSpec::header(table, expected.len())).await?;
        let mut found = rows.into_iter().next().unwrap_or_default();
        while found.last().is_some_and(|cell| cell.trim().is_empty()) {
            found.pop();
        }

        if found.len() == expected.len() && found.iter().zip(expected).all(|(f, e)| f.trim() == *e) {
            Ok(())
        }
        else {
            Err(StoreError::SchemaMismatch {
                table: table.to_string(),
                expected: expected.iter().map(|s| s.to_string()).collect(),
                found,
            })
        }
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, attempt_fn()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BackendError::Timeout(self.call_timeout)),
            };

            match outcome {
                Ok(value) => {
                    trace!(operation, attempt, "remote call succeeded");
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    if attempt > self.max_retries {
                        return Err(StoreError::Transient {
                            operation,
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = self.backoff(attempt);
                    warn!(operation, attempt, ?delay, error = %err, "remote call failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(StoreError::Fatal { operation, source: err }),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::test::ManualClock;
    use crate::test::MemoryBackend;
    use crate::test::Op;

    fn config() -> StoreConfig {
        StoreConfig::builder()
            .max_retries(3)
            .base_retry_delay(Duration::from_millis(100))
            .max_retry_delay(Duration::from_millis(250))
            .call_timeout(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    fn client_with_rows(count: usize) -> (Arc<MemoryBackend>, RowStoreClient<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new(Arc::new(ManualClock::default())));
        backend.create_table("Sheet", &["value"]);
        for i in 0..count {
            backend.push_row("Sheet", vec![format!("r{i}")]);
        }
        let client = RowStoreClient::new(Arc::clone(&backend), &config());
        (backend, client)
    }

    #[tokio::test]
    async fn batch_read_is_chunked_in_order() {
        let (backend, client) = client_with_rows(250);
        let ranges = (0..250)
            .map(|i| RangeSpec::data_row("Sheet", i, 1))
            .collect::<Vec<_>>();

        let results = client.batch_read(&ranges).await.unwrap();

        assert_eq!(backend.calls(Op::BatchRead), 3);
        assert_eq!(results.len(), 250);
        for (i, rows) in results.iter().enumerate() {
            assert_eq!(rows, &vec![vec![format!("r{i}")]]);
        }
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let (backend, client) = client_with_rows(1);
        assert!(client.batch_read(&[]).await.unwrap().is_empty());
        assert_eq!(client.batch_write(&[]).await.unwrap(), 0);
        assert_eq!(backend.calls(Op::BatchRead), 0);
        assert_eq!(backend.calls(Op::BatchWrite), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff() {
        let (backend, client) = client_with_rows(1);
        backend.fail_times(Op::ReadRange, BackendError::RateLimited("quota".into()), 2);

        let started = tokio::time::Instant::now();
        let rows = client.read_range(&RangeSpec::data_row("Sheet", 0, 1)).await.unwrap();

        assert_eq!(rows, vec![vec!["r0".to_string()]]);
        assert_eq!(backend.calls(Op::ReadRange), 3);
        // 100ms, then 200ms.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_transient() {
        let (backend, client) = client_with_rows(1);
        backend.fail_times(Op::ReadRange, BackendError::Network("reset".into()), 10);

        let started = tokio::time::Instant::now();
        let err = client
            .read_range(&RangeSpec::data_row("Sheet", 0, 1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Transient {
                operation: "read_range",
                attempts: 4,
                ..
            }
        ));
        assert!(err.is_transient());
        assert_eq!(backend.calls(Op::ReadRange), 4);
        // 100 + 200 + 250 (capped)
        assert!(started.elapsed() >= Duration::from_millis(550));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let (backend, client) = client_with_rows(1);
        backend.fail_times(Op::AppendRow, BackendError::PermissionDenied("read-only".into()), 1);

        let err = client.append_row("Sheet", vec!["x".into()]).await.unwrap_err();

        assert!(matches!(
            err,
            StoreError::Fatal {
                operation: "append_row",
                source:    BackendError::PermissionDenied(_),
            }
        ));
        assert!(!err.is_transient());
        assert_eq!(backend.calls(Op::AppendRow), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let (backend, client) = client_with_rows(1);
        backend.set_latency(Some(Duration::from_secs(5)));

        let err = client
            .read_range(&RangeSpec::data_row("Sheet", 0, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Transient { ref message, .. } if message.contains("timed out")));
        assert_eq!(backend.calls(Op::ReadRange), 4);
    }

    #[tokio::test]
    async fn header_verification() {
        let (_backend, client) = client_with_rows(0);
        client.verify_header("Sheet", &["value"]).await.unwrap();

        let err = client.verify_header("Sheet", &["value", "extra"]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SchemaMismatch { ref table, ref found, .. }
                if table == "Sheet" && found == &vec!["value".to_string()]
        ));
    }

    #[tokio::test]
    async fn clear_row_keeps_offsets() {
        let (backend, client) = client_with_rows(3);
        client.clear_row("Sheet", 1, 1).await.unwrap();

        assert_eq!(
            backend.rows("Sheet"),
            vec![vec!["r0".to_string()], vec![String::new()], vec!["r2".to_string()]]
        );
    }

    struct ShortBatches;

    #[async_trait]
    impl RowBackend for ShortBatches {
        async fn read_range(&self, range: &RangeSpec) -> std::result::Result<Vec<Row>, BackendError> {
            Err(BackendError::NotFound(range.to_string()))
        }

        async fn batch_read(&self, ranges: &[RangeSpec]) -> std::result::Result<Vec<Vec<Row>>, BackendError> {
            Ok(vec![Vec::new(); ranges.len().saturating_sub(1)])
        }

        async fn batch_write(&self, _updates: &[RangeUpdate]) -> std::result::Result<usize, BackendError> {
            Ok(0)
        }

        async fn append_row(&self, table: &str, _row: Row) -> std::result::Result<RowOffset, BackendError> {
            Err(BackendError::NotFound(table.to_string()))
        }
    }

    #[tokio::test]
    async fn short_batch_answer_is_malformed() {
        let client = RowStoreClient::new(Arc::new(ShortBatches), &config());
        let err = client
            .batch_read(&[RangeSpec::data_row("Sheet", 0, 1), RangeSpec::data_row("Sheet", 1, 1)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Fatal {
                source: BackendError::Malformed(_),
                ..
            }
        ));
    }
}
