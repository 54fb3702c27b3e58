//! Append-only audit trail of destructive operations.

use std::sync::Arc;

use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::client::RowStoreClient;
use crate::codec;
use crate::codec::AUDIT_COLUMNS;
use crate::error::Result;
use crate::traits::RowBackend;
use crate::types::AuditEntry;
use crate::types::RangeSpec;
use crate::types::RowOffset;

pub struct AuditLog<B>
where
    B: RowBackend,
{
    client: Arc<RowStoreClient<B>>,
    table:  String,
}

impl<B> AuditLog<B>
where
    B: RowBackend,
{
    pub fn new<S: Into<String>>(client: Arc<RowStoreClient<B>>, table: S) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn verify_header(&self) -> Result<()> {
        self.client.verify_header(&self.table, &AUDIT_COLUMNS).await
    }

    /// Append `entry`. Entries are never updated or removed afterwards.
    #[instrument(level = "debug", skip(self, entry), fields(target = %entry.target_record_id))]
    pub async fn record(&self, entry: &AuditEntry) -> Result<RowOffset> {
        let offset = self
            .client
            .append_row(&self.table, codec::encode_audit(entry))
            .await?;
        debug!(offset, actor = %entry.actor_principal, "audit entry recorded");
        Ok(offset)
    }

    /// Every readable entry in the order of recording. Rows that don't decode are skipped.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let rows = self
            .client
            .read_range(&RangeSpec::data_rows(&self.table, AUDIT_COLUMNS.len()))
            .await?;

        Ok(rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !codec::is_blank(row))
            .filter_map(|(offset, row)| match codec::decode_audit(&self.table, offset, row) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(table = %self.table, offset, error = %err, "skipping unreadable audit row");
                    None
                }
            })
            .collect())
    }

    pub async fn entries_for(&self, record_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.target_record_id == record_id)
            .collect())
    }
}
