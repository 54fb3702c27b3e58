//! Row layout of the tenant and audit tables.

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

use crate::error::Result;
use crate::error::StoreError;
use crate::types::normalize_email;
use crate::types::AuditEntry;
use crate::types::ConfigBlob;
use crate::types::Row;
use crate::types::RowOffset;
use crate::types::TenantRecord;

pub const TENANT_COLUMNS: [&str; 5] = ["id", "principalEmail", "active", "configBlob", "lastModified"];
pub const AUDIT_COLUMNS: [&str; 5] = [
    "timestamp",
    "actorPrincipal",
    "targetRecordId",
    "targetPrincipalEmail",
    "reason",
];

const TRUE: &str = "TRUE";
const FALSE: &str = "FALSE";

// Column positions in the tenant table.
pub(crate) const COL_ID: usize = 0;
pub(crate) const COL_EMAIL: usize = 1;
const COL_ACTIVE: usize = 2;
const COL_BLOB: usize = 3;
const COL_MODIFIED: usize = 4;

/// A row with no content, which is what a deleted record leaves behind.
pub fn is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

/// The cell at `idx`; backends drop trailing empty cells so a short row reads as empty strings.
pub fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(String::as_str).unwrap_or("")
}

pub fn encode_tenant(record: &TenantRecord) -> Result<Row> {
    Ok(vec![
        record.id.clone(),
        record.principal_email.clone(),
        encode_bool(record.active).to_string(),
        record.config_blob.to_json()?,
        encode_time(&record.last_modified),
    ])
}

pub fn decode_tenant(table: &str, offset: RowOffset, row: &[String]) -> Result<TenantRecord> {
    let corrupt = |reason: String| StoreError::CorruptRow {
        table: table.to_string(),
        offset,
        reason,
    };

    let id = cell(row, COL_ID).trim();
    if id.is_empty() {
        return Err(corrupt("id is empty".into()));
    }
    let principal_email = normalize_email(cell(row, COL_EMAIL)).map_err(|e| corrupt(e.to_string()))?;
    let active = decode_bool(cell(row, COL_ACTIVE)).map_err(corrupt)?;
    let config_blob = match cell(row, COL_BLOB).trim() {
        "" => ConfigBlob::default(),
        text => ConfigBlob::parse(text).map_err(|e| corrupt(e.to_string()))?,
    };
    let last_modified = decode_time(cell(row, COL_MODIFIED)).map_err(corrupt)?;

    Ok(TenantRecord {
        id: id.to_string(),
        principal_email,
        active,
        config_blob,
        last_modified,
    })
}

pub fn encode_audit(entry: &AuditEntry) -> Row {
    vec![
        encode_time(&entry.timestamp),
        entry.actor_principal.clone(),
        entry.target_record_id.clone(),
        entry.target_principal_email.clone(),
        entry.reason.clone(),
    ]
}

pub fn decode_audit(table: &str, offset: RowOffset, row: &[String]) -> Result<AuditEntry> {
    let timestamp = decode_time(cell(row, 0)).map_err(|reason| StoreError::CorruptRow {
        table: table.to_string(),
        offset,
        reason,
    })?;
    Ok(AuditEntry {
        timestamp,
        actor_principal: cell(row, 1).to_string(),
        target_record_id: cell(row, 2).to_string(),
        target_principal_email: cell(row, 3).to_string(),
        reason: cell(row, 4).to_string(),
    })
}

fn encode_bool(value: bool) -> &'static str {
    if value {
        TRUE
    }
    else {
        FALSE
    }
}

fn decode_bool(text: &str) -> std::result::Result<bool, String> {
    match text.trim() {
        t if t.eq_ignore_ascii_case(TRUE) => Ok(true),
        t if t.eq_ignore_ascii_case(FALSE) => Ok(false),
        t => Err(format!("'{t}' is not a boolean")),
    }
}

fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn decode_time(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {e}", text.trim()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record() -> TenantRecord {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        let mut record = TenantRecord::new("0192-abc", "alice@example.com", now);
        record.config_blob.display_mode = Some("named".into());
        record
    }

    #[test]
    fn tenant_row_layout() {
        let row = encode_tenant(&record()).unwrap();
        assert_eq!(row[0], "0192-abc");
        assert_eq!(row[1], "alice@example.com");
        assert_eq!(row[2], "TRUE");
        assert!(row[3].contains(r#""displayMode":"named""#));
        assert_eq!(row[4], "2025-03-01T12:30:00Z");

        assert_eq!(decode_tenant("Tenants", 0, &row).unwrap(), record());
    }

    #[test]
    fn decoding_is_lenient_about_form() {
        let row = vec![
            " t-2 ".to_string(),
            "Bob@Example.com".to_string(),
            "false".to_string(),
        ];
        let err = decode_tenant("Tenants", 3, &row).unwrap_err();
        // Missing lastModified is still corruption.
        assert!(matches!(err, StoreError::CorruptRow { offset: 3, .. }));

        let mut row = row;
        row.push(String::new());
        row.push("2025-03-01T12:30:00.5+02:00".to_string());
        let record = decode_tenant("Tenants", 3, &row).unwrap();
        assert_eq!(record.id, "t-2");
        assert_eq!(record.principal_email, "bob@example.com");
        assert!(!record.active);
        assert_eq!(record.config_blob, ConfigBlob::default());
        assert_eq!(
            record.last_modified,
            Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap() + chrono::Duration::milliseconds(500)
        );
    }

    #[test]
    fn corrupt_rows() {
        let mut row = encode_tenant(&record()).unwrap();
        row[2] = "maybe".into();
        assert!(matches!(
            decode_tenant("Tenants", 0, &row),
            Err(StoreError::CorruptRow { ref reason, .. }) if reason.contains("maybe")
        ));

        let mut row = encode_tenant(&record()).unwrap();
        row[3] = "[]".into();
        assert!(decode_tenant("Tenants", 0, &row).is_err());
    }

    #[test]
    fn blank_rows() {
        assert!(is_blank(&[]));
        assert!(is_blank(&["".to_string(), "  ".to_string()]));
        assert!(!is_blank(&["".to_string(), "x".to_string()]));
    }
}
