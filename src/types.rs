use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::Result;
use crate::error::StoreError;

/// One row of cells as the backend sees it.
pub type Row = Vec<String>;

/// 0-based index of a data row, i.e. not counting the header. The sheet row number is `offset + 2`.
pub type RowOffset = usize;

/// Number of header rows preceding data in every table.
pub const HEADER_ROWS: usize = 1;

#[inline]
pub fn sheet_row(offset: RowOffset) -> usize {
    offset + HEADER_ROWS + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyField {
    Id,
    PrincipalEmail,
}

impl Display for KeyField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Id => "id",
            Self::PrincipalEmail => "principalEmail",
        })
    }
}

/// A rectangular block of rows addressed in the backend's A1 notation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeSpec {
    pub table:     String,
    /// 1-based sheet row.
    pub first_row: usize,
    /// Inclusive; `None` means "until the last row of the table".
    pub last_row:  Option<usize>,
    pub columns:   usize,
}

impl RangeSpec {
    pub fn rows<S: Into<String>>(table: S, first_row: usize, last_row: usize, columns: usize) -> Self {
        Self {
            table: table.into(),
            first_row,
            last_row: Some(last_row),
            columns,
        }
    }

    pub fn from_row<S: Into<String>>(table: S, first_row: usize, columns: usize) -> Self {
        Self {
            table: table.into(),
            first_row,
            last_row: None,
            columns,
        }
    }

    pub fn header<S: Into<String>>(table: S, columns: usize) -> Self {
        Self::rows(table, 1, 1, columns)
    }

    pub fn data_row<S: Into<String>>(table: S, offset: RowOffset, columns: usize) -> Self {
        let row = sheet_row(offset);
        Self::rows(table, row, row, columns)
    }

    /// Every data row of the table.
    pub fn data_rows<S: Into<String>>(table: S, columns: usize) -> Self {
        Self::from_row(table, sheet_row(0), columns)
    }

    fn last_column(&self) -> char {
        // Tables handled here are never wider than 26 columns.
        (b'A' + (self.columns.clamp(1, 26) as u8 - 1)) as char
    }
}

impl Display for RangeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!A{}:{}", self.table, self.first_row, self.last_column())?;
        if let Some(last) = self.last_row {
            write!(f, "{last}")?;
        }
        Ok(())
    }
}

/// Values to be written over a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeUpdate {
    pub range: RangeSpec,
    pub rows:  Vec<Row>,
}

/// Tenant-specific settings.
///
/// The store treats the blob as a single atomic value. Known fields are typed; anything else is kept in `extra` and
/// written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_id:  Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id:         Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_mode:    Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published:       Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at:    Option<DateTime<Utc>>,
    /// Per-sheet column mappings: sheet name -> (logical field -> column header).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_mappings: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at:      Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at:      Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra:           Map<String, Value>,
}

impl ConfigBlob {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at: Some(created_at),
            ..Default::default()
        }
    }

    /// Parse a stored blob. Anything that is not a JSON object is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| StoreError::validation(format!("configBlob is not JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(StoreError::validation("configBlob must be a JSON object"));
        }
        serde_json::from_value(value).map_err(|e| StoreError::validation(format!("configBlob has invalid fields: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StoreError::validation(format!("configBlob cannot be serialized: {e}")))
    }

    pub fn extra(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    pub fn set_extra<S: Into<String>>(&mut self, name: S, value: Value) -> Option<Value> {
        self.extra.insert(name.into(), value)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(mode) = &self.display_mode {
            if mode.trim().is_empty() {
                return Err(StoreError::validation("displayMode must not be blank"));
            }
        }
        if self.published == Some(false) && self.published_at.is_some() {
            return Err(StoreError::validation("publishedAt is set on an unpublished config"));
        }
        // Round-trip through the text form to make sure what we store parses back.
        Self::parse(&self.to_json()?).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    pub id:              String,
    pub principal_email: String,
    pub active:          bool,
    pub config_blob:     ConfigBlob,
    pub last_modified:   DateTime<Utc>,
}

impl TenantRecord {
    pub fn new<I, E>(id: I, principal_email: E, now: DateTime<Utc>) -> Self
    where
        I: Into<String>,
        E: Into<String>,
    {
        Self {
            id:              id.into(),
            principal_email: principal_email.into(),
            active:          true,
            config_blob:     ConfigBlob::new(now),
            last_modified:   now,
        }
    }

    pub fn key(&self, field: KeyField) -> &str {
        match field {
            KeyField::Id => &self.id,
            KeyField::PrincipalEmail => &self.principal_email,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StoreError::validation("id is required"));
        }
        if normalize_email(&self.principal_email)? != self.principal_email {
            return Err(StoreError::validation(format!(
                "principalEmail '{}' is not normalized",
                self.principal_email
            )));
        }
        self.config_blob.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp:              DateTime<Utc>,
    pub actor_principal:        String,
    pub target_record_id:       String,
    pub target_principal_email: String,
    pub reason:                 String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Recorded,
    /// The row is gone but the audit append failed.
    Incomplete,
}

/// Acknowledgement of a successful delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteAck {
    pub record_id:       String,
    pub principal_email: String,
    pub audit:           AuditStatus,
}

/// Canonical form of a principal email: trimmed and lower-cased as a whole.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@') && !email.contains(char::is_whitespace)
        }
        None => false,
    };

    if valid {
        Ok(email)
    }
    else {
        Err(StoreError::validation(format!("'{email}' is not a valid principal email")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn range_notation() {
        assert_eq!(RangeSpec::header("Tenants", 5).to_string(), "Tenants!A1:E1");
        assert_eq!(RangeSpec::data_row("Tenants", 0, 5).to_string(), "Tenants!A2:E2");
        assert_eq!(RangeSpec::data_row("Tenants", 7, 5).to_string(), "Tenants!A9:E9");
        assert_eq!(RangeSpec::data_rows("AuditLog", 5).to_string(), "AuditLog!A2:E");
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  Alice@Example.COM ").unwrap(), "alice@example.com");
        assert!(normalize_email("alice").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("alice@").is_err());
        assert!(normalize_email("a@b@c").is_err());
        assert!(normalize_email("al ice@example.com").is_err());
    }

    #[test]
    fn config_blob_keeps_unknown_fields() {
        let text = r#"{"displayMode":"named","sheetTheme":{"dark":true},"columnMappings":{"Responses":{"name":"B"}}}"#;
        let blob = ConfigBlob::parse(text).unwrap();
        assert_eq!(blob.display_mode.as_deref(), Some("named"));
        assert_eq!(blob.extra("sheetTheme"), Some(&json!({"dark": true})));
        assert_eq!(blob.column_mappings["Responses"]["name"], "B");

        let back: Value = serde_json::from_str(&blob.to_json().unwrap()).unwrap();
        assert_eq!(back, serde_json::from_str::<Value>(text).unwrap());
    }

    #[test]
    fn config_blob_rejects_non_objects() {
        assert!(matches!(ConfigBlob::parse("[1, 2]"), Err(StoreError::Validation(_))));
        assert!(matches!(ConfigBlob::parse("{not json"), Err(StoreError::Validation(_))));
        assert!(matches!(
            ConfigBlob::parse(r#"{"published": "yes"}"#),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn record_validation() {
        let now = Utc::now();
        let mut record = TenantRecord::new("t-1", "alice@example.com", now);
        assert!(record.validate().is_ok());

        record.principal_email = "Alice@example.com".into();
        assert!(record.validate().is_err());

        record.principal_email = "alice@example.com".into();
        record.config_blob.display_mode = Some("  ".into());
        assert!(record.validate().is_err());
    }
}
