//! Column decoding shared by the repositories. Every failure names the
//! table and column so a bad row can be found by hand.

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail: detail.into(),
    }
}

pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| corrupt(table, column, e.to_string()))
}

/// Nullable column.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get::<Option<T>>(row, idx, table, column)
}

/// SQLite has no unsigned integers; a negative seq means the row is damaged.
pub fn get_seq(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<u64, StoreError> {
    let raw: i64 = get(row, idx, table, column)?;
    u64::try_from(raw).map_err(|_| corrupt(table, column, format!("negative sequence {raw}")))
}

pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format!("invalid JSON: {e}")))
}

/// Decode a `FromStr` column such as an event type or session status.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| corrupt(table, column, format!("unknown variant: {raw}")))
}

/// Bind a cursor. Cursors past `i64::MAX` clamp, which still means "everything".
pub fn seq_param(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}
