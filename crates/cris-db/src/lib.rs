//! Relational catalog store access for CRIS.
//!
//! All multi-row writes go through a single generated `CASE`-per-key
//! statement; the only row-by-row path is SKU repair, where uniqueness
//! allocation has to observe each committed write.

use chrono::{DateTime, Utc};
use cris_core::{sku, CatalogRecord, PatchValue, RecordPatch, SkuSet, VerificationReport};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cris-db";

/// Largest number of key/value pairs folded into one `CASE` statement.
const MAX_CASE_PAIRS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("refusing unsafe column name {0:?}")]
    InvalidColumn(String),
}

/// Predicates identifying rows that need attention. Fragments are fixed
/// strings; all runtime values travel as bind parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    DepartmentMissing,
    SkuMatchesStockNumber,
    MissingFilterData,
    ReceiverCandidates,
}

impl RecordFilter {
    pub fn where_sql(&self) -> &'static str {
        match self {
            Self::All => "TRUE",
            Self::DepartmentMissing => "(department_number IS NULL OR department_number = '')",
            Self::SkuMatchesStockNumber => "sku = rsr_stock_number",
            Self::MissingFilterData => {
                "(capacity IS NULL OR caliber IS NULL OR caliber = '' OR barrel_length IS NULL)"
            }
            Self::ReceiverCandidates => {
                "(name ILIKE '%UPPER%' OR name ILIKE '%LOWER%' OR name ILIKE '%RCVR%' OR name ILIKE '%RECEIVER%') AND category IS DISTINCT FROM 'Uppers/Lowers'"
            }
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::All => "all records",
            Self::DepartmentMissing => "records without a department number",
            Self::SkuMatchesStockNumber => "records whose SKU is the distributor stock number",
            Self::MissingFilterData => "records missing capacity, caliber, or barrel length",
            Self::ReceiverCandidates => "receiver-keyword records outside Uppers/Lowers",
        }
    }
}

const RECORD_COLUMNS: &str = "id::bigint AS id, sku, name, description, category, \
     department_number, manufacturer, rsr_stock_number, manufacturer_part_number, \
     price_wholesale::text AS price_wholesale, price_map::text AS price_map, \
     price_msrp::text AS price_msrp, price_bronze::text AS price_bronze, \
     price_gold::text AS price_gold, price_platinum::text AS price_platinum, \
     caliber, capacity::int4 AS capacity, barrel_length::text AS barrel_length, \
     receiver_type, COALESCE(requires_ffl, FALSE) AS requires_ffl, \
     COALESCE(in_stock, FALSE) AS in_stock, stock_quantity::int4 AS stock_quantity, \
     updated_at";

fn record_from_row(row: &PgRow) -> Result<CatalogRecord, StoreError> {
    Ok(CatalogRecord {
        id: row.try_get("id")?,
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        department_number: row.try_get("department_number")?,
        manufacturer: row.try_get("manufacturer")?,
        rsr_stock_number: row.try_get("rsr_stock_number")?,
        manufacturer_part_number: row.try_get("manufacturer_part_number")?,
        price_wholesale: row.try_get("price_wholesale")?,
        price_map: row.try_get("price_map")?,
        price_msrp: row.try_get("price_msrp")?,
        price_bronze: row.try_get("price_bronze")?,
        price_gold: row.try_get("price_gold")?,
        price_platinum: row.try_get("price_platinum")?,
        caliber: row.try_get("caliber")?,
        capacity: row.try_get("capacity")?,
        barrel_length: row.try_get("barrel_length")?,
        receiver_type: row.try_get("receiver_type")?,
        requires_ffl: row.try_get("requires_ffl")?,
        in_stock: row.try_get("in_stock")?,
        stock_quantity: row.try_get("stock_quantity")?,
        updated_at: row.try_get::<Option<DateTime<Utc>>, _>("updated_at")?,
    })
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// `UPDATE products SET a = $1, b = $2, updated_at = NOW() WHERE id = $3`
fn build_update_sql(columns: &[&str]) -> String {
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = ${}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE products SET {assignments}, updated_at = NOW() WHERE id = ${}",
        columns.len() + 1
    )
}

/// One statement updating `column` for many SKUs:
/// `... SET column = CASE sku WHEN $1 THEN $2 ... END ... WHERE sku IN ($1, $3, ...)`
fn build_case_update_sql(column: &str, pair_count: usize) -> String {
    let mut branches = Vec::with_capacity(pair_count);
    let mut keys = Vec::with_capacity(pair_count);
    for i in 0..pair_count {
        let key = 2 * i + 1;
        branches.push(format!("WHEN ${key} THEN ${}", key + 1));
        keys.push(format!("${key}"));
    }
    format!(
        "UPDATE products SET {column} = CASE sku {} END, updated_at = NOW() WHERE sku IN ({})",
        branches.join(" "),
        keys.join(", ")
    )
}

fn bind_patch_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q PatchValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        PatchValue::Text(v) => query.bind(v),
        PatchValue::Int(v) => query.bind(v),
        PatchValue::Float(v) => query.bind(v),
        PatchValue::Bool(v) => query.bind(v),
        PatchValue::Null => query.bind(Option::<String>::None),
    }
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: PgPool,
}

impl CatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Keyset page: rows matching `filter` with `id > after_id`, in id
    /// order. Callers loop until an empty page comes back; there is no
    /// iteration cap.
    pub async fn next_page(
        &self,
        filter: RecordFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<CatalogRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM products WHERE {} AND id > $1 ORDER BY id LIMIT $2",
            filter.where_sql()
        );
        let rows = sqlx::query(&sql)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn count(&self, filter: RecordFilter) -> Result<i64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM products WHERE {}",
            filter.where_sql()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    /// Verification check asserting that no rows match `filter` any more.
    pub async fn verify_none_remaining(
        &self,
        filter: RecordFilter,
    ) -> Result<VerificationReport, StoreError> {
        let actual = self.count(filter).await?;
        Ok(VerificationReport::new(filter.describe(), 0, actual))
    }

    /// Apply a partial field set to a single row.
    pub async fn update_fields(&self, id: i64, patch: &RecordPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let columns: Vec<&str> = patch.fields.keys().map(String::as_str).collect();
        for column in &columns {
            if !is_safe_identifier(column) {
                return Err(StoreError::InvalidColumn((*column).to_string()));
            }
        }
        let sql = build_update_sql(&columns);
        let mut query = sqlx::query(&sql);
        for value in patch.fields.values() {
            query = bind_patch_value(query, value);
        }
        query.bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Update one column for many rows with a single statement per chunk.
    /// Every value in `pairs` must be the same [`PatchValue`] variant so the
    /// `CASE` arms share a type.
    pub async fn batch_update_column(
        &self,
        column: &str,
        pairs: &[(String, PatchValue)],
    ) -> Result<u64, StoreError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        if !is_safe_identifier(column) {
            return Err(StoreError::InvalidColumn(column.to_string()));
        }
        let mut affected = 0u64;
        for chunk in pairs.chunks(MAX_CASE_PAIRS) {
            let sql = build_case_update_sql(column, chunk.len());
            let mut query = sqlx::query(&sql);
            for (key, value) in chunk {
                query = bind_patch_value(query.bind(key), value);
            }
            let result = query.execute(&self.pool).await?;
            affected += result.rows_affected();
            debug!(column, rows = result.rows_affected(), "batched column update");
        }
        Ok(affected)
    }

    /// Reserve a SKU that collides with nothing already persisted, suffixing
    /// `-1`, `-2`, ... when the candidate is taken.
    pub async fn allocate_unique_sku(&self, candidate: &str) -> Result<String, StoreError> {
        let pattern = format!("{}-%", escape_like(candidate));
        let rows = sqlx::query("SELECT sku FROM products WHERE sku = $1 OR sku LIKE $2")
            .bind(candidate)
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await?;
        let taken: SkuSet = rows
            .iter()
            .map(|row| row.try_get::<String, _>("sku"))
            .collect::<Result<_, _>>()?;
        Ok(sku::dedupe(candidate, &taken))
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_sql_numbers_binds_in_column_order() {
        let sql = build_update_sql(&["category", "department_number"]);
        assert_eq!(
            sql,
            "UPDATE products SET category = $1, department_number = $2, \
             updated_at = NOW() WHERE id = $3"
        );
    }

    #[test]
    fn case_update_sql_reuses_key_binds_in_the_in_list() {
        let sql = build_case_update_sql("department_number", 2);
        assert_eq!(
            sql,
            "UPDATE products SET department_number = CASE sku \
             WHEN $1 THEN $2 WHEN $3 THEN $4 END, updated_at = NOW() \
             WHERE sku IN ($1, $3)"
        );
    }

    #[test]
    fn identifier_safety_rejects_injection_shapes() {
        assert!(is_safe_identifier("price_gold"));
        assert!(!is_safe_identifier("price; DROP TABLE products"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("Price"));
    }

    #[test]
    fn like_escaping_covers_wildcards() {
        assert_eq!(escape_like("MFG_456"), "MFG\\_456");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("PLAIN"), "PLAIN");
    }

    #[test]
    fn filters_are_mutually_intelligible() {
        // Each fragment must be a complete boolean expression; a quick sanity
        // pass over the strings catches accidental truncation.
        for filter in [
            RecordFilter::All,
            RecordFilter::DepartmentMissing,
            RecordFilter::SkuMatchesStockNumber,
            RecordFilter::MissingFilterData,
            RecordFilter::ReceiverCandidates,
        ] {
            assert!(!filter.where_sql().is_empty());
            assert!(!filter.describe().is_empty());
        }
    }
}
