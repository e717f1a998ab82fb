//! Database operations for the entries table.

use sqlx::{PgPool, Row};
use tandem_engine::{ChangeEntry, Error, Op, Watermark};

/// Key of the advisory lock held by writers. Holding it for the whole insert
/// keeps commit order equal to `seq` order, so a pull never reads past a
/// sequence number that a slower writer has yet to commit.
const PUSH_LOCK_KEY: i64 = 0x7461_6e64_656d;

/// A stored entry row from the database.
#[derive(Debug)]
pub struct StoredEntry {
    pub seq: i64,
    pub collection: String,
    pub record_id: String,
    pub op: String,
    pub patch: serde_json::Value,
    pub clock: i64,
    pub origin_id: String,
    pub local_timestamp: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEntry {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntry {
            seq: row.try_get("seq")?,
            collection: row.try_get("collection")?,
            record_id: row.try_get("record_id")?,
            op: row.try_get("op")?,
            patch: row.try_get("patch")?,
            clock: row.try_get("clock")?,
            origin_id: row.try_get("origin_id")?,
            local_timestamp: row.try_get("local_timestamp")?,
        })
    }
}

impl StoredEntry {
    /// Convert database row to an engine entry.
    pub fn to_entry(&self) -> Result<ChangeEntry, Error> {
        let op: Op = self.op.parse()?;
        let patch = match &self.patch {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                return Err(Error::InvalidPatch(format!(
                    "stored patch for seq {} is not an object: {other}",
                    self.seq
                )))
            }
        };
        Ok(ChangeEntry::new(
            self.collection.clone(),
            self.record_id.clone(),
            op,
            patch,
            self.clock as u64,
            self.origin_id.clone(),
            self.local_timestamp as u64,
        ))
    }
}

/// Insert a validated batch. Entries already present under the same
/// `(origin_id, clock)` are skipped. Returns how many rows were new.
pub async fn insert_entries(pool: &PgPool, entries: &[ChangeEntry]) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(PUSH_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    let mut inserted = 0;
    for entry in entries {
        let result = sqlx::query(
            r#"
            INSERT INTO entries (
                collection, record_id, op, patch, clock, origin_id, local_timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (origin_id, clock) DO NOTHING
            "#,
        )
        .bind(&entry.collection)
        .bind(&entry.record_id)
        .bind(entry.op.as_str())
        .bind(sqlx::types::Json(&entry.patch))
        .bind(entry.clock as i64)
        .bind(entry.origin_id.as_str())
        .bind(i64::try_from(entry.local_timestamp).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await?;

        inserted += result.rows_affected() as usize;
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Highest clock per collection accepted from `origin_id`.
pub async fn acked_for(pool: &PgPool, origin_id: &str) -> Result<Watermark, sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT collection, MAX(clock)
        FROM entries
        WHERE origin_id = $1
        GROUP BY collection
        "#,
    )
    .bind(origin_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(collection, clock)| (collection, clock as u64))
        .collect())
}

/// Highest sequence number per collection, restricted to `collections`.
pub async fn head(pool: &PgPool, collections: &[String]) -> Result<Watermark, sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT collection, MAX(seq)
        FROM entries
        WHERE collection = ANY($1)
        GROUP BY collection
        "#,
    )
    .bind(collections.to_vec())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(collection, seq)| (collection, seq as u64))
        .collect())
}

/// Entries whose sequence is past the watermark of their collection, in
/// sequence order.
pub async fn get_entries_since(
    pool: &PgPool,
    since: &Watermark,
    limit: i64,
) -> Result<Vec<StoredEntry>, sqlx::Error> {
    let (collections, seqs): (Vec<String>, Vec<i64>) = since
        .iter()
        .map(|(collection, seq)| (collection.to_string(), seq as i64))
        .unzip();

    sqlx::query_as::<_, StoredEntry>(
        r#"
        SELECT e.seq, e.collection, e.record_id, e.op, e.patch,
               e.clock, e.origin_id, e.local_timestamp
        FROM entries e
        LEFT JOIN UNNEST($1::text[], $2::bigint[]) AS w(collection, seq)
               ON w.collection = e.collection
        WHERE e.seq > COALESCE(w.seq, 0)
        ORDER BY e.seq ASC
        LIMIT $3
        "#,
    )
    .bind(collections)
    .bind(seqs)
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(op: &str, patch: serde_json::Value) -> StoredEntry {
        StoredEntry {
            seq: 7,
            collection: "tickets".into(),
            record_id: "t1".into(),
            op: op.into(),
            patch,
            clock: 3,
            origin_id: "A".into(),
            local_timestamp: 1706745600000,
        }
    }

    #[test]
    fn stored_row_converts_to_entry() {
        let entry = row("update", json!({"status": "closed"})).to_entry().unwrap();
        assert_eq!(entry.op, Op::Update);
        assert_eq!(entry.clock, 3);
        assert_eq!(entry.origin_id.as_str(), "A");
        assert_eq!(entry.patch["status"], json!("closed"));
        assert_eq!(entry.local_timestamp, 1706745600000);
    }

    #[test]
    fn malformed_rows_are_reported() {
        assert!(row("rename", json!({})).to_entry().is_err());
        assert!(row("update", json!([1, 2])).to_entry().is_err());
    }
}
