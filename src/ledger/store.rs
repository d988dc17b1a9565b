//! Quote persistence on SQLite
//!
//! Holds the `outbound_quotes` table and enforces the quote status machine
//! at the storage layer: every status change goes through
//! [`QuoteStore::update_status`], which loads the current row inside the
//! transaction and rejects any move not in the transition table. Status is
//! not a free-form string anywhere above this layer.
//!
//! `delivered_at` is only ever set on a transition into `sent` or
//! `resend_sent`; readers treat a NULL `delivered_at` as "not yet confirmed
//! delivered" regardless of what `status` says.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::types::{CourierError, Result};

/// Quote delivery status, a closed state machine.
///
/// Transitions move only forward, with one exception: a delivered quote
/// (`Sent`/`ResendSent`) re-enters `Sending` when a resend is triggered.
/// A failed quote is not resendable; follow-ups on failures go through a
/// fresh dispatch instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Created,
    Sending,
    Sent,
    ResendSent,
    SendFailed,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Created => "created",
            QuoteStatus::Sending => "sending",
            QuoteStatus::Sent => "sent",
            QuoteStatus::ResendSent => "resend_sent",
            QuoteStatus::SendFailed => "send_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(QuoteStatus::Created),
            "sending" => Some(QuoteStatus::Sending),
            "sent" => Some(QuoteStatus::Sent),
            "resend_sent" => Some(QuoteStatus::ResendSent),
            "send_failed" => Some(QuoteStatus::SendFailed),
            _ => None,
        }
    }

    /// Whether `next` is a legal move from this status
    pub fn can_transition_to(self, next: QuoteStatus) -> bool {
        use QuoteStatus::*;
        matches!(
            (self, next),
            (Created, Sending)
                | (Sending, Sent)
                | (Sending, ResendSent)
                | (Sending, SendFailed)
                | (Sent, Sending)
                | (ResendSent, Sending)
        )
    }

    /// Statuses that mark a confirmed delivery
    pub fn is_delivered(self) -> bool {
        matches!(self, QuoteStatus::Sent | QuoteStatus::ResendSent)
    }
}

/// How a quote is delivered over the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Text,
    Document,
}

impl DeliveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryKind::Text => "text",
            DeliveryKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(DeliveryKind::Text),
            "document" => Some(DeliveryKind::Document),
            _ => None,
        }
    }
}

/// One line of a quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total: f64,
}

/// A persisted outbound quote
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundQuote {
    pub id: i64,
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub line_items: Vec<LineItem>,
    pub total_amount: f64,
    pub delivery_kind: DeliveryKind,
    pub status: QuoteStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Fields for a quote row that does not exist yet
#[derive(Debug, Clone)]
pub struct NewQuote {
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub line_items: Vec<LineItem>,
    pub total_amount: f64,
    pub delivery_kind: DeliveryKind,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbound_quotes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_name TEXT NOT NULL,
    customer_address TEXT,
    line_items TEXT NOT NULL,
    total_amount REAL NOT NULL,
    delivery_kind TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    delivered_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_outbound_quotes_status ON outbound_quotes (status);
"#;

/// SQLite-backed store for outbound quotes
#[derive(Clone)]
pub struct QuoteStore {
    pool: SqlitePool,
}

impl QuoteStore {
    /// Open (and initialize) the quote database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every handle on
    /// the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new quote row with the given initial status.
    ///
    /// Runs in a single transaction so the insert is never partially
    /// visible. Returns the new row id.
    pub async fn insert_quote(&self, quote: &NewQuote, status: QuoteStatus) -> Result<i64> {
        let line_items = serde_json::to_string(&quote.line_items)?;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
INSERT INTO outbound_quotes
    (customer_name, customer_address, line_items, total_amount, delivery_kind, status, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(quote.customer_name.clone())
        .bind(quote.customer_address.clone())
        .bind(line_items)
        .bind(quote.total_amount)
        .bind(quote.delivery_kind.as_str())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Load a quote by id
    pub async fn get_quote(&self, id: i64) -> Result<Option<OutboundQuote>> {
        let row = sqlx::query("SELECT * FROM outbound_quotes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_quote(&r)).transpose()
    }

    /// List quotes, most recent first
    pub async fn list_quotes(&self, limit: i64) -> Result<Vec<OutboundQuote>> {
        let rows = sqlx::query("SELECT * FROM outbound_quotes ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_quote).collect()
    }

    /// Apply a status transition.
    ///
    /// Loads the current status inside the transaction and rejects moves not
    /// in the transition table. `delivered_at` is stamped only when `next`
    /// marks a confirmed delivery and is left untouched otherwise.
    pub async fn update_status(&self, id: i64, next: QuoteStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM outbound_quotes WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(CourierError::Ledger(format!("quote {id} not found")));
        };
        let raw: String = row.try_get("status")?;
        let current = QuoteStatus::parse(&raw)
            .ok_or_else(|| CourierError::Ledger(format!("quote {id} has unknown status {raw:?}")))?;
        if !current.can_transition_to(next) {
            return Err(CourierError::Ledger(format!(
                "illegal status transition {} -> {} for quote {}",
                current.as_str(),
                next.as_str(),
                id
            )));
        }
        if next.is_delivered() {
            sqlx::query("UPDATE outbound_quotes SET status = ?, delivered_at = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(Utc::now())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE outbound_quotes SET status = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Startup recovery: quotes stuck in `sending` from a previous process
    /// life are marked `send_failed` once they are older than `older_than`.
    /// Returns how many rows were swept.
    pub async fn sweep_stale_sending(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query(
            "UPDATE outbound_quotes SET status = ? WHERE status = ? AND created_at < ?",
        )
        .bind(QuoteStatus::SendFailed.as_str())
        .bind(QuoteStatus::Sending.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let swept = result.rows_affected();
        if swept > 0 {
            info!(swept, "Marked stale sending quotes as send_failed");
        }
        Ok(swept)
    }

    /// Number of quote rows (test and status reporting helper)
    pub async fn quote_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM outbound_quotes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) async fn force_status(&self, id: i64, status: QuoteStatus) -> Result<()> {
        sqlx::query("UPDATE outbound_quotes SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: i64, created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE outbound_quotes SET created_at = ? WHERE id = ?")
            .bind(created_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_quote(row: &SqliteRow) -> Result<OutboundQuote> {
    let line_items: String = row.try_get("line_items")?;
    let delivery_kind: String = row.try_get("delivery_kind")?;
    let status: String = row.try_get("status")?;
    Ok(OutboundQuote {
        id: row.try_get("id")?,
        customer_name: row.try_get("customer_name")?,
        customer_address: row.try_get("customer_address")?,
        line_items: serde_json::from_str(&line_items)?,
        total_amount: row.try_get("total_amount")?,
        delivery_kind: DeliveryKind::parse(&delivery_kind)
            .ok_or_else(|| CourierError::Ledger(format!("unknown delivery kind {delivery_kind:?}")))?,
        status: QuoteStatus::parse(&status)
            .ok_or_else(|| CourierError::Ledger(format!("unknown status {status:?}")))?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}
