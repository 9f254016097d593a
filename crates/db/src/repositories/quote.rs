use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Sqlite};

use repairhub_core::domain::quote::{QuoteId, QuoteStatus, RepairQuote};
use repairhub_core::domain::request::RepairRequestId;
use repairhub_core::domain::shop::ShopId;

use super::{column, format_timestamp, parse_timestamp, RepositoryError};

const SELECT_QUOTE: &str = "SELECT id, request_id, shop_id, estimated_cost, description,
        estimated_days, status, accepted, created_at, updated_at
     FROM repair_quote";

pub(crate) fn quote_from_row(row: &SqliteRow) -> Result<RepairQuote, RepositoryError> {
    let cost_raw: String = column(row, "estimated_cost")?;
    let estimated_cost = Decimal::from_str(&cost_raw)
        .map_err(|error| RepositoryError::Decode(format!("estimated_cost `{cost_raw}`: {error}")))?;
    let days_raw: i64 = column(row, "estimated_days")?;
    let estimated_days = u32::try_from(days_raw)
        .map_err(|_| RepositoryError::Decode(format!("estimated_days out of range: {days_raw}")))?;
    let status_raw: String = column(row, "status")?;
    let status = QuoteStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown quote status `{status_raw}`")))?;

    Ok(RepairQuote {
        id: QuoteId(column(row, "id")?),
        request_id: RepairRequestId(column(row, "request_id")?),
        shop_id: ShopId(column(row, "shop_id")?),
        estimated_cost,
        description: column(row, "description")?,
        estimated_days,
        status,
        accepted: column(row, "accepted")?,
        created_at: parse_timestamp("created_at", column(row, "created_at")?)?,
        updated_at: parse_timestamp("updated_at", column(row, "updated_at")?)?,
    })
}

pub(crate) async fn fetch_quote<'e, E>(
    executor: E,
    id: &QuoteId,
) -> Result<Option<RepairQuote>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row =
        sqlx::query(&format!("{SELECT_QUOTE} WHERE id = ?")).bind(&id.0).fetch_optional(executor).await?;
    row.as_ref().map(quote_from_row).transpose()
}

pub(crate) async fn fetch_quotes_for_request<'e, E>(
    executor: E,
    request_id: &RepairRequestId,
    status: Option<QuoteStatus>,
) -> Result<Vec<RepairQuote>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "{SELECT_QUOTE} WHERE request_id = ? AND status = ? ORDER BY created_at ASC, id ASC"
            ))
            .bind(&request_id.0)
            .bind(status.as_str())
            .fetch_all(executor)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "{SELECT_QUOTE} WHERE request_id = ? ORDER BY created_at ASC, id ASC"
            ))
            .bind(&request_id.0)
            .fetch_all(executor)
            .await?
        }
    };
    rows.iter().map(quote_from_row).collect()
}

/// Every quote the shop submitted, newest first.
pub(crate) async fn fetch_quotes_for_shop<'e, E>(
    executor: E,
    shop_id: &ShopId,
) -> Result<Vec<RepairQuote>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "{SELECT_QUOTE} WHERE shop_id = ? ORDER BY created_at DESC, id ASC"
    ))
    .bind(&shop_id.0)
    .fetch_all(executor)
    .await?;
    rows.iter().map(quote_from_row).collect()
}

pub(crate) async fn quote_exists<'e, E>(
    executor: E,
    request_id: &RepairRequestId,
    shop_id: Option<&ShopId>,
    status: Option<QuoteStatus>,
) -> Result<bool, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM repair_quote
         WHERE request_id = ?
           AND (? IS NULL OR shop_id = ?)
           AND (? IS NULL OR status = ?)
         LIMIT 1",
    )
    .bind(&request_id.0)
    .bind(shop_id.map(|id| id.0.as_str()))
    .bind(shop_id.map(|id| id.0.as_str()))
    .bind(status.map(|status| status.as_str()))
    .bind(status.map(|status| status.as_str()))
    .fetch_optional(executor)
    .await?;
    Ok(found.is_some())
}

pub(crate) async fn insert_quote<'e, E>(executor: E, quote: &RepairQuote) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO repair_quote (id, request_id, shop_id, estimated_cost, description,
                                   estimated_days, status, accepted, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&quote.id.0)
    .bind(&quote.request_id.0)
    .bind(&quote.shop_id.0)
    .bind(quote.estimated_cost.to_string())
    .bind(&quote.description)
    .bind(i64::from(quote.estimated_days))
    .bind(quote.status.as_str())
    .bind(quote.accepted)
    .bind(format_timestamp(&quote.created_at))
    .bind(format_timestamp(&quote.updated_at))
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn update_quote<'e, E>(executor: E, quote: &RepairQuote) -> Result<u64, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE repair_quote
         SET estimated_cost = ?, description = ?, estimated_days = ?, status = ?, accepted = ?,
             updated_at = ?
         WHERE id = ?",
    )
    .bind(quote.estimated_cost.to_string())
    .bind(&quote.description)
    .bind(i64::from(quote.estimated_days))
    .bind(quote.status.as_str())
    .bind(quote.accepted)
    .bind(format_timestamp(&quote.updated_at))
    .bind(&quote.id.0)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn reject_other_quotes<'e, E>(
    executor: E,
    request_id: &RepairRequestId,
    keep: &QuoteId,
    at: DateTime<Utc>,
) -> Result<u64, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE repair_quote
         SET status = 'rejected', accepted = 0, updated_at = ?
         WHERE request_id = ? AND id <> ?",
    )
    .bind(format_timestamp(&at))
    .bind(&request_id.0)
    .bind(&keep.0)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
