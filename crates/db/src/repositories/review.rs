use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Sqlite};

use repairhub_core::domain::customer::CustomerId;
use repairhub_core::domain::request::RepairRequestId;
use repairhub_core::domain::review::{Review, ReviewId};
use repairhub_core::domain::shop::ShopId;

use super::{column, format_timestamp, parse_timestamp, RepositoryError};

const SELECT_REVIEW: &str =
    "SELECT id, request_id, customer_id, shop_id, rating, comment, created_at FROM repair_review";

fn review_from_row(row: &SqliteRow) -> Result<Review, RepositoryError> {
    let rating_raw: i64 = column(row, "rating")?;
    let rating = u8::try_from(rating_raw)
        .ok()
        .filter(|rating| (1..=5).contains(rating))
        .ok_or_else(|| RepositoryError::Decode(format!("rating out of range: {rating_raw}")))?;

    Ok(Review {
        id: ReviewId(column(row, "id")?),
        request_id: RepairRequestId(column(row, "request_id")?),
        customer_id: CustomerId(column(row, "customer_id")?),
        shop_id: ShopId(column(row, "shop_id")?),
        rating,
        comment: column(row, "comment")?,
        created_at: parse_timestamp("created_at", column(row, "created_at")?)?,
    })
}

pub(crate) async fn fetch_review_for_request<'e, E>(
    executor: E,
    request_id: &RepairRequestId,
) -> Result<Option<Review>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("{SELECT_REVIEW} WHERE request_id = ?"))
        .bind(&request_id.0)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(review_from_row).transpose()
}

pub(crate) async fn fetch_reviews_for_shop<'e, E>(
    executor: E,
    shop_id: &ShopId,
) -> Result<Vec<Review>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!("{SELECT_REVIEW} WHERE shop_id = ? ORDER BY created_at DESC, id ASC"))
        .bind(&shop_id.0)
        .fetch_all(executor)
        .await?;
    rows.iter().map(review_from_row).collect()
}

pub(crate) async fn fetch_reviews_for_customer<'e, E>(
    executor: E,
    customer_id: &CustomerId,
) -> Result<Vec<Review>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "{SELECT_REVIEW} WHERE customer_id = ? ORDER BY created_at DESC, id ASC"
    ))
    .bind(&customer_id.0)
    .fetch_all(executor)
    .await?;
    rows.iter().map(review_from_row).collect()
}

pub(crate) async fn insert_review<'e, E>(executor: E, review: &Review) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO repair_review (id, request_id, customer_id, shop_id, rating, comment, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&review.id.0)
    .bind(&review.request_id.0)
    .bind(&review.customer_id.0)
    .bind(&review.shop_id.0)
    .bind(i64::from(review.rating))
    .bind(&review.comment)
    .bind(format_timestamp(&review.created_at))
    .execute(executor)
    .await?;
    Ok(())
}
