use std::collections::BTreeSet;

use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Sqlite};

use repairhub_core::domain::customer::CustomerId;
use repairhub_core::domain::request::{
    DeviceDetails, ProblemCategory, RepairRequest, RepairRequestId, RequestStatus,
};

use super::{column, format_timestamp, parse_optional_timestamp, parse_timestamp, RepositoryError};

const SELECT_REQUEST: &str = "SELECT id, customer_id, device_brand, device_model, imei,
        problem_category, problem_description, image_refs, status, version,
        created_at, updated_at, completed_at
     FROM repair_request";

pub(crate) fn request_from_row(row: &SqliteRow) -> Result<RepairRequest, RepositoryError> {
    let category: String = column(row, "problem_category")?;
    let problem_category = ProblemCategory::parse(&category)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown problem category `{category}`")))?;
    let status_raw: String = column(row, "status")?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status_raw}`")))?;
    let image_refs_json: String = column(row, "image_refs")?;
    let image_refs: BTreeSet<String> = serde_json::from_str(&image_refs_json)
        .map_err(|error| RepositoryError::Decode(format!("image_refs: {error}")))?;

    Ok(RepairRequest {
        id: RepairRequestId(column(row, "id")?),
        customer_id: CustomerId(column(row, "customer_id")?),
        device: DeviceDetails {
            brand: column(row, "device_brand")?,
            model: column(row, "device_model")?,
            imei: column(row, "imei")?,
            problem_category,
            problem_description: column(row, "problem_description")?,
        },
        image_refs,
        status,
        version: column(row, "version")?,
        created_at: parse_timestamp("created_at", column(row, "created_at")?)?,
        updated_at: parse_timestamp("updated_at", column(row, "updated_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", column(row, "completed_at")?)?,
    })
}

fn image_refs_json(request: &RepairRequest) -> Result<String, RepositoryError> {
    serde_json::to_string(&request.image_refs)
        .map_err(|error| RepositoryError::Encode(format!("image_refs: {error}")))
}

pub(crate) async fn fetch_request<'e, E>(
    executor: E,
    id: &RepairRequestId,
) -> Result<Option<RepairRequest>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("{SELECT_REQUEST} WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(request_from_row).transpose()
}

pub(crate) async fn fetch_requests_for_customer<'e, E>(
    executor: E,
    customer_id: &CustomerId,
) -> Result<Vec<RepairRequest>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "{SELECT_REQUEST} WHERE customer_id = ? ORDER BY created_at DESC, id ASC"
    ))
    .bind(&customer_id.0)
    .fetch_all(executor)
    .await?;
    rows.iter().map(request_from_row).collect()
}

pub(crate) async fn fetch_requests_with_status<'e, E>(
    executor: E,
    status: RequestStatus,
) -> Result<Vec<RepairRequest>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows =
        sqlx::query(&format!("{SELECT_REQUEST} WHERE status = ? ORDER BY created_at DESC, id ASC"))
            .bind(status.as_str())
            .fetch_all(executor)
            .await?;
    rows.iter().map(request_from_row).collect()
}

pub(crate) async fn insert_request<'e, E>(
    executor: E,
    request: &RepairRequest,
) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO repair_request (id, customer_id, device_brand, device_model, imei,
                                     problem_category, problem_description, image_refs, status,
                                     version, created_at, updated_at, completed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&request.id.0)
    .bind(&request.customer_id.0)
    .bind(&request.device.brand)
    .bind(&request.device.model)
    .bind(&request.device.imei)
    .bind(request.device.problem_category.as_str())
    .bind(&request.device.problem_description)
    .bind(image_refs_json(request)?)
    .bind(request.status.as_str())
    .bind(request.version)
    .bind(format_timestamp(&request.created_at))
    .bind(format_timestamp(&request.updated_at))
    .bind(request.completed_at.as_ref().map(format_timestamp))
    .execute(executor)
    .await?;
    Ok(())
}

/// Writes the request when the stored version still matches and bumps it. Returns the number of
/// rows written: zero means the version was stale.
pub(crate) async fn update_request_versioned<'e, E>(
    executor: E,
    request: &RepairRequest,
) -> Result<u64, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE repair_request
         SET device_brand = ?, device_model = ?, imei = ?, problem_category = ?,
             problem_description = ?, image_refs = ?, status = ?, version = version + 1,
             updated_at = ?, completed_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(&request.device.brand)
    .bind(&request.device.model)
    .bind(&request.device.imei)
    .bind(request.device.problem_category.as_str())
    .bind(&request.device.problem_description)
    .bind(image_refs_json(request)?)
    .bind(request.status.as_str())
    .bind(format_timestamp(&request.updated_at))
    .bind(request.completed_at.as_ref().map(format_timestamp))
    .bind(&request.id.0)
    .bind(request.version)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
