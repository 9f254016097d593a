use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Sqlite};

use repairhub_core::domain::customer::{Customer, CustomerId};
use repairhub_core::domain::shop::{RepairShop, ShopId};

use super::{column, format_timestamp, parse_timestamp, RepositoryError};

fn customer_from_row(row: &SqliteRow) -> Result<Customer, RepositoryError> {
    Ok(Customer {
        id: CustomerId(column(row, "id")?),
        full_name: column(row, "full_name")?,
        email: column(row, "email")?,
        created_at: parse_timestamp("created_at", column(row, "created_at")?)?,
    })
}

fn shop_from_row(row: &SqliteRow) -> Result<RepairShop, RepositoryError> {
    Ok(RepairShop {
        id: ShopId(column(row, "id")?),
        shop_name: column(row, "shop_name")?,
        owner_email: column(row, "owner_email")?,
        created_at: parse_timestamp("created_at", column(row, "created_at")?)?,
    })
}

// Registration lives outside this service; the lifecycle only reads these rows to address
// notifications and check ownership.

pub(crate) async fn fetch_customer<'e, E>(
    executor: E,
    id: &CustomerId,
) -> Result<Option<Customer>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT id, full_name, email, created_at FROM customer WHERE id = ?")
        .bind(&id.0)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(customer_from_row).transpose()
}

pub(crate) async fn fetch_shop<'e, E>(
    executor: E,
    id: &ShopId,
) -> Result<Option<RepairShop>, RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row =
        sqlx::query("SELECT id, shop_name, owner_email, created_at FROM repair_shop WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(executor)
            .await?;
    row.as_ref().map(shop_from_row).transpose()
}

pub(crate) async fn upsert_customer<'e, E>(
    executor: E,
    customer: &Customer,
) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO customer (id, full_name, email, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             full_name = excluded.full_name,
             email = excluded.email",
    )
    .bind(&customer.id.0)
    .bind(&customer.full_name)
    .bind(&customer.email)
    .bind(format_timestamp(&customer.created_at))
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_shop<'e, E>(executor: E, shop: &RepairShop) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO repair_shop (id, shop_name, owner_email, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             shop_name = excluded.shop_name,
             owner_email = excluded.owner_email",
    )
    .bind(&shop.id.0)
    .bind(&shop.shop_name)
    .bind(&shop.owner_email)
    .bind(format_timestamp(&shop.created_at))
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use repairhub_core::domain::customer::{Customer, CustomerId};
    use repairhub_core::domain::shop::{RepairShop, ShopId};

    use super::{fetch_customer, fetch_shop, upsert_customer, upsert_shop};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn customer_upsert_updates_contact_details() {
        let pool = pool().await;
        let mut customer = Customer {
            id: CustomerId("C-9".to_owned()),
            full_name: "Grace".to_owned(),
            email: "grace@example.test".to_owned(),
            created_at: Utc::now(),
        };
        upsert_customer(&pool, &customer).await.expect("insert");
        customer.email = "grace.h@example.test".to_owned();
        upsert_customer(&pool, &customer).await.expect("update");

        let loaded = fetch_customer(&pool, &customer.id).await.expect("find").expect("present");
        assert_eq!(loaded, customer);
    }

    #[tokio::test]
    async fn shop_owner_email_is_unique() {
        let pool = pool().await;
        let shop = |id: &str| RepairShop {
            id: ShopId(id.to_owned()),
            shop_name: format!("Shop {id}"),
            owner_email: "owner@shops.test".to_owned(),
            created_at: Utc::now(),
        };
        upsert_shop(&pool, &shop("S-1")).await.expect("first");

        let error = upsert_shop(&pool, &shop("S-2")).await.expect_err("same owner email");
        assert!(error.is_conflict());
        assert!(fetch_shop(&pool, &ShopId("S-2".to_owned())).await.expect("find").is_none());
    }
}
