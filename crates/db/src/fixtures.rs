use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

/// Canonical demo scenarios and the state each one must be in after seeding.
const SEED_SCENARIOS: &[SeedScenarioContract] = &[
    SeedScenarioContract {
        scenario: "open_request",
        request_id: "REQ-DEMO-OPEN",
        customer_id: "CUS-DEMO-ANA",
        status: "pending",
        quote_count: 2,
        accepted_quote_id: None,
        review_id: None,
        description: "Open screen repair with two competing quotes",
    },
    SeedScenarioContract {
        scenario: "accepted_request",
        request_id: "REQ-DEMO-ACCEPTED",
        customer_id: "CUS-DEMO-BEN",
        status: "accepted",
        quote_count: 2,
        accepted_quote_id: Some("QTE-DEMO-ACCEPTED-VOLT"),
        review_id: None,
        description: "Battery repair with one accepted and one rejected quote",
    },
    SeedScenarioContract {
        scenario: "completed_request",
        request_id: "REQ-DEMO-DONE",
        customer_id: "CUS-DEMO-ANA",
        status: "completed",
        quote_count: 1,
        accepted_quote_id: Some("QTE-DEMO-DONE-FIXIT"),
        review_id: Some("REV-DEMO-DONE"),
        description: "Completed charging-port repair with a five star review",
    },
];

const SEED_CUSTOMER_IDS: &[&str] = &["CUS-DEMO-ANA", "CUS-DEMO-BEN"];

const SEED_SHOP_IDS: &[&str] = &["SHP-DEMO-FIXIT", "SHP-DEMO-VOLT"];

/// Demo marketplace used by `repairhub seed` and local development.
pub struct DemoDataset;

impl DemoDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed_data.sql");

    /// Loads the dataset. Rows that already exist are left untouched.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let scenarios_seeded = SEED_SCENARIOS
            .iter()
            .map(|scenario| ScenarioSeedInfo {
                scenario: scenario.scenario,
                request_id: scenario.request_id,
                description: scenario.description,
            })
            .collect();

        Ok(SeedResult { scenarios_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let customers: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM customer WHERE id IN {}",
            sql_array_from_ids(SEED_CUSTOMER_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("customers", customers == SEED_CUSTOMER_IDS.len() as i64));

        let shops: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM repair_shop WHERE id IN {}",
            sql_array_from_ids(SEED_SHOP_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("shops", shops == SEED_SHOP_IDS.len() as i64));

        for scenario in SEED_SCENARIOS {
            let request_ok: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM repair_request WHERE id = ?1 AND customer_id = ?2 AND status = ?3)",
            )
            .bind(scenario.request_id)
            .bind(scenario.customer_id)
            .bind(scenario.status)
            .fetch_one(pool)
            .await?;
            checks.push((scenario.request_id, request_ok == 1));

            let quotes: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM repair_quote WHERE request_id = ?1")
                    .bind(scenario.request_id)
                    .fetch_one(pool)
                    .await?;
            checks.push((scenario.quotes_label(), quotes == scenario.quote_count));

            let accepted: Vec<String> = sqlx::query_scalar(
                "SELECT id FROM repair_quote WHERE request_id = ?1 AND status = 'accepted'",
            )
            .bind(scenario.request_id)
            .fetch_all(pool)
            .await?;
            let accepted_ok = match scenario.accepted_quote_id {
                Some(expected) => accepted.len() == 1 && accepted[0] == expected,
                None => accepted.is_empty(),
            };
            checks.push((scenario.accepted_label(), accepted_ok));

            if let Some(review_id) = scenario.review_id {
                let review_ok: i64 = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM repair_review WHERE id = ?1 AND request_id = ?2)",
                )
                .bind(review_id)
                .bind(scenario.request_id)
                .fetch_one(pool)
                .await?;
                checks.push((review_id, review_ok == 1));
            }
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes every demo row, children first.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        let request_ids: Vec<&str> = SEED_SCENARIOS.iter().map(|s| s.request_id).collect();
        let quoted_requests = sql_array_from_ids(&request_ids);
        let quoted_customers = sql_array_from_ids(SEED_CUSTOMER_IDS);
        let quoted_shops = sql_array_from_ids(SEED_SHOP_IDS);

        for statement in [
            format!("DELETE FROM repair_review WHERE request_id IN {quoted_requests}"),
            format!("DELETE FROM repair_quote WHERE request_id IN {quoted_requests}"),
            format!("DELETE FROM repair_request WHERE id IN {quoted_requests}"),
            format!("DELETE FROM repair_shop WHERE id IN {quoted_shops}"),
            format!("DELETE FROM customer WHERE id IN {quoted_customers}"),
        ] {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedScenarioContract {
    scenario: &'static str,
    request_id: &'static str,
    customer_id: &'static str,
    status: &'static str,
    quote_count: i64,
    accepted_quote_id: Option<&'static str>,
    review_id: Option<&'static str>,
    description: &'static str,
}

impl SeedScenarioContract {
    fn quotes_label(&self) -> &'static str {
        match self.scenario {
            "open_request" => "open_request.quotes",
            "accepted_request" => "accepted_request.quotes",
            _ => "completed_request.quotes",
        }
    }

    fn accepted_label(&self) -> &'static str {
        match self.scenario {
            "open_request" => "open_request.accepted_quote",
            "accepted_request" => "accepted_request.accepted_quote",
            _ => "completed_request.accepted_quote",
        }
    }
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{id}'")).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug)]
pub struct SeedResult {
    pub scenarios_seeded: Vec<ScenarioSeedInfo>,
}

#[derive(Debug)]
pub struct ScenarioSeedInfo {
    pub scenario: &'static str,
    pub request_id: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
