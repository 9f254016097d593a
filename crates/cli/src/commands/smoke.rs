use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use repairhub_core::audit::TracingAuditSink;
use repairhub_core::config::{AppConfig, LoadOptions};
use repairhub_core::notifications::NoopNotificationDispatcher;
use repairhub_core::{
    Actor, Customer, CustomerId, DeviceDetails, ProblemCategory, QuoteDraft, QuoteId,
    QuoteStatus, RepairLifecycleService, RepairRequestId, RepairShop, RepairStore, RequestDraft,
    RequestStatus, ShopId,
};
use repairhub_db::{connect_with_settings, migrations, DbPool, SqlRepairStore};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::commands::CommandResult;

/// Smoke runs against a private database so it never touches operator data.
const SMOKE_DATABASE_URL: &str = "sqlite::memory:";

const SMOKE_CUSTOMER: &str = "CUS-SMOKE";
const SMOKE_SHOP_WINNER: &str = "SHP-SMOKE-A";
const SMOKE_SHOP_RUNNER_UP: &str = "SHP-SMOKE-B";

const LIFECYCLE_STEPS: [&str; 9] = [
    "db_connectivity",
    "migrations",
    "directory_seed",
    "create_request",
    "submit_quotes",
    "accept_quote",
    "start_repair",
    "complete_repair",
    "submit_review",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

/// State carried from one lifecycle step to the next.
#[derive(Default)]
struct SmokeContext {
    pool: Option<DbPool>,
    service: Option<RepairLifecycleService<SqlRepairStore>>,
    request_id: Option<RepairRequestId>,
    winning_quote: Option<QuoteId>,
}

impl SmokeContext {
    fn pool(&self) -> Result<&DbPool, String> {
        self.pool.as_ref().ok_or_else(|| "database pool is not open".to_string())
    }

    fn service(&self) -> Result<&RepairLifecycleService<SqlRepairStore>, String> {
        self.service.as_ref().ok_or_else(|| "lifecycle service is not wired".to_string())
    }

    fn request_id(&self) -> Result<&RepairRequestId, String> {
        self.request_id.as_ref().ok_or_else(|| "no repair request was created".to_string())
    }
}

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.extend(LIFECYCLE_STEPS.iter().map(|step| skipped(step)));
            return finalize_report(checks, elapsed_since(started));
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: LIFECYCLE_STEPS[0],
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.extend(LIFECYCLE_STEPS[1..].iter().map(|step| skipped(step)));
            return finalize_report(checks, elapsed_since(started));
        }
    };

    runtime.block_on(async {
        let mut context = SmokeContext::default();
        let mut failed = false;

        for step in LIFECYCLE_STEPS {
            if failed {
                checks.push(skipped(step));
                continue;
            }

            let step_started = Instant::now();
            let outcome = run_step(step, &config, &mut context).await;
            let elapsed_ms = elapsed_since(step_started);
            match outcome {
                Ok(message) => checks.push(SmokeCheck {
                    name: step,
                    status: SmokeStatus::Pass,
                    elapsed_ms,
                    message,
                }),
                Err(message) => {
                    failed = true;
                    checks.push(SmokeCheck {
                        name: step,
                        status: SmokeStatus::Fail,
                        elapsed_ms,
                        message,
                    });
                }
            }
        }

        drop(context.service.take());
        if let Some(pool) = context.pool.take() {
            pool.close().await;
        }
    });

    finalize_report(checks, elapsed_since(started))
}

async fn run_step(
    step: &'static str,
    config: &AppConfig,
    context: &mut SmokeContext,
) -> Result<String, String> {
    match step {
        "db_connectivity" => {
            let pool = connect_with_settings(SMOKE_DATABASE_URL, 1, config.database.timeout_secs)
                .await
                .map_err(|error| format!("failed to connect: {error}"))?;
            context.pool = Some(pool);
            Ok(format!("connected using `{SMOKE_DATABASE_URL}`"))
        }
        "migrations" => {
            let pool = context.pool()?.clone();
            migrations::run_pending(&pool)
                .await
                .map_err(|error| format!("migration execution failed: {error}"))?;
            context.service = Some(RepairLifecycleService::new(
                SqlRepairStore::new(pool),
                Arc::new(NoopNotificationDispatcher),
                Arc::new(TracingAuditSink),
            ));
            Ok("migrations applied to a fresh database".to_string())
        }
        "directory_seed" => {
            seed_directory(context.service()?).await?;
            Ok("registered one customer and two shops".to_string())
        }
        "create_request" => {
            let request = context
                .service()?
                .create_request(&CustomerId(SMOKE_CUSTOMER.to_string()), smoke_request_draft())
                .await
                .map_err(|error| error.to_string())?;
            expect_status(request.status, RequestStatus::Pending)?;
            let message = format!("created {} in status {}", request.id.0, request.status.as_str());
            context.request_id = Some(request.id);
            Ok(message)
        }
        "submit_quotes" => {
            let service = context.service()?;
            let request_id = context.request_id()?;

            let winner = service
                .submit_quote(&ShopId(SMOKE_SHOP_WINNER.to_string()), request_id, quote(5000))
                .await
                .map_err(|error| error.to_string())?;
            service
                .submit_quote(&ShopId(SMOKE_SHOP_RUNNER_UP.to_string()), request_id, quote(7000))
                .await
                .map_err(|error| error.to_string())?;

            let quotes =
                service.quotes_for_request(request_id).await.map_err(|error| error.to_string())?;
            if quotes.len() != 2 {
                return Err(format!("expected 2 quotes, found {}", quotes.len()));
            }
            context.winning_quote = Some(winner.id);
            Ok("two shops quoted the request".to_string())
        }
        "accept_quote" => {
            let quote_id = context
                .winning_quote
                .as_ref()
                .ok_or_else(|| "no quote available to accept".to_string())?;
            let outcome = context
                .service()?
                .accept_quote(&CustomerId(SMOKE_CUSTOMER.to_string()), quote_id)
                .await
                .map_err(|error| error.to_string())?;

            expect_status(outcome.request.status, RequestStatus::Accepted)?;
            if outcome.quote.status != QuoteStatus::Accepted || outcome.rejected_quotes != 1 {
                return Err(format!(
                    "expected one accepted and one rejected quote, got {} rejected",
                    outcome.rejected_quotes
                ));
            }
            Ok(format!("accepted {} and rejected the competing quote", quote_id.0))
        }
        "start_repair" => {
            let request = context
                .service()?
                .start_repair(
                    &ShopId(SMOKE_SHOP_WINNER.to_string()),
                    context.request_id()?,
                    smoke_request_draft().device,
                )
                .await
                .map_err(|error| error.to_string())?;
            expect_status(request.status, RequestStatus::InProgress)?;
            Ok("assigned shop started the repair".to_string())
        }
        "complete_repair" => {
            let request = context
                .service()?
                .transition_request(
                    &Actor::Shop(ShopId(SMOKE_SHOP_WINNER.to_string())),
                    context.request_id()?,
                    RequestStatus::Completed,
                )
                .await
                .map_err(|error| error.to_string())?;
            expect_status(request.status, RequestStatus::Completed)?;
            Ok("assigned shop completed the repair".to_string())
        }
        "submit_review" => {
            let service = context.service()?;
            service
                .submit_review(
                    &CustomerId(SMOKE_CUSTOMER.to_string()),
                    context.request_id()?,
                    5,
                    "fast and friendly",
                )
                .await
                .map_err(|error| error.to_string())?;

            let summary = service
                .shop_rating_summary(&ShopId(SMOKE_SHOP_WINNER.to_string()))
                .await
                .map_err(|error| error.to_string())?;
            if summary.total_reviews != 1 {
                return Err(format!("expected 1 review, found {}", summary.total_reviews));
            }
            Ok(format!("review recorded, shop average {:.1}", summary.average_rating))
        }
        other => Err(format!("unknown smoke step `{other}`")),
    }
}

async fn seed_directory(service: &RepairLifecycleService<SqlRepairStore>) -> Result<(), String> {
    let now = Utc::now();
    let mut tx = service.store().begin().await.map_err(|error| error.to_string())?;

    tx.insert_customer(&Customer {
        id: CustomerId(SMOKE_CUSTOMER.to_string()),
        full_name: "Smoke Customer".to_string(),
        email: "customer@smoke.repairhub.test".to_string(),
        created_at: now,
    })
    .await
    .map_err(|error| error.to_string())?;

    for (id, name) in [(SMOKE_SHOP_WINNER, "Smoke Fixers"), (SMOKE_SHOP_RUNNER_UP, "Smoke Volts")] {
        tx.insert_shop(&RepairShop {
            id: ShopId(id.to_string()),
            shop_name: name.to_string(),
            owner_email: format!("{}@smoke.repairhub.test", id.to_ascii_lowercase()),
            created_at: now,
        })
        .await
        .map_err(|error| error.to_string())?;
    }

    tx.commit().await.map_err(|error| error.to_string())
}

fn smoke_request_draft() -> RequestDraft {
    RequestDraft {
        device: DeviceDetails {
            brand: "Fairphone".to_string(),
            model: "5".to_string(),
            imei: None,
            problem_category: ProblemCategory::ScreenDamage,
            problem_description: "cracked display after a drop".to_string(),
        },
        image_refs: Vec::new(),
    }
}

fn quote(cents: i64) -> QuoteDraft {
    QuoteDraft {
        estimated_cost: Decimal::new(cents, 2),
        description: "replace display assembly".to_string(),
        estimated_days: 2,
    }
}

fn expect_status(actual: RequestStatus, expected: RequestStatus) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected status {}, found {}", expected.as_str(), actual.as_str()))
    }
}

fn elapsed_since(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((elapsed_since(started), value)),
        Err(error) => Err((elapsed_since(started), error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
