use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use repairhub_core::audit::InMemoryAuditSink;
use repairhub_core::notifications::InMemoryNotificationSink;
use repairhub_core::{
    Actor, ApplicationError, Customer, CustomerId, DeviceDetails, ProblemCategory, QuoteDraft,
    QuoteStatus, RepairLifecycleService, RepairShop, RepairStore, RequestDraft, RequestStatus,
    ShopId, ShopRequestView,
};
use repairhub_db::{connect_with_settings, migrations, DbPool, SqlRepairStore};

type Service = RepairLifecycleService<SqlRepairStore>;

async fn seed_directory(pool: &DbPool) {
    let store = SqlRepairStore::new(pool.clone());
    let mut tx = store.begin().await.expect("begin");
    tx.insert_customer(&Customer {
        id: CustomerId("C1".to_owned()),
        full_name: "Customer One".to_owned(),
        email: "c1@customers.test".to_owned(),
        created_at: Utc::now(),
    })
    .await
    .expect("customer");
    for id in ["A", "B", "C"] {
        tx.insert_shop(&RepairShop {
            id: ShopId(id.to_owned()),
            shop_name: format!("Shop {id}"),
            owner_email: format!("{id}@shops.test"),
            created_at: Utc::now(),
        })
        .await
        .expect("shop");
    }
    tx.commit().await.expect("commit");
}

fn service(pool: &DbPool) -> (Service, InMemoryNotificationSink) {
    let notifications = InMemoryNotificationSink::default();
    let service = RepairLifecycleService::new(
        SqlRepairStore::new(pool.clone()),
        Arc::new(notifications.clone()),
        Arc::new(InMemoryAuditSink::default()),
    );
    (service, notifications)
}

async fn memory_service() -> (Service, InMemoryNotificationSink, DbPool) {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    seed_directory(&pool).await;
    let (service, notifications) = service(&pool);
    (service, notifications, pool)
}

fn request_draft() -> RequestDraft {
    RequestDraft {
        device: DeviceDetails {
            brand: "Apple".to_owned(),
            model: "iPhone 14".to_owned(),
            imei: None,
            problem_category: ProblemCategory::ScreenDamage,
            problem_description: "display flickers after drop".to_owned(),
        },
        image_refs: vec!["img/1.jpg".to_owned(), "img/1.jpg".to_owned()],
    }
}

fn quote_draft(dollars: i64) -> QuoteDraft {
    QuoteDraft {
        estimated_cost: Decimal::new(dollars * 100, 2),
        description: "replace display".to_owned(),
        estimated_days: 2,
    }
}

fn customer() -> CustomerId {
    CustomerId("C1".to_owned())
}

fn shop(id: &str) -> ShopId {
    ShopId(id.to_owned())
}

async fn accepted_rows(pool: &DbPool, request_id: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(1) FROM repair_quote WHERE request_id = ? AND accepted = 1 AND status = 'accepted'",
    )
    .bind(request_id)
    .fetch_one(pool)
    .await
    .expect("count accepted")
}

#[tokio::test]
async fn worked_example_persists_one_accepted_quote() {
    let (service, notifications, pool) = memory_service().await;
    let request = service.create_request(&customer(), request_draft()).await.expect("create");
    assert_eq!(request.image_refs.len(), 1);

    let quote_a = service.submit_quote(&shop("A"), &request.id, quote_draft(50)).await.expect("A");
    let quote_b = service.submit_quote(&shop("B"), &request.id, quote_draft(70)).await.expect("B");

    let outcome = service.accept_quote(&customer(), &quote_b.id).await.expect("accept");
    assert_eq!(outcome.request.status, RequestStatus::Accepted);
    assert_eq!(outcome.rejected_quotes, 1);

    let quotes = service.quotes_for_request(&request.id).await.expect("quotes");
    assert_eq!(quotes.len(), 2);
    let a = quotes.iter().find(|quote| quote.id == quote_a.id).expect("quote a");
    let b = quotes.iter().find(|quote| quote.id == quote_b.id).expect("quote b");
    assert_eq!(a.status, QuoteStatus::Rejected);
    assert_eq!(b.status, QuoteStatus::Accepted);
    assert_eq!(b.estimated_cost, Decimal::new(7000, 2));
    assert_eq!(accepted_rows(&pool, &request.id.0).await, 1);

    let stored = service.request(&request.id).await.expect("request");
    assert_eq!(stored.status, RequestStatus::Accepted);
    assert_eq!(stored.version, outcome.request.version);

    assert_eq!(notifications.names(), vec![
        "new_repair_request",
        "new_quote",
        "new_quote",
        "quote_accepted"
    ]);
}

#[tokio::test]
async fn duplicate_quote_from_same_shop_is_rejected_by_the_store() {
    let (service, _, _) = memory_service().await;
    let request = service.create_request(&customer(), request_draft()).await.expect("create");
    service.submit_quote(&shop("A"), &request.id, quote_draft(50)).await.expect("first");

    let error = service
        .submit_quote(&shop("A"), &request.id, quote_draft(45))
        .await
        .expect_err("second quote from same shop");
    assert!(matches!(error, ApplicationError::Conflict(_)));
}

#[tokio::test]
async fn second_acceptance_is_invalid_state() {
    let (service, _, pool) = memory_service().await;
    let request = service.create_request(&customer(), request_draft()).await.expect("create");
    let quote_a = service.submit_quote(&shop("A"), &request.id, quote_draft(50)).await.expect("A");
    let quote_b = service.submit_quote(&shop("B"), &request.id, quote_draft(70)).await.expect("B");

    service.accept_quote(&customer(), &quote_a.id).await.expect("accept A");
    let error = service.accept_quote(&customer(), &quote_b.id).await.expect_err("accept B");

    assert!(matches!(error, ApplicationError::InvalidState(_)));
    assert_eq!(accepted_rows(&pool, &request.id.0).await, 1);
}

#[tokio::test]
async fn full_lifecycle_through_review() {
    let (service, _, _) = memory_service().await;
    let request = service.create_request(&customer(), request_draft()).await.expect("create");
    let quote = service.submit_quote(&shop("C"), &request.id, quote_draft(40)).await.expect("quote");
    service.accept_quote(&customer(), &quote.id).await.expect("accept");

    let mut details = request_draft().device;
    details.imei = Some("356938035643809".to_owned());
    let started =
        service.start_repair(&shop("C"), &request.id, details).await.expect("start repair");
    assert_eq!(started.status, RequestStatus::InProgress);
    assert_eq!(started.device.imei.as_deref(), Some("356938035643809"));

    let completed = service
        .transition_request(&Actor::Shop(shop("C")), &request.id, RequestStatus::Completed)
        .await
        .expect("complete");
    assert!(completed.completed_at.is_some());

    service.submit_review(&customer(), &request.id, 4, "quick and tidy").await.expect("review");
    let duplicate = service
        .submit_review(&customer(), &request.id, 5, "again")
        .await
        .expect_err("second review");
    assert!(matches!(duplicate, ApplicationError::Conflict(_)));

    let summary = service.shop_rating_summary(&shop("C")).await.expect("summary");
    assert_eq!(summary.total_reviews, 1);
    assert_eq!(summary.star_counts[3], 1);

    let completed =
        service.requests_for_shop(&shop("C"), ShopRequestView::Completed).await.expect("completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].request.id, request.id);
    assert_eq!(completed[0].quote.id, quote.id);
    assert!(service
        .requests_for_shop(&shop("C"), ShopRequestView::Active)
        .await
        .expect("active")
        .is_empty());

    let by_customer = service.reviews_for_customer(&customer()).await.expect("by customer");
    assert_eq!(by_customer.len(), 1);
    assert_eq!(service.reviews_for_shop(&shop("C")).await.expect("by shop"), by_customer);
    assert_eq!(service.review_for_request(&request.id).await.expect("by request").rating, 4);
}

#[tokio::test]
async fn open_requests_hide_once_quoted_by_the_shop() {
    let (service, _, _) = memory_service().await;
    let first = service.create_request(&customer(), request_draft()).await.expect("first");
    let second = service.create_request(&customer(), request_draft()).await.expect("second");
    service.submit_quote(&shop("A"), &first.id, quote_draft(30)).await.expect("quote");

    let available = service.requests_available_for_quoting(&shop("A")).await.expect("available");
    assert_eq!(available.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec![second.id.clone()]);
    assert!(service.has_shop_quoted(&shop("A"), &first.id).await.expect("quoted"));
    assert_eq!(service.requests_for_customer(&customer()).await.expect("mine").len(), 2);
}

async fn file_service(dir: &tempfile::TempDir) -> (Service, DbPool) {
    let url = format!("sqlite://{}", dir.path().join("race.db").display());
    let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    seed_directory(&pool).await;
    let (service, _) = service(&pool);
    (service, pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_acceptances_on_file_database_admit_one_winner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (service, pool) = file_service(&dir).await;

    let caller = customer();
    let request = service.create_request(&caller, request_draft()).await.expect("create");
    let quote_a = service.submit_quote(&shop("A"), &request.id, quote_draft(50)).await.expect("A");
    let quote_b = service.submit_quote(&shop("B"), &request.id, quote_draft(70)).await.expect("B");

    let handles: Vec<_> = [quote_a.id.clone(), quote_b.id.clone()]
        .into_iter()
        .map(|quote_id| {
            let service = service.clone();
            let caller = caller.clone();
            tokio::spawn(async move {
                let result = service.accept_quote(&caller, &quote_id).await;
                (quote_id, result)
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.expect("join"));
    }

    assert_eq!(outcomes.iter().filter(|(_, result)| result.is_ok()).count(), 1, "{outcomes:?}");
    let (loser_id, loser_error) = outcomes
        .iter()
        .find_map(|(quote_id, result)| result.as_ref().err().map(|error| (quote_id, error)))
        .expect("one acceptance loses");
    assert!(
        matches!(loser_error, ApplicationError::InvalidState(_) | ApplicationError::Conflict(_)),
        "unexpected loser error: {loser_error:?}"
    );

    // Once the winner committed, retrying the losing quote is refused outright.
    let retry = service.accept_quote(&caller, loser_id).await.expect_err("retry loses");
    assert!(matches!(retry, ApplicationError::InvalidState(_)), "{retry:?}");

    assert_eq!(accepted_rows(&pool, &request.id.0).await, 1);
    let stored = service.request(&request.id).await.expect("request");
    assert_eq!(stored.status, RequestStatus::Accepted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acceptances_on_unrelated_requests_all_succeed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (service, pool) = file_service(&dir).await;

    let caller = customer();
    let mut quotes = Vec::new();
    for index in 0..8 {
        let request = service.create_request(&caller, request_draft()).await.expect("create");
        let quote = service
            .submit_quote(&shop("A"), &request.id, quote_draft(40 + index))
            .await
            .expect("quote");
        quotes.push((request.id, quote.id));
    }

    let handles: Vec<_> = quotes
        .iter()
        .map(|(_, quote_id)| {
            let service = service.clone();
            let caller = caller.clone();
            let quote_id = quote_id.clone();
            tokio::spawn(async move { service.accept_quote(&caller, &quote_id).await })
        })
        .collect();

    let mut failures = Vec::new();
    for handle in handles {
        if let Err(error) = handle.await.expect("join") {
            failures.push(error);
        }
    }
    assert!(failures.is_empty(), "acceptances failed: {failures:?}");

    for (request_id, _) in &quotes {
        assert_eq!(accepted_rows(&pool, &request_id.0).await, 1);
        let stored = service.request(request_id).await.expect("request");
        assert_eq!(stored.status, RequestStatus::Accepted);
    }
}
