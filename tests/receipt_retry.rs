//! Receipt retry engine and claim protocol over real (SQLite) storage:
//! scheduling after failures, lease contention and TTL reclaim, sweep
//! batching, and the operator retry endpoint.

mod common;

use assert_matches::assert_matches;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use common::{
    insert_account, insert_payment, reload_payment, response_json, set_metadata, NalogoScript,
    PaymentFixture,
};
use paygate_api::{
    metadata::{self, Workflow},
    services::{ClaimOutcome, ReceiptOutcome},
};

async fn paid_yookassa_payment(app: &common::TestApp) -> paygate_api::entities::payment::Model {
    let account = insert_account(&app.db, dec!(0)).await;
    insert_payment(
        &app.db,
        account.id,
        PaymentFixture {
            status: "paid",
            ..Default::default()
        },
    )
    .await
}

#[tokio::test]
async fn transient_failure_schedules_a_short_retry() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;
    app.nalogo.push(NalogoScript::Fail {
        status: 503,
        retryable: true,
    });

    let before = Utc::now();
    let outcome = app.receipts.process_one(payment.id, false).await.unwrap();
    let next_retry_at = assert_matches!(outcome, ReceiptOutcome::Failed { next_retry_at, .. } => next_retry_at);

    // First attempt, retryable base: 60 seconds out.
    let delay = next_retry_at - before;
    assert!(delay >= Duration::seconds(59) && delay <= Duration::seconds(62));

    let meta = reload_payment(&app.db, payment.id).await.metadata;
    assert_eq!(metadata::get_u32(&meta, "nalogoReceiptAttempts"), 1);
    assert!(metadata::get_str(&meta, "nalogoReceiptLastError").is_some());
    assert!(metadata::get_time(&meta, "nalogoReceiptInProgressAt").is_none());

    // The schedule holds until it elapses.
    assert_matches!(
        app.receipts.process_one(payment.id, false).await.unwrap(),
        ReceiptOutcome::RetryWait { .. }
    );
}

#[tokio::test]
async fn non_retryable_failure_backs_off_longer() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;
    app.nalogo.push(NalogoScript::Fail {
        status: 401,
        retryable: false,
    });

    let before = Utc::now();
    let outcome = app.receipts.process_one(payment.id, false).await.unwrap();
    let next_retry_at = assert_matches!(outcome, ReceiptOutcome::Failed { next_retry_at, .. } => next_retry_at);
    let delay = next_retry_at - before;
    assert!(delay >= Duration::seconds(599) && delay <= Duration::seconds(602));
}

#[tokio::test]
async fn force_bypasses_the_schedule_but_not_the_applied_marker() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;
    app.nalogo.push(NalogoScript::Fail {
        status: 503,
        retryable: true,
    });
    app.nalogo.push(NalogoScript::Ok("rcpt-f"));

    assert_matches!(
        app.receipts.process_one(payment.id, false).await.unwrap(),
        ReceiptOutcome::Failed { .. }
    );
    let outcome = app.receipts.process_one(payment.id, true).await.unwrap();
    assert_matches!(outcome, ReceiptOutcome::Created { uuid } if uuid == "rcpt-f");

    let meta = reload_payment(&app.db, payment.id).await.metadata;
    assert_eq!(metadata::get_u32(&meta, "nalogoReceiptAttempts"), 2);
    assert_eq!(meta["nalogoReceiptUuid"], "rcpt-f");
    assert!(metadata::get_str(&meta, "nalogoReceiptLastError").is_none());
    assert!(metadata::get_time(&meta, "nalogoReceiptNextRetryAt").is_none());

    // Applied marker is sticky, even when forced.
    assert_matches!(
        app.receipts.process_one(payment.id, true).await.unwrap(),
        ReceiptOutcome::AlreadyCreated
    );
    assert_eq!(app.nalogo.call_count(), 2);
}

#[tokio::test]
async fn live_lease_blocks_and_stale_lease_is_reclaimed() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;

    let first = app
        .claims
        .claim(payment.id, Workflow::NalogoReceipt, true)
        .await
        .unwrap();
    assert_matches!(first, ClaimOutcome::Claimed { attempts: 1, .. });

    // A second claimant loses while the lease is fresh.
    assert_matches!(
        app.claims
            .claim(payment.id, Workflow::NalogoReceipt, true)
            .await
            .unwrap(),
        ClaimOutcome::InProgress
    );

    // Age the lease past the 10-minute TTL; the next claimant takes over.
    let stale = (Utc::now() - Duration::minutes(11)).to_rfc3339();
    set_metadata(&app.db, payment.id, "nalogoReceiptInProgressAt", json!(stale)).await;
    assert_matches!(
        app.claims
            .claim(payment.id, Workflow::NalogoReceipt, true)
            .await
            .unwrap(),
        ClaimOutcome::Claimed { attempts: 2, .. }
    );
}

#[tokio::test]
async fn concurrent_claims_admit_a_single_executor() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let claims = app.claims.clone();
        let payment_id = payment.id;
        handles.push(tokio::spawn(async move {
            claims
                .claim(payment_id, Workflow::NalogoReceipt, true)
                .await
                .unwrap()
        }));
    }

    let mut claimed = 0;
    let mut blocked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ClaimOutcome::Claimed { attempts, .. } => {
                assert_eq!(attempts, 1);
                claimed += 1;
            }
            ClaimOutcome::InProgress => blocked += 1,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(claimed, 1, "exactly one live executor");
    assert_eq!(blocked, 3);

    let meta = reload_payment(&app.db, payment.id).await.metadata;
    assert_eq!(metadata::get_u32(&meta, "nalogoReceiptAttempts"), 1);
}

#[tokio::test]
async fn claim_namespaces_do_not_interfere() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;

    assert_matches!(
        app.claims
            .claim(payment.id, Workflow::NalogoReceipt, true)
            .await
            .unwrap(),
        ClaimOutcome::Claimed { .. }
    );
    // The entitlement workflow is unaffected by the receipt lease.
    assert_matches!(
        app.claims
            .claim(payment.id, Workflow::Entitlement, true)
            .await
            .unwrap(),
        ClaimOutcome::Claimed { .. }
    );

    // Releasing one namespace leaves the other's lease in place.
    app.claims
        .release_success(payment.id, Workflow::Entitlement, |_| {})
        .await
        .unwrap();
    let meta = reload_payment(&app.db, payment.id).await.metadata;
    assert!(metadata::get_time(&meta, "entitlementAppliedAt").is_some());
    assert!(metadata::get_time(&meta, "nalogoReceiptInProgressAt").is_some());
}

#[tokio::test]
async fn ineligible_rows_are_not_filed() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(0)).await;

    let pending = insert_payment(&app.db, account.id, PaymentFixture::default()).await;
    assert_matches!(
        app.receipts.process_one(pending.id, false).await.unwrap(),
        ReceiptOutcome::NotPaidYookassa
    );

    let crypto = insert_payment(
        &app.db,
        account.id,
        PaymentFixture {
            provider: "cryptobot",
            status: "paid",
            ..Default::default()
        },
    )
    .await;
    assert_matches!(
        app.receipts.process_one(crypto.id, false).await.unwrap(),
        ReceiptOutcome::NotPaidYookassa
    );

    assert_matches!(
        app.receipts.process_one(Uuid::new_v4(), false).await.unwrap(),
        ReceiptOutcome::NotFound
    );
    assert_eq!(app.nalogo.call_count(), 0);
}

#[tokio::test]
async fn sweep_batch_files_only_unfiled_paid_yookassa_rows() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(0)).await;

    let unfiled = insert_payment(
        &app.db,
        account.id,
        PaymentFixture {
            status: "paid",
            ..Default::default()
        },
    )
    .await;
    let filed = insert_payment(
        &app.db,
        account.id,
        PaymentFixture {
            status: "paid",
            ..Default::default()
        },
    )
    .await;
    set_metadata(&app.db, filed.id, "nalogoReceiptUuid", json!("rcpt-old")).await;
    insert_payment(&app.db, account.id, PaymentFixture::default()).await;
    insert_payment(
        &app.db,
        account.id,
        PaymentFixture {
            provider: "cryptobot",
            status: "paid",
            ..Default::default()
        },
    )
    .await;

    app.nalogo.push(NalogoScript::Ok("rcpt-new"));
    let summary = app.receipts.process_batch(50).await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.failed, 0);
    let meta = reload_payment(&app.db, unfiled.id).await.metadata;
    assert_eq!(meta["nalogoReceiptUuid"], "rcpt-new");
    assert_eq!(app.nalogo.call_count(), 1);
}

#[tokio::test]
async fn sweep_cursor_survives_paid_at_ties_across_page_boundaries() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(0)).await;

    // One row past the scan page size, all sharing the same paid-at stamp,
    // so the page boundary lands inside the tie.
    let tied = Utc::now() - Duration::minutes(5);
    let total = 101;
    for _ in 0..total {
        insert_payment(
            &app.db,
            account.id,
            PaymentFixture {
                status: "paid",
                paid_at: Some(tied),
                ..Default::default()
            },
        )
        .await;
        app.nalogo.push(NalogoScript::Ok("rcpt-tied"));
    }

    let summary = app.receipts.process_batch(200).await.unwrap();
    assert_eq!(summary.processed, total);
    assert_eq!(summary.created, total);
    assert_eq!(app.nalogo.call_count(), total as usize);
}

async fn admin_retry(
    app: &common::TestApp,
    payment_id: Uuid,
    token: Option<&str>,
    force: bool,
) -> axum::http::Response<Body> {
    let uri = format!(
        "/api/v1/admin/receipts/{}/retry?force={}",
        payment_id, force
    );
    let mut request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header("x-admin-token", token);
    }
    let request = request.body(Body::empty()).unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

#[tokio::test]
async fn admin_retry_requires_the_token() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;

    let missing = admin_retry(&app, payment.id, None, false).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = admin_retry(&app, payment.id, Some("nope"), false).await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.nalogo.call_count(), 0);
}

#[tokio::test]
async fn admin_retry_reports_the_outcome_vocabulary() {
    let app = common::setup().await;
    let payment = paid_yookassa_payment(&app).await;
    app.nalogo.push(NalogoScript::Fail {
        status: 503,
        retryable: true,
    });
    app.nalogo.push(NalogoScript::Ok("rcpt-a"));

    let failed = admin_retry(&app, payment.id, Some("test-admin-token"), false).await;
    assert_eq!(failed.status(), StatusCode::OK);
    let body = response_json(failed).await;
    assert_eq!(body["outcome"], "failed");
    assert!(body["next_retry_at"].is_string());

    // Without force the schedule holds; with force it files.
    let waiting = admin_retry(&app, payment.id, Some("test-admin-token"), false).await;
    assert_eq!(response_json(waiting).await["outcome"], "retry_wait");

    let forced = admin_retry(&app, payment.id, Some("test-admin-token"), true).await;
    let body = response_json(forced).await;
    assert_eq!(body["outcome"], "created");
    assert_eq!(body["receipt_uuid"], "rcpt-a");

    let missing = admin_retry(&app, Uuid::new_v4(), Some("test-admin-token"), false).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
