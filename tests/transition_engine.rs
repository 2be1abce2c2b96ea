//! State machine guarantees: exactly one terminal transition, exactly one
//! balance credit, sticky terminal states.

mod common;

use assert_matches::assert_matches;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{insert_account, insert_payment, reload_account, reload_payment, PaymentFixture};
use paygate_api::services::{PaymentLookup, TransitionOutcome};

#[tokio::test]
async fn concurrent_mark_paid_transitions_once_and_credits_once() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(0)).await;
    let payment = insert_payment(
        &app.db,
        account.id,
        PaymentFixture {
            amount: dec!(499.00),
            ..Default::default()
        },
    )
    .await;

    let lookup = PaymentLookup::by_order_id("yookassa", payment.order_id.clone());
    let a = {
        let payments = app.state.payments.clone();
        let lookup = lookup.clone();
        tokio::spawn(async move { payments.mark_paid(&lookup).await })
    };
    let b = {
        let payments = app.state.payments.clone();
        let lookup = lookup.clone();
        tokio::spawn(async move { payments.mark_paid(&lookup).await })
    };
    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

    let paid_now = outcomes
        .iter()
        .filter(|o| matches!(o, TransitionOutcome::PaidNow(_)))
        .count();
    let already_final = outcomes
        .iter()
        .filter(|o| matches!(o, TransitionOutcome::AlreadyFinal(s) if s.is_paid()))
        .count();
    assert_eq!(paid_now, 1, "exactly one writer wins");
    assert_eq!(already_final, 1, "the loser sees the final row");

    let row = reload_payment(&app.db, payment.id).await;
    assert_eq!(row.status, "paid");
    assert!(row.paid_at.is_some());
    assert_eq!(reload_account(&app.db, account.id).await.balance, dec!(499.00));
}

#[tokio::test]
async fn tariff_payment_does_not_credit_balance() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(10)).await;
    let payment = insert_payment(
        &app.db,
        account.id,
        PaymentFixture {
            tariff_id: Some(Uuid::new_v4()),
            ..Default::default()
        },
    )
    .await;

    let lookup = PaymentLookup::by_order_id("yookassa", payment.order_id.clone());
    let outcome = app.state.payments.mark_paid(&lookup).await.unwrap();
    assert_matches!(outcome, TransitionOutcome::PaidNow(_));

    assert_eq!(reload_account(&app.db, account.id).await.balance, dec!(10));
}

#[tokio::test]
async fn failed_is_sticky_against_a_late_paid_notification() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(0)).await;
    let payment = insert_payment(&app.db, account.id, PaymentFixture::default()).await;

    let lookup = PaymentLookup::by_order_id("yookassa", payment.order_id.clone());
    assert_matches!(
        app.state.payments.mark_failed(&lookup).await.unwrap(),
        TransitionOutcome::FailedNow(_)
    );
    let outcome = app.state.payments.mark_paid(&lookup).await.unwrap();
    assert_matches!(outcome, TransitionOutcome::AlreadyFinal(s) if !s.is_paid());

    assert_eq!(reload_payment(&app.db, payment.id).await.status, "failed");
    assert_eq!(reload_account(&app.db, account.id).await.balance, Decimal::ZERO);
}

#[tokio::test]
async fn provider_mismatch_is_reported_as_not_found() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(0)).await;
    let payment = insert_payment(&app.db, account.id, PaymentFixture::default()).await;

    let lookup = PaymentLookup::by_order_id("cryptobot", payment.order_id.clone());
    assert_matches!(
        app.state.payments.mark_paid(&lookup).await.unwrap(),
        TransitionOutcome::NotFound
    );
    assert_eq!(reload_payment(&app.db, payment.id).await.status, "pending");
}

#[tokio::test]
async fn external_id_is_learned_on_transition() {
    let app = common::setup().await;
    let account = insert_account(&app.db, dec!(0)).await;
    let payment = insert_payment(&app.db, account.id, PaymentFixture::default()).await;

    let mut lookup = PaymentLookup::by_order_id("yookassa", payment.order_id.clone());
    lookup.resolved_external_id = Some("yk-txn-42".to_string());
    app.state.payments.mark_paid(&lookup).await.unwrap();

    let row = reload_payment(&app.db, payment.id).await;
    assert_eq!(row.external_id.as_deref(), Some("yk-txn-42"));

    // The learned id now resolves the row on its own.
    let by_external = PaymentLookup::by_external_id("yookassa", "yk-txn-42");
    assert_matches!(
        app.state.payments.mark_paid(&by_external).await.unwrap(),
        TransitionOutcome::AlreadyFinal(_)
    );
}
