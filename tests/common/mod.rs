//! Shared harness: in-memory SQLite, migrated schema, scripted
//! collaborator clients, and the full router.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{header, Method, Request, Response},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, Set};
use sea_orm_migration::MigratorTrait;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use paygate_api::{
    app_router,
    clients::{
        entitlement::EntitlementError, CreateReceiptRequest, EntitlementClient, NalogoClient,
        NalogoError, NoopReferralClient, Receipt,
    },
    config::AppConfig,
    db::DbPool,
    entities::{account, payment},
    migrator::Migrator,
    provenance::IpGate,
    services::{ClaimStore, PaymentService, PostPaymentOrchestrator, ReceiptService},
    AppState,
};

/// One scripted answer from the fake tax service.
#[derive(Debug, Clone)]
pub enum NalogoScript {
    Ok(&'static str),
    Fail { status: u16, retryable: bool },
}

/// Tax client double that replays a script; unscripted calls fail
/// retryably so a misconfigured test is loud in the assertions.
#[derive(Default)]
pub struct ScriptedNalogo {
    script: Mutex<VecDeque<NalogoScript>>,
    pub calls: Mutex<Vec<CreateReceiptRequest>>,
}

impl ScriptedNalogo {
    pub fn push(&self, entry: NalogoScript) {
        self.script.lock().unwrap().push_back(entry);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl NalogoClient for ScriptedNalogo {
    async fn create_receipt(&self, request: &CreateReceiptRequest) -> Result<Receipt, NalogoError> {
        self.calls.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(NalogoScript::Ok(uuid)) => Ok(Receipt {
                uuid: uuid.to_string(),
                print_url: Some(format!("https://lknpd.nalog.ru/api/v1/receipt/1/{}/print", uuid)),
            }),
            Some(NalogoScript::Fail { status, retryable }) => Err(NalogoError {
                message: format!("scripted failure {}", status),
                status: Some(status),
                retryable,
            }),
            None => Err(NalogoError::transport("no scripted response")),
        }
    }
}

/// Entitlement double recording activations; flip `fail` to simulate a
/// backend outage.
#[derive(Default)]
pub struct RecordingEntitlement {
    pub calls: Mutex<Vec<(Uuid, Uuid, Uuid)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl EntitlementClient for RecordingEntitlement {
    async fn activate(
        &self,
        account_id: Uuid,
        tariff_id: Uuid,
        payment_id: Uuid,
    ) -> Result<(), EntitlementError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(EntitlementError::Rejected {
                status: 500,
                detail: "scripted outage".to_string(),
            });
        }
        self.calls
            .lock()
            .unwrap()
            .push((account_id, tariff_id, payment_id));
        Ok(())
    }
}

pub struct TestApp {
    pub db: Arc<DbPool>,
    pub state: AppState,
    pub router: Router,
    pub nalogo: Arc<ScriptedNalogo>,
    pub entitlement: Arc<RecordingEntitlement>,
    pub claims: Arc<ClaimStore>,
    pub receipts: Arc<ReceiptService>,
}

pub async fn setup() -> TestApp {
    setup_with(|_| {}).await
}

pub async fn setup_with<F>(mutate_config: F) -> TestApp
where
    F: FnOnce(&mut AppConfig),
{
    // A single pooled connection keeps every handle on the same in-memory
    // database.
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .connect_timeout(Duration::from_secs(5));
    let db = Arc::new(Database::connect(options).await.expect("sqlite connect"));
    Migrator::up(&*db, None).await.expect("migrations");

    let mut config = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        0,
        "test".to_string(),
    );
    config.admin_api_token = Some("test-admin-token".to_string());
    config.cryptobot_token = Some("cb-test-token".to_string());
    config.mulenpay_secret = Some("mp-test-secret".to_string());
    mutate_config(&mut config);
    let config = Arc::new(config);

    let nalogo = Arc::new(ScriptedNalogo::default());
    let entitlement = Arc::new(RecordingEntitlement::default());

    let claims = Arc::new(ClaimStore::new(Arc::clone(&db)));
    let payments = Arc::new(PaymentService::new(Arc::clone(&db)));
    let receipts = Arc::new(ReceiptService::new(
        Arc::clone(&db),
        Arc::clone(&claims),
        Some(Arc::clone(&nalogo) as Arc<dyn NalogoClient>),
        Duration::ZERO,
    ));
    let orchestrator = Arc::new(PostPaymentOrchestrator::new(
        Arc::clone(&claims),
        Arc::clone(&entitlement) as Arc<dyn EntitlementClient>,
        Arc::new(NoopReferralClient),
        Arc::clone(&receipts),
    ));
    let yookassa_gate = Arc::new(IpGate::yookassa(&[], &[]));

    let state = AppState {
        db: Arc::clone(&db),
        config,
        payments,
        receipts: Arc::clone(&receipts),
        orchestrator,
        yookassa_gate,
    };
    let router = app_router(state.clone());

    TestApp {
        db,
        state,
        router,
        nalogo,
        entitlement,
        claims,
        receipts,
    }
}

pub async fn insert_account(db: &DbPool, balance: Decimal) -> account::Model {
    account::ActiveModel {
        id: Set(Uuid::new_v4()),
        balance: Set(balance),
        created_at: Set(Utc::now()),
        updated_at: Set(Some(Utc::now())),
    }
    .insert(db)
    .await
    .expect("insert account")
}

pub struct PaymentFixture {
    pub provider: &'static str,
    pub status: &'static str,
    pub amount: Decimal,
    pub tariff_id: Option<Uuid>,
    pub order_id: String,
    pub external_id: Option<String>,
    /// Overrides the paid-at stamp; defaults to now for paid rows.
    pub paid_at: Option<chrono::DateTime<Utc>>,
}

impl Default for PaymentFixture {
    fn default() -> Self {
        Self {
            provider: "yookassa",
            status: "pending",
            amount: Decimal::new(49900, 2),
            tariff_id: None,
            order_id: format!("ord-{}", Uuid::new_v4()),
            external_id: None,
            paid_at: None,
        }
    }
}

pub async fn insert_payment(
    db: &DbPool,
    account_id: Uuid,
    fixture: PaymentFixture,
) -> payment::Model {
    let paid_at = fixture
        .paid_at
        .or_else(|| (fixture.status == "paid").then(Utc::now));
    payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(fixture.order_id),
        account_id: Set(account_id),
        provider: Set(fixture.provider.to_string()),
        external_id: Set(fixture.external_id),
        amount: Set(fixture.amount),
        currency: Set("RUB".to_string()),
        tariff_id: Set(fixture.tariff_id),
        status: Set(fixture.status.to_string()),
        metadata: Set(serde_json::json!({})),
        created_at: Set(Utc::now()),
        paid_at: Set(paid_at),
    }
    .insert(db)
    .await
    .expect("insert payment")
}

pub async fn reload_payment(db: &DbPool, id: Uuid) -> payment::Model {
    use sea_orm::EntityTrait;
    payment::Entity::find_by_id(id)
        .one(db)
        .await
        .expect("query payment")
        .expect("payment exists")
}

pub async fn reload_account(db: &DbPool, id: Uuid) -> account::Model {
    use sea_orm::EntityTrait;
    account::Entity::find_by_id(id)
        .one(db)
        .await
        .expect("query account")
        .expect("account exists")
}

/// Overwrite one key in a payment's metadata bag.
pub async fn set_metadata(db: &DbPool, id: Uuid, key: &str, value: Value) {
    let row = reload_payment(db, id).await;
    let mut meta = row.metadata.clone();
    meta[key] = value;
    payment::ActiveModel {
        id: Set(id),
        metadata: Set(meta),
        ..Default::default()
    }
    .update(db)
    .await
    .expect("update metadata");
}

/// POST a JSON body through the router with a simulated transport peer.
pub async fn post_json(
    router: &Router,
    path: &str,
    peer: &str,
    headers: &[(&str, &str)],
    body: &Value,
) -> Response<Body> {
    let peer: SocketAddr = format!("{}:44000", peer).parse().expect("peer addr");
    let mut request = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let mut request = request
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));

    router.clone().oneshot(request).await.expect("router call")
}

pub async fn response_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}
