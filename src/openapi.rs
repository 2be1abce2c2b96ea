//! OpenAPI document and the embedded Swagger UI.

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{errors::ErrorResponse, handlers};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "paygate-api",
        description = "Payment webhook reconciliation and post-payment side effects"
    ),
    paths(
        handlers::health,
        handlers::status,
        handlers::webhooks::yookassa,
        handlers::webhooks::cryptobot,
        handlers::webhooks::mulenpay,
        handlers::admin::retry_receipt,
    ),
    components(schemas(ErrorResponse, handlers::admin::RetryReceiptResponse)),
    tags(
        (name = "webhooks", description = "Provider notification intake"),
        (name = "admin", description = "Operator endpoints"),
        (name = "system", description = "Health and status")
    )
)]
pub struct ApiDoc;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}
