//! OpenAPI document assembly.

use utoipa::OpenApi;

use crate::api::handlers;
use crate::api::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "fanout",
        description = "Event ingestion and webhook fan-out service",
    ),
    paths(
        handlers::events::create_event,
        handlers::events::create_events_batch,
        handlers::events::list_events,
        handlers::events::get_event,
        handlers::events::replay_event,
        handlers::subscriptions::create_subscription,
        handlers::subscriptions::list_subscriptions,
        handlers::subscriptions::get_subscription,
        handlers::subscriptions::update_subscription,
        handlers::subscriptions::delete_subscription,
        handlers::subscriptions::rotate_secret,
        handlers::inbox::fetch,
        handlers::inbox::ack,
        handlers::inbox::ack_batch,
        handlers::inbox::change_visibility,
        handlers::inbox::stats,
        handlers::dlq::list,
        handlers::dlq::stats,
        handlers::dlq::get,
        handlers::dlq::retry,
        handlers::dlq::dismiss,
        handlers::dlq::retry_batch,
        handlers::dlq::dismiss_batch,
        handlers::dlq::purge,
    ),
    components(schemas(
        models::events::CreateEventRequest,
        models::events::EventResponse,
        models::events::EventListResponse,
        models::events::BatchEventItem,
        models::events::BatchCreateEventRequest,
        models::events::BatchEventError,
        models::events::BatchEventResultItem,
        models::events::BatchCreateEventResponse,
        models::events::ReplayEventRequest,
        models::events::ReplayEventResponse,
        models::subscriptions::WebhookPolicy,
        models::subscriptions::CreateSubscriptionRequest,
        models::subscriptions::UpdateSubscriptionRequest,
        models::subscriptions::SubscriptionResponse,
        models::subscriptions::SubscriptionWithSecretResponse,
        models::subscriptions::SubscriptionListResponse,
        models::subscriptions::RotateSecretResponse,
        models::inbox::InboxItemResponse,
        models::inbox::InboxFetchResponse,
        models::inbox::AckRequest,
        models::inbox::AckBatchRequest,
        models::inbox::AckResultItem,
        models::inbox::AckBatchResponse,
        models::inbox::ChangeVisibilityRequest,
        models::inbox::ChangeVisibilityResponse,
        models::inbox::InboxStatsResponse,
        models::dlq::DlqItemResponse,
        models::dlq::DlqListResponse,
        models::dlq::DlqRetryRequest,
        models::dlq::DlqRetryResponse,
        models::dlq::DlqBatchRequest,
        models::dlq::DlqBatchResultItem,
        models::dlq::DlqBatchResponse,
        models::dlq::DlqPurgeResponse,
        models::dlq::DlqStatsResponse,
    )),
    tags(
        (name = "events", description = "Event ingestion, reads, replay"),
        (name = "subscriptions", description = "Webhook subscription management"),
        (name = "inbox", description = "Pull-mode consumption with visibility timeouts"),
        (name = "dlq", description = "Dead-letter queue inspection and recovery"),
    ),
)]
pub struct ApiDoc;

/// Serve the generated document.
pub async fn serve_openapi() -> axum::Json<utoipa::openapi::OpenApi> {
    axum::Json(ApiDoc::openapi())
}
