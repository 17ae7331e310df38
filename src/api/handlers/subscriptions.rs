//! HTTP handlers for subscription management.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{Duration, Utc};
use tracing::instrument;

use crate::{
    AppState,
    api::models::pagination::{CursorPagination, encode_cursor},
    api::models::subscriptions::{
        CreateSubscriptionRequest, ListSubscriptionsQuery, RotateSecretResponse,
        SubscriptionListResponse, SubscriptionResponse, SubscriptionWithSecretResponse,
        UpdateSubscriptionRequest,
    },
    auth::CurrentCredential,
    db::errors::DbError,
    db::handlers::Subscriptions,
    db::models::api_keys::Scope,
    db::models::subscriptions::SubscriptionFilter,
    delivery::signing,
    errors::{Error, Result},
    types,
};

const LIST_DEFAULT_LIMIT: i64 = 100;
const LIST_MAX_LIMIT: i64 = 100;

/// Create a subscription. The signing secret is returned only here.
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions",
    tag = "subscriptions",
    request_body = CreateSubscriptionRequest,
    responses(
        (status = 201, description = "Subscription created", body = SubscriptionWithSecretResponse),
        (status = 400, description = "Validation error"),
    ),
)]
#[instrument(skip_all)]
pub async fn create_subscription(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionWithSecretResponse>)> {
    credential.require_scope(Scope::SubscriptionsWrite)?;

    let id = types::subscription_id();
    let secret = signing::generate_signing_secret();
    let db_request =
        request.into_db_request(id, secret.clone(), Some(credential.id().to_string()))?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);
    let subscription = repo.create(&db_request).await?;

    tracing::info!(
        subscription_id = %subscription.id,
        target_url = %subscription.target_url,
        "subscription created"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubscriptionWithSecretResponse {
            subscription: subscription.into(),
            signing_secret: secret,
        }),
    ))
}

/// List subscriptions with cursor pagination.
#[utoipa::path(
    get,
    path = "/api/v1/subscriptions",
    tag = "subscriptions",
    params(ListSubscriptionsQuery, CursorPagination),
    responses(
        (status = 200, description = "Page of subscriptions", body = SubscriptionListResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn list_subscriptions(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Query(query): Query<ListSubscriptionsQuery>,
    Query(pagination): Query<CursorPagination>,
) -> Result<Json<SubscriptionListResponse>> {
    credential.require_scope(Scope::SubscriptionsRead)?;

    let filter = SubscriptionFilter {
        status: query.parsed_status()?,
        is_healthy: query.is_healthy,
        credential_id: None,
    };
    let limit = pagination.limit(LIST_DEFAULT_LIMIT, LIST_MAX_LIMIT);

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);
    let mut subscriptions = repo.list(&filter, limit + 1, pagination.decoded()).await?;

    let next_cursor = if subscriptions.len() as i64 > limit {
        subscriptions.truncate(limit as usize);
        subscriptions
            .last()
            .map(|s| encode_cursor(s.created_at, &s.id))
    } else {
        None
    };

    Ok(Json(SubscriptionListResponse {
        data: subscriptions.into_iter().map(Into::into).collect(),
        next_cursor,
    }))
}

/// Get a subscription by id.
#[utoipa::path(
    get,
    path = "/api/v1/subscriptions/{id}",
    tag = "subscriptions",
    responses(
        (status = 200, description = "The subscription", body = SubscriptionResponse),
        (status = 404, description = "Unknown subscription id"),
    ),
)]
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn get_subscription(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionResponse>> {
    credential.require_scope(Scope::SubscriptionsRead)?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);
    let subscription = repo.get_by_id(&id).await?.ok_or_else(|| Error::NotFound {
        resource: "Subscription".to_string(),
        id: id.clone(),
    })?;

    Ok(Json(subscription.into()))
}

/// Partially update a subscription. Setting `status = active` re-enables a
/// disabled endpoint and resets its health counters.
#[utoipa::path(
    patch,
    path = "/api/v1/subscriptions/{id}",
    tag = "subscriptions",
    request_body = UpdateSubscriptionRequest,
    responses(
        (status = 200, description = "Updated subscription", body = SubscriptionResponse),
        (status = 404, description = "Unknown subscription id"),
    ),
)]
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn update_subscription(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(id): Path<String>,
    Json(request): Json<UpdateSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>> {
    credential.require_scope(Scope::SubscriptionsWrite)?;

    let db_request = request.into_db_request()?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);
    let subscription = repo
        .update(&id, &db_request)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Subscription".to_string(),
            id: id.clone(),
        })?;

    Ok(Json(subscription.into()))
}

/// Soft-delete a subscription. The row is retained for audit.
#[utoipa::path(
    delete,
    path = "/api/v1/subscriptions/{id}",
    tag = "subscriptions",
    responses(
        (status = 204, description = "Subscription deleted"),
        (status = 404, description = "Unknown subscription id"),
    ),
)]
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn delete_subscription(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    credential.require_scope(Scope::SubscriptionsDelete)?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);
    let deleted = repo.soft_delete(&id).await?;
    if !deleted {
        return Err(Error::NotFound {
            resource: "Subscription".to_string(),
            id,
        });
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Rotate the signing secret. The previous secret keeps verifying until the
/// grace deadline in the response; the server signs with the new secret
/// immediately.
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{id}/rotate-secret",
    tag = "subscriptions",
    responses(
        (status = 200, description = "New secret and grace deadline", body = RotateSecretResponse),
        (status = 404, description = "Unknown subscription id"),
    ),
)]
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn rotate_secret(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(id): Path<String>,
) -> Result<Json<RotateSecretResponse>> {
    credential.require_scope(Scope::SubscriptionsWrite)?;

    let new_secret = signing::generate_signing_secret();
    let grace_until =
        Utc::now() + Duration::hours(state.config.subscriptions.rotation_grace_hours.max(0));

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);
    let subscription = repo
        .rotate_secret(&id, &new_secret, grace_until)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Subscription".to_string(),
            id: id.clone(),
        })?;

    tracing::info!(subscription_id = %subscription.id, "signing secret rotated");

    Ok(Json(RotateSecretResponse {
        id: subscription.id,
        signing_secret: new_secret,
        previous_secret_valid_until: grace_until,
    }))
}
