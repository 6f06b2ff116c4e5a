use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::bus::ChannelEvent;
use crate::entity::{Identity, Role, Tier};
use crate::error::Error;
use crate::messenger::Messenger;

pub struct AppState {
    pub messenger: Messenger,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/conversations", get(list_conversations).post(open_conversation))
        .route("/conversations/:id/messages", get(list_messages).post(send_message))
        .route("/conversations/:id/read", post(mark_read))
        .route("/conversations/:id/typing", post(typing))
        .route("/conversations/:id/events", get(events))
        .route("/memberships", get(list_memberships).post(join_business))
        .route("/memberships/:id/tier", post(assign_tier))
        .route("/profile", put(upsert_profile))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// The identity provider sits in front of this service and resolves the
// session into these two headers.
#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::validation("missing x-user-id header"))?;

        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .ok_or_else(|| Error::validation("x-user-role must be 'customer' or 'business'"))?;

        Ok(Identity::new(id, role))
    }
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<impl IntoResponse, Error> {
    let threads = state.messenger.threads_for(&identity).await?;
    Ok(Json(threads))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenConversationBody {
    business_id: String,
}

async fn open_conversation(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(body): Json<OpenConversationBody>,
) -> Result<impl IntoResponse, Error> {
    if identity.role != Role::Customer {
        return Err(Error::Forbidden("only customers open conversations"));
    }

    let conversation = state
        .messenger
        .get_or_create_conversation(&identity.id, &body.business_id)
        .await?;
    Ok(Json(conversation))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let messages = state.messenger.history(&id, &identity).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    text: Option<String>,
    image_url: Option<String>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, Error> {
    let message = state
        .messenger
        .send_message(&id, &identity, body.text, body.image_url)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.messenger.conversation_opened(&id, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TypingBody {
    typing: bool,
}

async fn typing(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    Json(body): Json<TypingBody>,
) -> Result<impl IntoResponse, Error> {
    state.messenger.set_typing(&id, &identity, body.typing).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Live feed of message and typing events for one conversation.
/// The caller's own typing signals are filtered out server-side.
async fn events(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::BoxError>>>, Error> {
    let mut rx = state.messenger.subscribe(&id, &identity).await?;
    let own_role = identity.role;
    info!("subscriber joined conversation {id} as {identity}");

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(ChannelEvent::Typing { role, .. }) if role == own_role => {
                    // A participant never sees their own typing indicator.
                    continue;
                }
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => yield Ok(Event::default().event(event.name()).data(json)),
                    Err(e) => yield Err(axum::BoxError::from(e)),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Best-effort live feed: a lagging client re-fetches
                    // history instead of replaying the gap.
                    tracing::warn!("subscriber lagged, {skipped} event(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_memberships(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<impl IntoResponse, Error> {
    let memberships = state.messenger.memberships_for(&identity).await?;
    Ok(Json(memberships))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody {
    business_id: String,
}

async fn join_business(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(body): Json<JoinBody>,
) -> Result<impl IntoResponse, Error> {
    if identity.role != Role::Customer {
        return Err(Error::Forbidden("only customers join businesses"));
    }

    let membership = state
        .messenger
        .ensure_membership(&identity.id, &body.business_id)
        .await?;
    Ok(Json(membership))
}

#[derive(Debug, Deserialize)]
struct TierBody {
    tier: String,
}

async fn assign_tier(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    Json(body): Json<TierBody>,
) -> Result<impl IntoResponse, Error> {
    let tier = Tier::parse(&body.tier)
        .ok_or_else(|| Error::validation("tier must be bronze, silver, gold, or vip"))?;
    let membership = state.messenger.assign_tier(&id, &identity, tier).await?;
    Ok(Json(membership))
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    name: String,
}

async fn upsert_profile(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(body): Json<ProfileBody>,
) -> Result<impl IntoResponse, Error> {
    state.messenger.upsert_profile(&identity, body.name).await?;
    Ok(StatusCode::NO_CONTENT)
}
