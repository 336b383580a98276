//! WebSocket gateway for live notifications
//!
//! Clients connect to `/ws?userId=<uuid>`. On connect they receive their
//! unread backlog, then every push made for them while connected. Frames are
//! `{"event":"notification","data":{...}}`; nothing is read from the client
//! beyond close frames.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use newswire_common::live::LiveConnection;
use newswire_common::models::{LivePayload, NotificationRecord, NOTIFICATION_EVENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NOTIFICATION_EVENT: &str = "notification";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub user_id: Option<String>,
}

#[derive(Serialize)]
struct Frame<'a> {
    event: &'static str,
    data: &'a LivePayload,
}

fn frame(payload: &LivePayload) -> serde_json::Result<String> {
    serde_json::to_string(&Frame {
        event: NOTIFICATION_EVENT,
        data: payload,
    })
}

fn backlog_payload(record: NotificationRecord) -> LivePayload {
    LivePayload {
        kind: NOTIFICATION_EVENT_TYPE.to_string(),
        message: record.message,
        article: None,
    }
}

/// Pushes made between registering and loading the backlog are already in
/// the backlog
fn in_backlog(sent: &HashSet<Uuid>, payload: &LivePayload) -> bool {
    payload
        .article
        .as_ref()
        .is_some_and(|article| sent.contains(&article.id))
}

fn parse_user_id(params: &ConnectParams) -> Option<Uuid> {
    params
        .user_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}

/// Upgrade to a WebSocket bound to the `userId` query parameter
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(user_id) = parse_user_id(&params) else {
        return (StatusCode::BAD_REQUEST, "userId query parameter must be a UUID").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let LiveConnection { id, mut receiver, .. } = state.registry.register(user_id).await;
    let (mut sender, mut inbound) = socket.split();

    let backlog = match state.notifications.unread_notifications(user_id).await {
        Ok(records) => records,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Failed to load unread notifications");
            Vec::new()
        }
    };
    if !backlog.is_empty() {
        debug!(user_id = %user_id, count = backlog.len(), "Sending unread backlog");
    }

    let sent: HashSet<Uuid> = backlog.iter().map(|record| record.article_id).collect();
    let mut open = true;
    for record in backlog {
        if !send(&mut sender, &backlog_payload(record)).await {
            open = false;
            break;
        }
    }

    // Pings are answered by the websocket layer while `inbound` is polled
    while open {
        tokio::select! {
            pushed = receiver.recv() => match pushed {
                Some(payload) if in_backlog(&sent, &payload) => {
                    debug!(user_id = %user_id, "Skipping push already sent with the backlog");
                }
                Some(payload) => open = send(&mut sender, &payload).await,
                None => {
                    // Replaced by a newer connection or shutting down
                    let _ = sender.send(Message::Close(None)).await;
                    open = false;
                }
            },
            incoming = inbound.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => open = false,
                Some(Err(e)) => {
                    debug!(user_id = %user_id, error = %e, "WebSocket error");
                    open = false;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.unregister(user_id, id).await;
    info!(user_id = %user_id, connection_id = %id, "WebSocket closed");
}

/// Send one payload; false when the socket is gone
async fn send<S>(sender: &mut S, payload: &LivePayload) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let text = match frame(payload) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode notification frame");
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_frame_shape() {
        let payload = LivePayload {
            kind: NOTIFICATION_EVENT_TYPE.to_string(),
            message: "New article from reuters in world: Floods".to_string(),
            article: None,
        };
        let json: serde_json::Value = serde_json::from_str(&frame(&payload).unwrap()).unwrap();

        assert_eq!(json["event"], "notification");
        assert_eq!(json["data"]["type"], NOTIFICATION_EVENT_TYPE);
        assert_eq!(json["data"]["message"], "New article from reuters in world: Floods");
    }

    #[test]
    fn test_parse_user_id() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_user_id(&ConnectParams {
                user_id: Some(id.to_string())
            }),
            Some(id)
        );
        assert!(parse_user_id(&ConnectParams {
            user_id: Some("alice".into())
        })
        .is_none());
        assert!(parse_user_id(&ConnectParams { user_id: None }).is_none());
    }

    #[test]
    fn test_backlog_payload_from_record() {
        let record = NotificationRecord {
            id: Uuid::now_v7(),
            user_id: Uuid::new_v4(),
            article_id: Uuid::new_v4(),
            message: "hello".into(),
            is_read: false,
            created_at: Utc::now(),
        };
        let payload = backlog_payload(record);
        assert_eq!(payload.kind, NOTIFICATION_EVENT_TYPE);
        assert_eq!(payload.message, "hello");
        assert!(payload.article.is_none());
    }

    #[test]
    fn test_push_already_in_backlog_is_skipped() {
        let article = newswire_common::models::SavedArticle {
            id: Uuid::now_v7(),
            url: "https://r.example/floods".into(),
            title: "Floods".into(),
            content: "Rivers rose.".into(),
            author: None,
            portal: "reuters".into(),
            section: "world".into(),
            image_url: None,
            published_at: Utc::now(),
            scraped_at: Utc::now(),
        };
        let payload = LivePayload::for_article("Floods".into(), &article);

        let mut sent = HashSet::new();
        assert!(!in_backlog(&sent, &payload));
        sent.insert(article.id);
        assert!(in_backlog(&sent, &payload));

        let without_article = LivePayload {
            kind: NOTIFICATION_EVENT_TYPE.to_string(),
            message: "hello".into(),
            article: None,
        };
        assert!(!in_backlog(&sent, &without_article));
    }
}
