use autodev_services::services::events::Event;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Client frames: `{"type": "subscribe", "channel": "task.<id>"}` and the
/// matching unsubscribe.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

/// Server frames mirror the bus envelope: `{"type": ..., "data": ...}`,
/// plus `channel` so multiplexing clients can route.
#[derive(Debug, Serialize)]
struct ServerMessage<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    channel: &'a str,
    data: &'a serde_json::Value,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_socket(socket, state).await {
            tracing::debug!("websocket closed: {e}");
        }
    })
}

async fn handle_socket(socket: WebSocket, state: AppState) -> anyhow::Result<()> {
    // one bus subscription per connection; channels attach as the client
    // asks for them
    let mut subscription = state.events.subscribe(Vec::<String>::new());
    let subscription_id = subscription.id;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if sender.send(to_ws_message(&event)?).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { channel }) => {
                                tracing::debug!("ws subscribe to {channel}");
                                state.events.add_topic(&subscription, &channel);
                            }
                            Ok(ClientMessage::Unsubscribe { channel }) => {
                                state.events.remove_topic(subscription_id, &channel);
                            }
                            Err(e) => {
                                tracing::debug!("ignoring malformed ws frame: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!("ws receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.events.unsubscribe(subscription_id);
    Ok(())
}

fn to_ws_message(event: &Event) -> anyhow::Result<Message> {
    let frame = ServerMessage {
        event_type: &event.event_type,
        channel: &event.topic,
        data: &event.data,
    };
    Ok(Message::Text(serde_json::to_string(&frame)?.into()))
}
