use std::{collections::HashMap, sync::atomic::Ordering, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{AppState, Conversation};

pub enum Outbound {
    Frame(String),
    Ping,
    Close,
}

pub struct ClientHandle {
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub alive: bool,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, ClientHandle>,
}

/// Sends the serialized conversation to every registered client. Clients whose
/// channel is gone are skipped, never queued for; a briefly disconnected
/// dashboard catches up via full reload on its next connect.
pub async fn broadcast_conversation(state: &Arc<AppState>, conversation: &Conversation) {
    let Ok(payload) = serde_json::to_string(conversation) else {
        return;
    };

    let rt = state.realtime.lock().await;
    for handle in rt.clients.values() {
        let _ = handle.tx.send(Outbound::Frame(payload.clone()));
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, ClientHandle { tx, alive: true });
    }
    debug!(client_id, "push channel connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let frame = match outbound {
                Outbound::Frame(payload) => Message::Text(payload.into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Clients send no application frames; anything inbound just proves the
    // connection is alive.
    while let Some(Ok(message)) = ws_receiver.next().await {
        match message {
            Message::Close(_) => break,
            _ => {
                let mut rt = state.realtime.lock().await;
                if let Some(handle) = rt.clients.get_mut(&client_id) {
                    handle.alive = true;
                }
            }
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
    }
    debug!(client_id, "push channel disconnected");

    send_task.abort();
}

/// Periodic liveness probe: a client that has not answered one whole probe
/// cycle is closed and deregistered so half-dead connections cannot leak.
pub fn spawn_liveness_probe(state: Arc<AppState>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;

            let mut rt = state.realtime.lock().await;
            let stale: Vec<usize> = rt
                .clients
                .iter()
                .filter(|(_, handle)| !handle.alive)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(handle) = rt.clients.remove(&id) {
                    let _ = handle.tx.send(Outbound::Close);
                }
                debug!(client_id = id, "closing unresponsive push channel");
            }
            for handle in rt.clients.values_mut() {
                handle.alive = false;
                let _ = handle.tx.send(Outbound::Ping);
            }
        }
    })
}
