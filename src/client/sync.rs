use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{info, warn};

use crate::ai::{GeminiClient, GenerationBackend};
use crate::client::orchestrator::ReplyOrchestrator;
use crate::types::{AiConfig, Conversation, Service};

/// Fixed reconnect delay. Deliberately not exponential: this is a long-lived
/// dashboard that should come back quickly after a server restart.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Client-local copy of the conversation list. Never authoritative; the
/// server's broadcasts and the initial full load are.
#[derive(Default)]
pub struct SyncState {
    pub conversations: Vec<Conversation>,
    pub selected: Option<Conversation>,
}

impl SyncState {
    /// Full reload: replaces everything and defaults the selection to the
    /// most recently active conversation when none survives.
    pub fn load(&mut self, mut conversations: Vec<Conversation>) {
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let selected_id = self.selected.as_ref().map(|c| c.id.clone());
        self.selected = selected_id
            .and_then(|id| conversations.iter().find(|c| c.id == id).cloned())
            .or_else(|| conversations.first().cloned());
        self.conversations = conversations;
    }

    /// Merges one updated conversation: replace by id or prepend, re-sort
    /// descending, and refresh the selection so it never points at stale data.
    pub fn merge_update(&mut self, update: Conversation) {
        if let Some(existing) = self.conversations.iter_mut().find(|c| c.id == update.id) {
            *existing = update.clone();
        } else {
            self.conversations.insert(0, update.clone());
        }
        self.conversations
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        if self.selected.as_ref().is_some_and(|s| s.id == update.id) {
            self.selected = Some(update);
        }
    }
}

/// Explicit reconnect bookkeeping instead of a counter captured in a closure,
/// so retry behavior is testable on its own.
pub struct ReconnectState {
    pub attempts: u32,
    delay: Duration,
}

impl ReconnectState {
    pub fn new(delay: Duration) -> Self {
        Self { attempts: 0, delay }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        self.delay
    }
}

/// Keeps local state consistent with the server despite an unreliable push
/// channel: initial full load, one live connection, merge on every frame,
/// silent fixed-delay reconnect forever.
pub struct SyncController {
    api_base: String,
    ws_url: String,
    http: reqwest::Client,
    pub state: Arc<Mutex<SyncState>>,
    orchestrator: Arc<ReplyOrchestrator>,
}

impl SyncController {
    pub fn new(api_base: &str, ws_url: &str, orchestrator: Arc<ReplyOrchestrator>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            http: reqwest::Client::new(),
            state: Arc::new(Mutex::new(SyncState::default())),
            orchestrator,
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        let url = format!("{}{path}", self.api_base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("fetch {path} failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("fetch {path} returned {}", response.status()));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| format!("parse {path} failed: {err}"))
    }

    /// Loads conversations, AI configuration, and the service catalog, and
    /// rebuilds the orchestrator's generation handle from the stored key.
    pub async fn load_initial(&self) -> Result<(), String> {
        let ai_config: AiConfig = self.fetch("/api/ai-config").await?;
        let backend =
            GeminiClient::new(&ai_config.api_key).map(|c| Arc::new(c) as Arc<dyn GenerationBackend>);
        self.orchestrator.set_backend(backend).await;

        let services: Vec<Service> = self.fetch("/api/services").await?;
        self.orchestrator.set_services(services).await;

        let conversations: Vec<Conversation> = self.fetch("/api/conversations").await?;
        self.state.lock().await.load(conversations);
        Ok(())
    }

    /// Push-channel loop. Each frame is one updated conversation record; every
    /// merged update is handed to the orchestrator exactly once. Any close or
    /// error schedules a single reconnect after the fixed delay, forever.
    pub async fn run(self: Arc<Self>) {
        let (preview_tx, mut preview_rx) = mpsc::unbounded_channel::<Conversation>();
        let preview_state = self.state.clone();
        tokio::spawn(async move {
            // Streaming previews are local view merges only; nothing here is
            // persisted or broadcast.
            while let Some(view) = preview_rx.recv().await {
                preview_state.lock().await.merge_update(view);
            }
        });

        let mut reconnect = ReconnectState::new(RECONNECT_DELAY);
        loop {
            match connect_async(self.ws_url.as_str()).await {
                Ok((socket, _)) => {
                    info!(url = %self.ws_url, "push channel open");
                    reconnect.reset();

                    // A reconnect is a fresh window; reload to cover anything
                    // broadcast while we were away.
                    if let Err(err) = self.load_initial().await {
                        warn!(%err, "initial load failed");
                    }

                    let (_write, mut read) = socket.split();
                    while let Some(frame) = read.next().await {
                        match frame {
                            Ok(WsMessage::Text(text)) => {
                                let Ok(update) =
                                    serde_json::from_str::<Conversation>(text.as_str())
                                else {
                                    continue;
                                };
                                self.state.lock().await.merge_update(update.clone());

                                let orchestrator = self.orchestrator.clone();
                                let preview = preview_tx.clone();
                                tokio::spawn(async move {
                                    orchestrator.handle_update(&update, &preview).await;
                                });
                            }
                            Ok(WsMessage::Close(_)) => break,
                            Ok(_) => {}
                            Err(err) => {
                                // Treat an errored socket as closed rather
                                // than leaving it in an ambiguous state.
                                warn!(%err, "push channel error");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "push channel connect failed");
                }
            }

            let delay = reconnect.next_delay();
            warn!(attempt = reconnect.attempts, ?delay, "push channel closed, reconnecting");
            tokio::time::sleep(delay).await;
        }
    }
}
