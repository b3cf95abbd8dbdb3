use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;

use crate::ai::{is_credential_error, GenerationBackend};
use crate::prompting;
use crate::types::{message_preview, ChatMessage, Conversation, Sender, Service};

pub const AI_NOT_CONFIGURED_TEXT: &str = "AI not configured. Please add your Google Gemini API \
     Key in the 'Integrations' settings to enable automated responses.";
pub const AI_KEY_INVALID_TEXT: &str =
    "AI API Key is invalid. Please check it in the 'Integrations' settings.";
pub const AI_CONNECTION_TEXT: &str =
    "Sorry, I'm having trouble connecting. Please try again later.";
pub const AUDIO_NOT_CONFIGURED_TEXT: &str = "Audio transcription requires a configured AI. \
     Please add your Google Gemini API Key in the 'Integrations' settings.";
pub const AUDIO_FAILED_TEXT: &str = "Sorry, I couldn't understand the audio. Please try again.";

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Seam over the server's outbound relay endpoint. Everything the orchestrator
/// produces, replies and error notices alike, goes through this single funnel.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, conversation_id: &str, text: &str) -> Result<ChatMessage, String>;
}

/// HTTP implementation against `POST /api/conversations/{id}/messages`.
pub struct ApiRelay {
    base_url: String,
    client: reqwest::Client,
}

impl ApiRelay {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl OutboundSender for ApiRelay {
    async fn send(&self, conversation_id: &str, text: &str) -> Result<ChatMessage, String> {
        let url = format!(
            "{}/api/conversations/{conversation_id}/messages",
            self.base_url
        );
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|err| format!("relay request failed: {err}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("relay returned {status}: {body}"));
        }

        response
            .json::<ChatMessage>()
            .await
            .map_err(|err| format!("relay parse failed: {err}"))
    }
}

/// Decides when an automatic reply is warranted, streams the generation and
/// forwards exactly one final text through the outbound relay.
pub struct ReplyOrchestrator {
    relay: Arc<dyn OutboundSender>,
    backend: RwLock<Option<Arc<dyn GenerationBackend>>>,
    services: RwLock<Vec<Service>>,
    typing: Mutex<HashSet<String>>,
    debounce: Duration,
}

impl ReplyOrchestrator {
    pub fn new(relay: Arc<dyn OutboundSender>) -> Self {
        Self::with_debounce(relay, DEBOUNCE)
    }

    pub fn with_debounce(relay: Arc<dyn OutboundSender>, debounce: Duration) -> Self {
        Self {
            relay,
            backend: RwLock::new(None),
            services: RwLock::new(Vec::new()),
            typing: Mutex::new(HashSet::new()),
            debounce,
        }
    }

    /// Swaps the generation handle when the stored API key changes. `None`
    /// means "not configured" and produces the fixed notice instead of a call.
    pub async fn set_backend(&self, backend: Option<Arc<dyn GenerationBackend>>) {
        *self.backend.write().await = backend;
    }

    pub async fn set_services(&self, services: Vec<Service>) {
        *self.services.write().await = services;
    }

    pub async fn is_typing(&self, conversation_id: &str) -> bool {
        self.typing.lock().await.contains(conversation_id)
    }

    /// A reply is warranted only when the newest message came from the user
    /// and the one before it did not. Two consecutive user messages without an
    /// intervening bot turn mean a previous reply failed; re-triggering there
    /// would start a runaway chain.
    pub fn wants_reply(conversation: &Conversation) -> bool {
        let Some(last) = conversation.messages.last() else {
            return false;
        };
        if last.sender != Sender::User {
            return false;
        }
        let count = conversation.messages.len();
        if count >= 2 && conversation.messages[count - 2].sender == Sender::User {
            return false;
        }
        true
    }

    async fn begin_typing(&self, conversation_id: &str) -> bool {
        self.typing.lock().await.insert(conversation_id.to_string())
    }

    async fn end_typing(&self, conversation_id: &str) {
        self.typing.lock().await.remove(conversation_id);
    }

    /// Consumes one conversation update. Fragments of the streamed reply are
    /// published to `preview` as locally merged views for incremental
    /// rendering; only the final accumulated text is relayed (and thus
    /// persisted and broadcast).
    pub async fn handle_update(
        &self,
        conversation: &Conversation,
        preview: &mpsc::UnboundedSender<Conversation>,
    ) {
        if !Self::wants_reply(conversation) {
            return;
        }
        if !self.begin_typing(&conversation.id).await {
            return;
        }

        // Debounce so rapid-fire user messages coalesce into one trigger.
        tokio::time::sleep(self.debounce).await;

        let backend = self.backend.read().await.clone();
        match backend {
            None => {
                self.relay_notice(&conversation.id, AI_NOT_CONFIGURED_TEXT)
                    .await;
            }
            Some(backend) => {
                self.generate(backend, conversation, preview).await;
            }
        }

        self.end_typing(&conversation.id).await;
    }

    async fn generate(
        &self,
        backend: Arc<dyn GenerationBackend>,
        conversation: &Conversation,
        preview: &mpsc::UnboundedSender<Conversation>,
    ) {
        let system_instruction = {
            let services = self.services.read().await;
            prompting::render_system_prompt(&services)
        };
        let content = prompting::format_history(&conversation.messages);

        let mut stream = match backend.stream_reply(&system_instruction, &content).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(conversation_id = %conversation.id, %err, "generation failed to open");
                self.relay_notice(&conversation.id, classify_generation_error(&err))
                    .await;
                return;
            }
        };

        let mut local = conversation.clone();
        local.messages.push(ChatMessage::bot(""));
        let mut accumulated = String::new();
        let mut failure = None;

        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(text) => {
                    accumulated.push_str(&text);
                    if let Some(last) = local.messages.last_mut() {
                        last.text = accumulated.clone();
                    }
                    local.last_message_preview = message_preview(&accumulated);
                    let _ = preview.send(local.clone());
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        match failure {
            Some(err) => {
                warn!(conversation_id = %conversation.id, %err, "generation stream failed");
                self.relay_notice(&conversation.id, classify_generation_error(&err))
                    .await;
            }
            None if !accumulated.is_empty() => {
                if let Err(err) = self.relay.send(&conversation.id, &accumulated).await {
                    warn!(conversation_id = %conversation.id, %err, "failed to relay reply");
                }
            }
            None => {}
        }
    }

    /// Audio variant: transcribe once, then relay the transcript as an
    /// operator-authored outbound message with a voice marker.
    pub async fn handle_audio(&self, conversation_id: &str, audio: &[u8], mime_type: &str) {
        let backend = self.backend.read().await.clone();
        let Some(backend) = backend else {
            self.relay_notice(conversation_id, AUDIO_NOT_CONFIGURED_TEXT)
                .await;
            return;
        };

        if !self.begin_typing(conversation_id).await {
            return;
        }

        match backend.transcribe(audio, mime_type).await {
            Ok(transcript) => {
                let text = format!("🎙️ \"{transcript}\"");
                if let Err(err) = self.relay.send(conversation_id, &text).await {
                    warn!(%conversation_id, %err, "failed to relay transcript");
                }
            }
            Err(err) => {
                warn!(%conversation_id, %err, "transcription failed");
                self.relay_notice(conversation_id, AUDIO_FAILED_TEXT).await;
            }
        }

        self.end_typing(conversation_id).await;
    }

    async fn relay_notice(&self, conversation_id: &str, text: &str) {
        if let Err(err) = self.relay.send(conversation_id, text).await {
            warn!(%conversation_id, %err, "failed to relay notice");
        }
    }
}

fn classify_generation_error(err: &str) -> &'static str {
    if is_credential_error(err) {
        AI_KEY_INVALID_TEXT
    } else {
        AI_CONNECTION_TEXT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ReplyStream;
    use crate::types::{now_iso, Customer, Platform};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn conversation(messages: &[(Sender, &str)]) -> Conversation {
        let mut conv = Conversation {
            id: "conv_42".to_string(),
            customer: Customer {
                id: "42".to_string(),
                username: "Messenger User 42".to_string(),
                real_name: "Messenger User 42".to_string(),
                platform: Platform::Facebook,
                avatar_url: String::new(),
                phone: String::new(),
                email: String::new(),
                notes: String::new(),
                tags: vec!["New Lead".to_string()],
            },
            messages: Vec::new(),
            last_message_preview: String::new(),
            unread_count: 0,
            timestamp: String::new(),
        };
        for (sender, text) in messages {
            let message = match sender {
                Sender::User => ChatMessage::user(text, now_iso()),
                Sender::Bot => ChatMessage::bot(text),
            };
            conv.push_message(message);
        }
        conv
    }

    struct RecordingRelay {
        sent: StdMutex<Vec<(String, String)>>,
    }

    impl RecordingRelay {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundSender for RecordingRelay {
        async fn send(&self, conversation_id: &str, text: &str) -> Result<ChatMessage, String> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), text.to_string()));
            Ok(ChatMessage::bot(text))
        }
    }

    struct ScriptedBackend {
        fragments: Vec<Result<String, String>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(fragments: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                fragments,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn stream_reply(&self, _: &str, _: &str) -> Result<ReplyStream, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(futures_util::stream::iter(
                self.fragments.clone(),
            )))
        }

        async fn transcribe(&self, _: &[u8], _: &str) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fragments.first() {
                Some(first) => first.clone(),
                None => Err("no transcript scripted".to_string()),
            }
        }
    }

    fn orchestrator(relay: Arc<RecordingRelay>) -> ReplyOrchestrator {
        ReplyOrchestrator::with_debounce(relay, Duration::from_millis(0))
    }

    fn preview_channel() -> (
        mpsc::UnboundedSender<Conversation>,
        mpsc::UnboundedReceiver<Conversation>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn fragments_are_relayed_once_as_one_text() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());
        let backend = ScriptedBackend::new(vec![
            Ok("Hi".to_string()),
            Ok(" there".to_string()),
            Ok("!".to_string()),
        ]);
        orchestrator.set_backend(Some(backend.clone())).await;

        let (tx, mut rx) = preview_channel();
        orchestrator
            .handle_update(&conversation(&[(Sender::User, "hello")]), &tx)
            .await;

        assert_eq!(
            relay.sent(),
            vec![("conv_42".to_string(), "Hi there!".to_string())]
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // The local preview grew fragment by fragment, placeholder replaced.
        let mut previews = Vec::new();
        while let Ok(view) = rx.try_recv() {
            previews.push(view.messages.last().unwrap().text.clone());
        }
        assert_eq!(previews, vec!["Hi", "Hi there", "Hi there!"]);
        assert!(!orchestrator.is_typing("conv_42").await);
    }

    #[tokio::test]
    async fn two_consecutive_user_messages_do_not_trigger() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());
        let backend = ScriptedBackend::new(vec![Ok("never".to_string())]);
        orchestrator.set_backend(Some(backend.clone())).await;

        let (tx, _rx) = preview_channel();
        orchestrator
            .handle_update(
                &conversation(&[(Sender::User, "hi"), (Sender::User, "price?")]),
                &tx,
            )
            .await;

        assert!(relay.sent().is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        // An intervening bot turn re-arms the trigger.
        orchestrator
            .handle_update(
                &conversation(&[
                    (Sender::User, "hi"),
                    (Sender::Bot, "hello!"),
                    (Sender::User, "price?"),
                ]),
                &tx,
            )
            .await;
        assert_eq!(relay.sent().len(), 1);
    }

    #[tokio::test]
    async fn bot_last_message_does_not_trigger() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());
        let (tx, _rx) = preview_channel();

        orchestrator
            .handle_update(
                &conversation(&[(Sender::User, "hi"), (Sender::Bot, "hello!")]),
                &tx,
            )
            .await;
        orchestrator.handle_update(&conversation(&[]), &tx).await;

        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_ai_relays_fixed_notice_without_backend_call() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());

        let (tx, mut rx) = preview_channel();
        orchestrator
            .handle_update(&conversation(&[(Sender::User, "hello")]), &tx)
            .await;

        assert_eq!(
            relay.sent(),
            vec![("conv_42".to_string(), AI_NOT_CONFIGURED_TEXT.to_string())]
        );
        assert!(rx.try_recv().is_err());
        assert!(!orchestrator.is_typing("conv_42").await);
    }

    #[tokio::test]
    async fn typing_marker_suppresses_duplicate_trigger() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());
        orchestrator.begin_typing("conv_42").await;

        let (tx, _rx) = preview_channel();
        orchestrator
            .handle_update(&conversation(&[(Sender::User, "hello")]), &tx)
            .await;

        assert!(relay.sent().is_empty());
        assert!(orchestrator.is_typing("conv_42").await);
    }

    #[tokio::test]
    async fn stream_error_relays_classified_notice_and_clears_typing() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());
        let backend = ScriptedBackend::new(vec![
            Ok("partial".to_string()),
            Err("network unreachable".to_string()),
        ]);
        orchestrator.set_backend(Some(backend)).await;

        let (tx, _rx) = preview_channel();
        orchestrator
            .handle_update(&conversation(&[(Sender::User, "hello")]), &tx)
            .await;

        // The partial accumulation is discarded, not relayed.
        assert_eq!(
            relay.sent(),
            vec![("conv_42".to_string(), AI_CONNECTION_TEXT.to_string())]
        );
        assert!(!orchestrator.is_typing("conv_42").await);
    }

    #[tokio::test]
    async fn credential_errors_get_their_own_notice() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());
        let backend = ScriptedBackend::new(vec![Err("400: API_KEY_INVALID".to_string())]);
        orchestrator.set_backend(Some(backend)).await;

        let (tx, _rx) = preview_channel();
        orchestrator
            .handle_update(&conversation(&[(Sender::User, "hello")]), &tx)
            .await;

        assert_eq!(
            relay.sent(),
            vec![("conv_42".to_string(), AI_KEY_INVALID_TEXT.to_string())]
        );
    }

    #[tokio::test]
    async fn audio_transcript_is_relayed_with_voice_marker() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());
        let backend = ScriptedBackend::new(vec![Ok("book me for botox".to_string())]);
        orchestrator.set_backend(Some(backend)).await;

        orchestrator
            .handle_audio("conv_42", b"audio-bytes", "audio/webm")
            .await;

        assert_eq!(
            relay.sent(),
            vec![(
                "conv_42".to_string(),
                "🎙️ \"book me for botox\"".to_string()
            )]
        );
        assert!(!orchestrator.is_typing("conv_42").await);
    }

    #[tokio::test]
    async fn audio_failure_and_unconfigured_paths_use_fixed_notices() {
        let relay = RecordingRelay::new();
        let orchestrator = orchestrator(relay.clone());

        orchestrator.handle_audio("conv_42", b"x", "audio/webm").await;

        let backend = ScriptedBackend::new(vec![Err("garbled".to_string())]);
        orchestrator.set_backend(Some(backend)).await;
        orchestrator.handle_audio("conv_42", b"x", "audio/webm").await;

        assert_eq!(
            relay.sent(),
            vec![
                ("conv_42".to_string(), AUDIO_NOT_CONFIGURED_TEXT.to_string()),
                ("conv_42".to_string(), AUDIO_FAILED_TEXT.to_string()),
            ]
        );
        assert!(!orchestrator.is_typing("conv_42").await);
    }
}
