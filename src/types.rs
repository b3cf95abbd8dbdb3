use std::{path::PathBuf, sync::atomic::AtomicUsize};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::realtime::RealtimeState;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Facebook,
    Instagram,
    TikTok,
    WhatsApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "bot")]
    Bot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "Private Message")]
    PrivateMessage,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub username: String,
    pub real_name: String,
    pub platform: Platform,
    pub avatar_url: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub customer: Customer,
    pub messages: Vec<ChatMessage>,
    pub last_message_preview: String,
    pub unread_count: u32,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConnection {
    pub platform: Platform,
    pub connected: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub page_id: String,
    #[serde(default)]
    pub access_token: String,
}

impl PlatformConnection {
    pub fn disconnected(platform: Platform) -> Self {
        Self {
            platform,
            connected: false,
            app_id: String::new(),
            app_secret: String::new(),
            page_id: String::new(),
            access_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub verify_token: String,
    #[serde(default)]
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub price: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    pub platform: Platform,
    pub trigger: String,
    pub keywords: Vec<String>,
    pub public_reply: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// The whole durable document. Rewritten wholesale on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    #[serde(default)]
    pub connections: Vec<PlatformConnection>,
    #[serde(default)]
    pub ai_config: AiConfig,
    #[serde(default)]
    pub webhook_config: WebhookConfig,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub automation_rules: Vec<AutomationRule>,
    #[serde(default)]
    pub calendar_events: Vec<CalendarEvent>,
    #[serde(default)]
    pub welcome_message: String,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn message_id(prefix: &str) -> String {
    format!("msg_{prefix}_{}", Utc::now().timestamp_millis())
}

/// First ~40 characters of the latest message text, always ellipsized.
pub fn message_preview(text: &str) -> String {
    let head: String = text.chars().take(40).collect();
    format!("{head}...")
}

impl ChatMessage {
    pub fn user(text: &str, timestamp: String) -> Self {
        Self {
            id: message_id("user"),
            text: text.to_string(),
            sender: Sender::User,
            timestamp,
            kind: MessageKind::PrivateMessage,
        }
    }

    pub fn bot(text: &str) -> Self {
        Self {
            id: message_id("bot"),
            text: text.to_string(),
            sender: Sender::Bot,
            timestamp: now_iso(),
            kind: MessageKind::PrivateMessage,
        }
    }
}

impl Conversation {
    /// Appends a message and refreshes the denormalized fields derived from it.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.last_message_preview = message_preview(&message.text);
        self.timestamp = message.timestamp.clone();
        if message.sender == Sender::User {
            self.unread_count += 1;
        }
        self.messages.push(message);
    }
}

impl Database {
    /// Default structure written when the durable file is missing or corrupt.
    pub fn initial() -> Self {
        Self {
            connections: vec![
                PlatformConnection::disconnected(Platform::Facebook),
                PlatformConnection::disconnected(Platform::Instagram),
                PlatformConnection::disconnected(Platform::TikTok),
                PlatformConnection::disconnected(Platform::WhatsApp),
            ],
            ai_config: AiConfig::default(),
            webhook_config: WebhookConfig {
                verify_token: format!("metaluxe-token-{}", Uuid::new_v4().simple()),
                callback_url: String::new(),
            },
            conversations: Vec::new(),
            services: seed_services(),
            automation_rules: seed_automation_rules(),
            calendar_events: Vec::new(),
            welcome_message: String::new(),
        }
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn conversation_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
    }

    pub fn connection(&self, platform: Platform) -> Option<&PlatformConnection> {
        self.connections.iter().find(|c| c.platform == platform)
    }

    pub fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    /// Records an inbound user message, creating the customer and conversation
    /// on first contact. Returns a clone of the mutated conversation.
    pub fn record_inbound(
        &mut self,
        sender_id: &str,
        text: &str,
        timestamp: String,
    ) -> Conversation {
        let message = ChatMessage::user(text, timestamp);
        let conversation_id = format!("conv_{sender_id}");

        let updated = if let Some(conversation) = self.conversation_mut(&conversation_id) {
            conversation.push_message(message);
            conversation.clone()
        } else {
            let display_name = format!("Messenger User {sender_id}");
            let mut conversation = Conversation {
                id: conversation_id,
                customer: Customer {
                    id: sender_id.to_string(),
                    username: display_name.clone(),
                    real_name: display_name,
                    platform: Platform::Facebook,
                    avatar_url: format!("https://picsum.photos/seed/{sender_id}/100/100"),
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
            conversation.push_message(message);
            let updated = conversation.clone();
            self.conversations.insert(0, conversation);
            updated
        };

        self.sort_conversations();
        updated
    }

    /// Records an upstream-accepted outbound message. Returns the created
    /// message and the mutated conversation.
    pub fn record_outbound(
        &mut self,
        conversation_id: &str,
        text: &str,
    ) -> Option<(ChatMessage, Conversation)> {
        let message = ChatMessage::bot(text);
        let conversation = self.conversation_mut(conversation_id)?;
        conversation.push_message(message.clone());
        self.sort_conversations();
        self.conversation(conversation_id)
            .cloned()
            .map(|conversation| (message, conversation))
    }
}

fn seed_services() -> Vec<Service> {
    vec![
        Service {
            id: "serv1".to_string(),
            name: "Botox Application".to_string(),
            price: "$250".to_string(),
            description: "Per area, reduces wrinkles and fine lines.".to_string(),
        },
        Service {
            id: "serv2".to_string(),
            name: "Full Facial Cleansing".to_string(),
            price: "$80".to_string(),
            description: "Deep cleansing, exfoliation, and hydration.".to_string(),
        },
        Service {
            id: "serv3".to_string(),
            name: "Laser Hair Removal (Legs)".to_string(),
            price: "$150".to_string(),
            description: "Full leg session using diode laser.".to_string(),
        },
    ]
}

fn seed_automation_rules() -> Vec<AutomationRule> {
    vec![
        AutomationRule {
            id: "rule1".to_string(),
            platform: Platform::Facebook,
            trigger: "comment".to_string(),
            keywords: vec!["price".to_string(), "info".to_string(), "cost".to_string()],
            public_reply: "¡Hola! Te hemos enviado la información por mensaje directo 👋"
                .to_string(),
            system_prompt: "You are a friendly and professional salon assistant. The user \
                            commented asking for price/info. Inform them that you are here to \
                            help and provide the pricing for a Full Facial Cleansing, which is \
                            $80. Ask if they would like to book an appointment."
                .to_string(),
        },
        AutomationRule {
            id: "rule2".to_string(),
            platform: Platform::Instagram,
            trigger: "comment".to_string(),
            keywords: vec!["appointment".to_string(), "book".to_string()],
            public_reply: "¡Claro! Te envío un DM para agendar tu cita. ✨".to_string(),
            system_prompt: "You are a friendly and efficient salon assistant. The user wants to \
                            book an appointment. Provide them with the Calendly link: \
                            https://calendly.com/salon-demo/30min and encourage them to book a \
                            slot that works for them."
                .to_string(),
        },
        AutomationRule {
            id: "rule3".to_string(),
            platform: Platform::TikTok,
            trigger: "comment".to_string(),
            keywords: vec![
                "info".to_string(),
                "precio".to_string(),
                "agendar".to_string(),
            ],
            public_reply: "¡Hola! Revisa el enlace en nuestro perfil para ver todos los precios \
                           y agendar. 💖"
                .to_string(),
            system_prompt: "You are a fun and trendy salon assistant for TikTok. The user is \
                            asking for info. The TikTok API does not allow sending DMs from \
                            comments. Publicly tell them to check the link in the bio for all \
                            info and booking, using emojis."
                .to_string(),
        },
    ]
}

pub struct AppState {
    pub store: Store,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub http: reqwest::Client,
    pub graph_base_url: String,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        let graph_base_url = std::env::var("GRAPH_API_BASE_URL")
            .unwrap_or_else(|_| "https://graph.facebook.com/v21.0".to_string());
        Self::with_graph_base_url(store, graph_base_url)
    }

    pub fn with_graph_base_url(store: Store, graph_base_url: String) -> Self {
        Self {
            store,
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            http: reqwest::Client::new(),
            graph_base_url,
        }
    }
}

pub fn db_path_from_env() -> PathBuf {
    std::env::var("INBOX_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("db.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_to_forty_chars() {
        let long = "a".repeat(60);
        assert_eq!(message_preview(&long), format!("{}...", "a".repeat(40)));
        assert_eq!(message_preview("price?"), "price?...");
    }

    #[test]
    fn inbound_from_unseen_sender_creates_lead() {
        let mut db = Database::initial();
        let conversation = db.record_inbound("9001", "hello", now_iso());

        assert_eq!(conversation.id, "conv_9001");
        assert_eq!(conversation.customer.id, "9001");
        assert_eq!(conversation.customer.tags, vec!["New Lead".to_string()]);
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(db.conversations[0].id, "conv_9001");
    }

    #[test]
    fn inbound_from_known_sender_appends() {
        let mut db = Database::initial();
        db.record_inbound("42", "hi", now_iso());
        let conversation = db.record_inbound("42", "price?", now_iso());

        assert_eq!(db.conversations.len(), 1);
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].text, "price?");
        assert_eq!(conversation.unread_count, 2);
        assert_eq!(conversation.last_message_preview, "price?...");
        assert_eq!(conversation.timestamp, conversation.messages[1].timestamp);
    }

    #[test]
    fn conversations_stay_sorted_descending() {
        let mut db = Database::initial();
        db.record_inbound("1", "first", "2024-01-01T00:00:00+00:00".to_string());
        db.record_inbound("2", "second", "2024-01-03T00:00:00+00:00".to_string());
        db.record_inbound("3", "third", "2024-01-02T00:00:00+00:00".to_string());

        let ids: Vec<&str> = db.conversations.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["conv_2", "conv_3", "conv_1"]);

        for window in db.conversations.windows(2) {
            assert!(window[0].timestamp >= window[1].timestamp);
        }
    }

    #[test]
    fn outbound_appends_bot_message_without_unread() {
        let mut db = Database::initial();
        db.record_inbound("7", "hi", now_iso());
        let (message, conversation) = db.record_outbound("conv_7", "welcome!").unwrap();

        assert_eq!(message.sender, Sender::Bot);
        assert_eq!(conversation.messages.last().unwrap(), &message);
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(conversation.last_message_preview, "welcome!...");
        assert!(db.record_outbound("conv_missing", "x").is_none());
    }

    #[test]
    fn wire_format_matches_dashboard_shapes() {
        let message = ChatMessage::bot("hello");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["sender"], "bot");
        assert_eq!(value["type"], "Private Message");

        let db = Database::initial();
        let value = serde_json::to_value(&db).unwrap();
        assert_eq!(value["connections"][0]["platform"], "Facebook");
        assert!(value["webhookConfig"]["verifyToken"]
            .as_str()
            .unwrap()
            .starts_with("metaluxe-token-"));
    }
}
