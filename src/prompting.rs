use minijinja::{context, Environment};

use crate::types::{ChatMessage, Sender, Service};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

/// How many trailing messages of a conversation are fed to the model.
pub const HISTORY_WINDOW: usize = 8;

pub const PERSONA_NAME: &str = "Eva";

pub fn render_system_prompt(services: &[Service]) -> String {
    let service_list = service_knowledge_list(services);

    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(&service_list);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(&service_list);
    };

    template
        .render(context! { service_list => service_list })
        .unwrap_or_else(|_| fallback_system_prompt(&service_list))
}

fn fallback_system_prompt(service_list: &str) -> String {
    format!(
        "You are \"{PERSONA_NAME},\" an expert AI sales agent for \"MetaLuxe,\" a high-end \
         beauty salon. Convert every client interaction into a booked appointment. Be \
         proactive, persuasive, and professional. Keep responses under 60 words.\n\n\
         Salon services and prices:\n{service_list}"
    )
}

pub fn service_knowledge_list(services: &[Service]) -> String {
    services
        .iter()
        .map(|s| format!("- {}: {} ({})", s.name, s.price, s.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Formats the trailing history window as alternating `Client:`/persona turns.
pub fn format_history(messages: &[ChatMessage]) -> String {
    let start = messages.len().saturating_sub(HISTORY_WINDOW);
    messages[start..]
        .iter()
        .map(|msg| {
            let speaker = match msg.sender {
                Sender::User => "Client",
                Sender::Bot => PERSONA_NAME,
            };
            format!("{speaker}: {}", msg.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
