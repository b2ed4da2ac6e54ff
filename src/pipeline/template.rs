//! Chat templates: normalized messages → chat-formatted text.
//!
//! The rendered text carries one image marker (the processor's
//! begin-of-image token) wherever a message holds an [`ContentPart::Image`];
//! the processor later expands each marker into the model's full image
//! token run.

use crate::pipeline::messages::{ContentPart, Message, Role};
use serde::{Deserialize, Serialize};

/// Which chat format to render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    /// `<start_of_turn>user … <end_of_turn>` (Gemma family). System text is
    /// folded into the first user turn.
    #[default]
    Gemma,
    /// `<|im_start|>user … <|im_end|>`.
    ChatMl,
}

/// Token strings the template splices into the text.
#[derive(Debug, Clone)]
pub struct TemplateTokens {
    pub bos: String,
    pub image_marker: String,
}

impl ChatTemplate {
    /// Render `messages` to a single string.
    ///
    /// Training calls this with `add_generation_prompt = false`; the result is
    /// trimmed of surrounding whitespace.
    pub fn render(
        &self,
        messages: &[Message],
        tokens: &TemplateTokens,
        add_generation_prompt: bool,
    ) -> String {
        let text = match self {
            ChatTemplate::Gemma => render_gemma(messages, tokens, add_generation_prompt),
            ChatTemplate::ChatMl => render_chatml(messages, tokens, add_generation_prompt),
        };
        text.trim().to_string()
    }
}

fn render_parts(parts: &[ContentPart], tokens: &TemplateTokens, out: &mut String) {
    for part in parts {
        match part {
            ContentPart::Image => out.push_str(&tokens.image_marker),
            ContentPart::Text { text } => out.push_str(text.trim()),
        }
    }
}

fn render_gemma(messages: &[Message], tokens: &TemplateTokens, add_generation_prompt: bool) -> String {
    let mut out = String::from(&tokens.bos);

    let (system, rest) = match messages.first() {
        Some(m) if m.role == Role::System => (Some(m), &messages[1..]),
        _ => (None, messages),
    };

    for (i, message) in rest.iter().enumerate() {
        let role = match message.role {
            Role::Assistant => "model",
            Role::User | Role::System => "user",
        };
        out.push_str("<start_of_turn>");
        out.push_str(role);
        out.push('\n');
        if i == 0 {
            if let Some(system) = system {
                render_parts(&system.content, tokens, &mut out);
                out.push_str("\n\n");
            }
        }
        render_parts(&message.content, tokens, &mut out);
        out.push_str("<end_of_turn>\n");
    }

    if add_generation_prompt {
        out.push_str("<start_of_turn>model\n");
    }
    out
}

fn render_chatml(messages: &[Message], tokens: &TemplateTokens, add_generation_prompt: bool) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str("<|im_start|>");
        out.push_str(message.role.as_str());
        out.push('\n');
        render_parts(&message.content, tokens, &mut out);
        out.push_str("<|im_end|>\n");
    }
    if add_generation_prompt {
        out.push_str("<|im_start|>assistant\n");
    }
    out
}
