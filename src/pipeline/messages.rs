//! Sample records and the conversation-to-message normalizer.
//!
//! Source datasets store dialogue as ShareGPT-style
//! `{"from": "human", "value": "..."}` turns or chat-style
//! `{"role": "user", "content": "..."}` turns, and sometimes mix the two
//! spellings within one turn. [`Turn`] keeps all four fields; [`normalize`]
//! resolves the role and the text separately and drops, with a warning, a
//! turn that lacks either.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One dataset record: an image reference plus its dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Image path, relative to the image folder unless absolute.
    pub image: String,

    #[serde(flatten)]
    pub dialogue: Dialogue,
}

/// The dialogue attached to a sample, raw or already normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialogue {
    Conversations(Vec<Turn>),
    Messages(Vec<Message>),
}

/// A raw dialogue turn as found in the dataset.
///
/// Fields are kept as raw JSON so a malformed turn is dropped on its own
/// instead of failing the whole dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

impl Turn {
    /// `from`, else `role`, if it is a string.
    pub fn role_name(&self) -> Option<&str> {
        self.from.as_ref().or(self.role.as_ref())?.as_str()
    }

    /// `value`, else `content`, if it is a string.
    pub fn text(&self) -> Option<&str> {
        self.value.as_ref().or(self.content.as_ref())?.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Map a source role name onto the normalized roles.
    ///
    /// `human`/`user` become [`Role::User`], `gpt`/`assistant` become
    /// [`Role::Assistant`]. Raw turns never produce [`Role::System`].
    pub fn from_source(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "human" | "user" => Some(Role::User),
            "gpt" | "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One element of a message's content list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Image,
    Text { text: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// A normalized chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    /// Number of image parts in this message.
    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|p| matches!(p, ContentPart::Image))
            .count()
    }
}

/// Convert a sample's dialogue into normalized messages.
///
/// The first turn that normalizes to `user` carries `[Image, Text]`; every
/// other turn carries `[Text]`. Turns with unknown roles or shapes are
/// dropped with a warning. Zero turns yield an empty list.
pub fn normalize(sample: &Sample) -> Vec<Message> {
    let turns = match &sample.dialogue {
        Dialogue::Messages(messages) => return messages.clone(),
        Dialogue::Conversations(turns) => turns,
    };

    let mut out = Vec::with_capacity(turns.len());
    let mut image_placed = false;

    for (i, turn) in turns.iter().enumerate() {
        let (Some(role_name), Some(text)) = (turn.role_name(), turn.text()) else {
            warn!(
                "Sample {}: turn {} has no string from/role or value/content, dropped: {:?}",
                sample_label(sample),
                i,
                turn
            );
            continue;
        };

        let Some(role) = Role::from_source(role_name) else {
            warn!(
                "Sample {}: turn {} has unknown role '{}', dropped",
                sample_label(sample),
                i,
                role_name
            );
            continue;
        };

        let content = if role == Role::User && !image_placed {
            image_placed = true;
            vec![ContentPart::Image, ContentPart::text(text)]
        } else {
            vec![ContentPart::text(text)]
        };
        out.push(Message { role, content });
    }

    out
}

fn sample_label(sample: &Sample) -> &str {
    sample.id.as_deref().unwrap_or(&sample.image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(turns: serde_json::Value) -> Sample {
        serde_json::from_value(serde_json::json!({
            "id": "s1",
            "image": "ptb-xl/00001.png",
            "conversations": turns,
        }))
        .unwrap()
    }

    #[test]
    fn zero_turns_normalize_to_empty() {
        let s = sample(serde_json::json!([]));
        assert!(normalize(&s).is_empty());
    }

    #[test]
    fn first_user_turn_gets_image_then_text() {
        let s = sample(serde_json::json!([
            {"from": "human", "value": "What rhythm is this?"},
            {"from": "gpt", "value": "Sinus rhythm."},
            {"from": "human", "value": "Any ST changes?"},
        ]));
        let msgs = normalize(&s);
        assert_eq!(msgs.len(), 3);
        assert_eq!(
            msgs[0].content,
            vec![ContentPart::Image, ContentPart::text("What rhythm is this?")]
        );
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].content, vec![ContentPart::text("Sinus rhythm.")]);
        assert_eq!(msgs[2].image_count(), 0);
    }

    #[test]
    fn chat_style_turns_are_accepted() {
        let s = sample(serde_json::json!([
            {"role": "Assistant", "content": "Hello"},
            {"role": "USER", "content": "Read this ECG"},
        ]));
        let msgs = normalize(&s);
        assert_eq!(msgs[0].role, Role::Assistant);
        assert_eq!(msgs[0].image_count(), 0);
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[1].content[0], ContentPart::Image);
    }

    #[test]
    fn unknown_roles_and_shapes_are_dropped() {
        let s = sample(serde_json::json!([
            {"from": "narrator", "value": "..."},
            {"speaker": "human", "text": "hi"},
            {"from": "human", "value": "Describe the ECG"},
        ]));
        let msgs = normalize(&s);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].image_count(), 1);
    }

    #[test]
    fn mixed_field_spellings_resolve_independently() {
        let s = sample(serde_json::json!([
            {"from": "human", "content": "Describe"},
            {"role": "assistant", "value": "Sinus rhythm."},
        ]));
        let msgs = normalize(&s);
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            msgs[0].content,
            vec![ContentPart::Image, ContentPart::text("Describe")]
        );
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].content, vec![ContentPart::text("Sinus rhythm.")]);
    }

    #[test]
    fn sharegpt_fields_take_precedence() {
        let turn: Turn = serde_json::from_str(
            r#"{"from": "gpt", "role": "user", "value": "a", "content": "b"}"#,
        )
        .unwrap();
        assert_eq!(turn.role_name(), Some("gpt"));
        assert_eq!(turn.text(), Some("a"));
    }

    #[test]
    fn non_string_text_drops_only_that_turn() {
        let s = sample(serde_json::json!([
            {"from": "human", "value": ["not", "text"]},
            {"from": "human", "value": "What rhythm?"},
        ]));
        let msgs = normalize(&s);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].image_count(), 1);
    }

    #[test]
    fn normalized_messages_pass_through() {
        let s: Sample = serde_json::from_value(serde_json::json!({
            "image": "x.png",
            "messages": [
                {"role": "system", "content": [{"type": "text", "text": "Be brief."}]},
                {"role": "user", "content": [{"type": "image"}, {"type": "text", "text": "?"}]},
            ],
        }))
        .unwrap();
        let msgs = normalize(&s);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
    }

    #[test]
    fn content_part_wire_format() {
        let json = serde_json::to_string(&vec![ContentPart::Image, ContentPart::text("a")]).unwrap();
        assert_eq!(json, r#"[{"type":"image"},{"type":"text","text":"a"}]"#);
    }
}
