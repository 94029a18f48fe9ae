//! Provider-facing conversation history.
//!
//! Stored user messages carry only what the user sent. Before they go to the
//! model, each one is prefixed with who sent it, their household, and how
//! many attachments came along, so the model can attribute transactions.

use crate::message::{Message, MessageRole, Part};
use crate::session::AuthorProfile;
use serde::{Deserialize, Serialize};
use tally_core::MessageId;

/// A message in the shape the generation provider consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// The stored message this entry was built from.
    pub id: MessageId,
    pub role: MessageRole,
    pub parts: Vec<Part>,
}

/// Renders the sender block placed in front of a user message.
#[must_use]
pub fn user_preamble(author: &AuthorProfile, text: &str, attachment_count: usize) -> String {
    let mut out = String::from("<message>\n");
    out.push_str(&format!("<text>{text}</text>\n"));
    if attachment_count > 0 {
        out.push_str(&format!(
            "<attachments>The user included {attachment_count} attachment(s).</attachments>\n"
        ));
    }
    out.push_str("</message>\n<sender>\n");
    out.push_str(&format!("id: {}\nname: {}\n", author.user_id, author.name));
    match &author.household {
        Some(household) => out.push_str(&format!(
            "household_id: {}\nhousehold_name: {}\n",
            household.id, household.name
        )),
        None => out.push_str("household_id: none\n"),
    }
    out.push_str("</sender>");
    out
}

/// Converts a stored message into its provider-facing form.
///
/// User messages get their media parts first, followed by a single text
/// part holding the preamble and the original text. Model and tool messages
/// pass through unchanged.
#[must_use]
pub fn to_history(message: &Message, author: Option<&AuthorProfile>) -> HistoryMessage {
    let parts = match (message.role, author) {
        (MessageRole::User, Some(author)) => {
            let mut parts: Vec<Part> = message
                .parts
                .iter()
                .filter(|p| p.is_media())
                .cloned()
                .collect();
            parts.push(Part::text(user_preamble(
                author,
                &message.text(),
                message.attachment_count(),
            )));
            parts
        }
        _ => message.parts.clone(),
    };

    HistoryMessage {
        id: message.id,
        role: message.role,
        parts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::HouseholdProfile;
    use chrono::Utc;
    use tally_core::{ConversationSessionId, HouseholdId, UserId};

    fn author(household: bool) -> AuthorProfile {
        AuthorProfile {
            user_id: UserId::new(),
            name: "Ana".to_string(),
            household: household.then(|| HouseholdProfile {
                id: HouseholdId::new(),
                name: "Casa".to_string(),
            }),
        }
    }

    fn message(role: MessageRole, parts: Vec<Part>, author_id: UserId) -> Message {
        Message {
            id: MessageId::new(),
            session_id: ConversationSessionId::new(),
            role,
            parts,
            author_id,
            parent_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn preamble_identifies_sender_and_household() {
        let profile = author(true);
        let preamble = user_preamble(&profile, "spent 20 on gas", 2);

        assert!(preamble.contains(&profile.user_id.to_string()));
        assert!(preamble.contains("name: Ana"));
        assert!(preamble.contains("household_name: Casa"));
        assert!(preamble.contains("<text>spent 20 on gas</text>"));
        assert!(preamble.contains("2 attachment(s)"));
    }

    #[test]
    fn preamble_without_household() {
        let preamble = user_preamble(&author(false), "hi", 0);
        assert!(preamble.contains("household_id: none"));
        assert!(!preamble.contains("<attachments>"));
    }

    #[test]
    fn user_message_puts_media_before_text() {
        let profile = author(false);
        let stored = message(
            MessageRole::User,
            vec![
                Part::text("receipt attached"),
                Part::media("image/png", "file:///r.png"),
            ],
            profile.user_id,
        );

        let entry = to_history(&stored, Some(&profile));

        assert_eq!(entry.parts.len(), 2);
        assert!(entry.parts[0].is_media());
        let text = entry.parts[1].as_text().unwrap();
        assert!(text.contains("receipt attached"));
        assert!(text.contains("1 attachment(s)"));
    }

    #[test]
    fn model_message_passes_through() {
        let stored = message(MessageRole::Model, vec![Part::text("ok")], UserId::new());
        let entry = to_history(&stored, None);
        assert_eq!(entry.parts, stored.parts);
        assert_eq!(entry.role, MessageRole::Model);
    }
}
