use promptmend_core::AnalysisRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of trailing conversation turns that participate in the key
pub const FINGERPRINT_TURNS: usize = 2;

const FINGERPRINT_VERSION: &[u8] = b"promptmend-fingerprint-v1";

/// Deterministic cache key for a request.
///
/// Covers the last two turns (role and content), the rendered target
/// response and the rendered feedback. Every field is length-prefixed so
/// moving text between fields always changes the digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &AnalysisRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION);

        let turns = request.recent_turns(FINGERPRINT_TURNS);
        hasher.update((turns.len() as u64).to_le_bytes());
        for turn in turns {
            update_field(&mut hasher, &turn.role);
            update_field(&mut hasher, &turn.content);
        }

        update_field(&mut hasher, &request.target_response_text());
        update_field(&mut hasher, &request.feedback_text());

        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts only the 64-character lowercase hex form produced by [`Fingerprint::of`]
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Fingerprint(s.to_string()))
    }
}

fn update_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptmend_core::ConversationTurn;

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            conversation_history: vec![
                ConversationTurn::new("user", "hello"),
                ConversationTurn::new("user", "How do I reset my password?"),
                ConversationTurn::new("bot", "I can't help with that."),
            ],
            target_response: Some("I can't help with that.".into()),
            feedback: Some("Bot should have used the password-reset skill".into()),
            governing_prompt: Some("You are a support bot.".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = Fingerprint::of(&request());
        assert_eq!(fp, Fingerprint::of(&request()));
        assert_eq!(fp.as_str().len(), 64);
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp));
    }

    #[test]
    fn test_only_last_two_turns_participate() {
        let mut other = request();
        other.conversation_history[0].content = "something else entirely".to_string();
        other.governing_prompt = Some("Different prompt".to_string());
        assert_eq!(Fingerprint::of(&request()), Fingerprint::of(&other));
    }

    #[test]
    fn test_turn_order_and_roles_matter() {
        let base = Fingerprint::of(&request());

        let mut swapped = request();
        swapped.conversation_history.swap(1, 2);
        assert_ne!(base, Fingerprint::of(&swapped));

        let mut relabelled = request();
        relabelled.conversation_history[2].role = "assistant".to_string();
        assert_ne!(base, Fingerprint::of(&relabelled));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let mut a = request();
        a.target_response = Some("ab".into());
        a.feedback = Some("c".into());

        let mut b = request();
        b.target_response = Some("a".into());
        b.feedback = Some("bc".into());

        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert!(Fingerprint::parse("../etc/passwd").is_none());
        assert!(Fingerprint::parse(&"A".repeat(64)).is_none());
    }
}
