use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Opaque identifier of a conversation partner (phone number, chat id, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderId(pub String);

impl SenderId {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > 128 || trimmed.chars().any(char::is_control) {
            return Err(DomainError::InvalidSender(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::SenderId;

    #[test]
    fn parse_trims_and_rejects_blank_or_control_characters() {
        assert_eq!(SenderId::parse(" 5511999990000 ").map(|id| id.0), Ok("5511999990000".into()));
        assert!(SenderId::parse("   ").is_err());
        assert!(SenderId::parse("abc\n").is_ok());
        assert!(SenderId::parse("a\u{7}b").is_err());
    }
}
