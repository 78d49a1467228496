use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// How far along a sender is in the purchase funnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseIntent {
    Curious,
    /// Still shopping around; earns the throttle bonus.
    Interested,
    /// Decided to buy; triggers the human handoff.
    Buyer,
}

impl PurchaseIntent {
    pub const ALL: [Self; 3] = [Self::Curious, Self::Interested, Self::Buyer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Curious => "curious",
            Self::Interested => "interested",
            Self::Buyer => "buyer",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "curious" => Ok(Self::Curious),
            "interested" => Ok(Self::Interested),
            "buyer" => Ok(Self::Buyer),
            other => Err(DomainError::UnknownIntent(other.to_string())),
        }
    }

    /// Menu option as offered to the sender ("1", "2", "3").
    pub fn from_menu_choice(choice: &str) -> Option<Self> {
        match choice.trim() {
            "1" => Some(Self::Curious),
            "2" => Some(Self::Interested),
            "3" => Some(Self::Buyer),
            _ => None,
        }
    }
}

/// Where a purchase decision came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Menu,
    Classifier,
}

impl IntentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Menu => "menu",
            Self::Classifier => "classifier",
        }
    }
}
