use chrono::Duration;
use rand::seq::SliceRandom;

use crate::config::MessagesConfig;

/// Renders the user-facing texts sent instead of a model answer.
#[derive(Clone, Debug)]
pub struct MessageTemplates {
    config: MessagesConfig,
}

impl MessageTemplates {
    pub fn new(config: MessagesConfig) -> Self {
        Self { config }
    }

    pub fn limit_reached(&self, count: u32, ceiling: u32) -> String {
        self.config
            .limit_reached
            .replace("{count}", &count.to_string())
            .replace("{ceiling}", &ceiling.to_string())
            .replace("{company_phone}", &self.config.company_phone)
    }

    pub fn blocked(&self, remaining: Duration) -> String {
        self.config
            .blocked
            .replace("{remaining}", &format_remaining(remaining))
            .replace("{company_phone}", &self.config.company_phone)
    }

    pub fn maintenance(&self) -> String {
        let candidates: Vec<&String> =
            self.config.maintenance.iter().filter(|message| !message.trim().is_empty()).collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|message| message.replace("{company_phone}", &self.config.company_phone))
            .unwrap_or_else(|| "The assistant is temporarily unavailable.".to_string())
    }

    pub fn received(&self) -> &str {
        &self.config.received
    }
}

pub fn format_remaining(remaining: Duration) -> String {
    let total_minutes = remaining.num_minutes().max(0);
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes % (24 * 60) + 59) / 60;

    match (days, hours) {
        (0, 0) => "1 minute".to_string(),
        (0, 1) => "1 hour".to_string(),
        (0, hours) => format!("{hours} hours"),
        (1, 0) => "1 day".to_string(),
        (1, hours) => format!("1 day and {hours} hours"),
        (days, _) => format!("{days} days"),
    }
}
