/// Pre-flight token estimate for a prompt. Must be monotonic in text length.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;
}

/// Roughly four characters per token, rounded up.
#[derive(Clone, Copy, Debug)]
pub struct CharRatioEstimator {
    chars_per_token: u64,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: u64) -> Self {
        Self { chars_per_token: chars_per_token.max(1) }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars.div_ceil(self.chars_per_token)
    }
}
