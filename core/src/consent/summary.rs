// Plain-language paraphrase of a consent summary
//
// The summarizer itself is an external service; this module only fixes the
// prompt and the fallback shown when the service fails.

use super::types::ConsentRecord;
use async_trait::async_trait;
use tracing::warn;

/// Prefix put in front of the consent summary
pub const SUMMARY_PROMPT_PREFIX: &str = "What does this mean:";

/// Shown in place of a paraphrase when the summarizer fails
pub const SUMMARY_FALLBACK: &str = "Failed to fetch response.";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: String) -> Result<String, String>;
}

pub fn summary_prompt(record: &ConsentRecord) -> String {
    format!("{}{}", SUMMARY_PROMPT_PREFIX, record.summary)
}

/// Paraphrase `record.summary`, never failing
pub async fn describe_consent(summarizer: &dyn Summarizer, record: &ConsentRecord) -> String {
    match summarizer.summarize(summary_prompt(record)).await {
        Ok(text) => text,
        Err(e) => {
            warn!(consent = %record.id, "summarizer failed: {}", e);
            SUMMARY_FALLBACK.to_string()
        }
    }
}
