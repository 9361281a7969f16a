use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::{RepairError, RepairSuggester};

/// Records every prompt it receives and answers with a fixed selector.
#[derive(Debug, Default)]
pub struct RecordingSuggester {
    answer: String,
    prompts: Mutex<Vec<String>>,
}

impl RecordingSuggester {
    pub fn answering(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RepairSuggester for RecordingSuggester {
    async fn suggest(&self, prompt: &str) -> Result<String, RepairError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        Ok(self.answer.clone())
    }
}
