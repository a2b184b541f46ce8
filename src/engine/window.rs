//! Context window management: keeps the outgoing message list within a token budget.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::llm::{ChatMessage, ChatRole};

/// Token counter used for budget decisions. Counts are approximate.
#[derive(Clone)]
pub enum Tokenizer {
    Bpe(Arc<CoreBPE>),
    /// Fallback when no BPE table can be loaded
    Bytes,
}

impl Tokenizer {
    /// Pick the encoding for `model`, falling back to `cl100k_base`, then to byte counting.
    pub fn for_model(model: &str) -> Self {
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => return Tokenizer::Bpe(Arc::new(bpe)),
            Err(e) => tracing::debug!(model, error = %e, "No model-specific tokenizer, using cl100k_base"),
        }
        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Tokenizer::Bpe(Arc::new(bpe)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load cl100k_base, counting bytes");
                Tokenizer::Bytes
            }
        }
    }

    pub fn count(&self, text: &str) -> usize {
        match self {
            Tokenizer::Bpe(bpe) => bpe.encode_with_special_tokens(text).len(),
            Tokenizer::Bytes => text.len(),
        }
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tokenizer::Bpe(_) => write!(f, "Tokenizer::Bpe"),
            Tokenizer::Bytes => write!(f, "Tokenizer::Bytes"),
        }
    }
}

/// Result of fitting a message list into the window.
#[derive(Debug, Clone)]
pub struct WindowFit {
    /// Token count before truncation
    pub original_tokens: usize,
    /// Token count of `messages`
    pub tokens: usize,
    pub messages: Vec<ChatMessage>,
}

impl WindowFit {
    pub fn truncated(&self) -> bool {
        self.tokens < self.original_tokens
    }
}

#[derive(Debug, Clone)]
pub struct ContextWindow {
    /// 0 means unlimited
    max_tokens: usize,
    tokenizer: Tokenizer,
}

impl ContextWindow {
    pub fn new(max_tokens: usize, tokenizer: Tokenizer) -> Self {
        Self {
            max_tokens,
            tokenizer,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn count_text(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    pub fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| self.tokenizer.count(&m.content))
            .sum()
    }

    /// Drop messages until the total fits the budget.
    ///
    /// The most recent non-system message goes first, repeatedly. If the
    /// remaining system messages still exceed the budget, messages are then
    /// dropped from the front.
    pub fn fit(&self, messages: Vec<ChatMessage>) -> WindowFit {
        let mut counts: Vec<usize> = messages
            .iter()
            .map(|m| self.tokenizer.count(&m.content))
            .collect();
        let original_tokens: usize = counts.iter().sum();

        if self.max_tokens == 0 || original_tokens <= self.max_tokens {
            return WindowFit {
                original_tokens,
                tokens: original_tokens,
                messages,
            };
        }

        let mut messages = messages;
        let mut total = original_tokens;

        while total > self.max_tokens {
            let Some(idx) = messages.iter().rposition(|m| m.role != ChatRole::System) else {
                break;
            };
            messages.remove(idx);
            total -= counts.remove(idx);
        }

        while total > self.max_tokens && !messages.is_empty() {
            messages.remove(0);
            total -= counts.remove(0);
        }

        tracing::warn!(
            before = original_tokens,
            after = total,
            budget = self.max_tokens,
            kept = messages.len(),
            "Truncated prompt to fit context window"
        );

        WindowFit {
            original_tokens,
            tokens: total,
            messages,
        }
    }
}
