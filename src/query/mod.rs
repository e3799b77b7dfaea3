//! Query flow: grounded answers over a workspace's chunks, with
//! conversation history.

mod conversation;
mod engine;
mod prompt;

pub use conversation::ConversationManager;
pub use engine::{GeneratedAnswer, QueryAnswer, QueryEngine};
pub use prompt::{build_prompt, PromptInput, NO_DATA_CONTEXT};

use crate::error::{AppError, AppResult};

/// Longest accepted question, in characters.
pub const MAX_QUERY_CHARS: usize = 4000;

/// Trim and check a user query before any external call.
pub fn validate_query(query: &str) -> AppResult<&str> {
    let query = query.trim();
    if query.is_empty() {
        return Err(AppError::validation("Query cannot be empty"));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(AppError::validation(format!(
            "Query exceeds {} characters",
            MAX_QUERY_CHARS
        )));
    }
    Ok(query)
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn queries_are_trimmed_and_bounded() {
        assert_eq!(assert_ok!(validate_query("  revenue?  ")), "revenue?");
        assert_err!(validate_query("\n\t "));
        assert_err!(validate_query(&"x".repeat(MAX_QUERY_CHARS + 1)));
        assert_ok!(validate_query(&"é".repeat(MAX_QUERY_CHARS)));
    }
}
