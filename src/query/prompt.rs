//! Prompt assembly for grounded answers.

use std::fmt::Write as _;

use crate::store::{ConversationMessage, MessageRole, RetrievedChunk};

/// Context line used when retrieval found nothing.
pub const NO_DATA_CONTEXT: &str =
    "No specific data was found in this knowledge base for the question.";

/// Everything the model sees for one answer.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub agent_name: &'a str,
    pub query: &'a str,
    pub chunks: &'a [RetrievedChunk],
    /// Oldest first
    pub history: &'a [ConversationMessage],
}

/// Render the single prompt sent to the chat model.
pub fn build_prompt(input: PromptInput<'_>) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "You are {}, a personal knowledge agent. You answer questions using the \
         data its owner uploaded, which is provided below as context.",
        input.agent_name
    );

    if !input.history.is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        for message in input.history {
            let label = match message.role {
                MessageRole::User => "User",
                MessageRole::Agent => "Agent",
            };
            let _ = writeln!(prompt, "{}: {}", label, message.content.trim());
        }
    }

    prompt.push_str("\nContext from the knowledge base:\n");
    if input.chunks.is_empty() {
        let _ = writeln!(prompt, "{}", NO_DATA_CONTEXT);
    } else {
        for (i, chunk) in input.chunks.iter().enumerate() {
            let _ = writeln!(
                prompt,
                "[{}] (source: {}, similarity: {:.2})\n{}\n",
                i + 1,
                chunk.source_file_name,
                chunk.similarity,
                chunk.content.trim()
            );
        }
    }

    let _ = writeln!(prompt, "\nUser question: {}", input.query.trim());

    prompt.push_str(
        "\nInstructions:\n\
         - Answer only from the context and conversation above.\n\
         - If the context is insufficient, say so explicitly and describe what data would help.\n\
         - Never fabricate figures, names or facts that are not in the context.\n\
         - Quote numbers exactly as they appear and mention the source file when useful.\n\
         - Keep the answer concise; use bullet points for lists of records.\n",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn hit(content: &str, source: &str, similarity: f64) -> RetrievedChunk {
        RetrievedChunk {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            content: content.to_string(),
            source_file_name: source.to_string(),
            created_at: Utc::now(),
            metadata: None,
            similarity,
        }
    }

    #[test]
    fn empty_context_gets_explicit_line() {
        let prompt = build_prompt(PromptInput {
            agent_name: "Atlas",
            query: "What were Q3 sales?",
            chunks: &[],
            history: &[],
        });
        assert!(prompt.contains(NO_DATA_CONTEXT));
        assert!(prompt.contains("User question: What were Q3 sales?"));
        assert!(!prompt.contains("Recent conversation"));
    }

    #[test]
    fn chunks_are_tagged_with_source_and_score() {
        let chunks = vec![
            hit("region: EMEA | revenue: 42", "sales.csv", 0.834),
            hit("region: APAC | revenue: 17", "sales.csv", 0.5),
        ];
        let prompt = build_prompt(PromptInput {
            agent_name: "Atlas",
            query: "revenue by region",
            chunks: &chunks,
            history: &[],
        });
        assert!(prompt.contains("[1] (source: sales.csv, similarity: 0.83)"));
        assert!(prompt.contains("[2] (source: sales.csv, similarity: 0.50)"));
        assert!(prompt.contains("region: EMEA | revenue: 42"));
        assert!(!prompt.contains(NO_DATA_CONTEXT));
    }

    #[test]
    fn history_is_labelled_in_order() {
        let conversation = Uuid::new_v4();
        let history = vec![
            ConversationMessage::user(conversation, "How many units?"),
            ConversationMessage::agent(conversation, Uuid::new_v4(), "127 units."),
        ];
        let prompt = build_prompt(PromptInput {
            agent_name: "Atlas",
            query: "And last month?",
            chunks: &[],
            history: &history,
        });
        let user_at = prompt.find("User: How many units?").unwrap();
        let agent_at = prompt.find("Agent: 127 units.").unwrap();
        assert!(user_at < agent_at);
        assert!(agent_at < prompt.find("User question:").unwrap());
    }
}
