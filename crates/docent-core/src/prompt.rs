//! Generation request assembly.
//!
//! A [`PromptSections`] value carries the four parts of a grounded
//! request separately (grounding instruction, conversation history,
//! numbered passages, and the new question) so that backends can lay
//! them out however their API wants. [`PromptSections::messages`]
//! gives the conventional chat layout used by the HTTP backends.
//!
//! Grounding is a prompt-level contract only: nothing here or downstream
//! verifies that a reply is supported by the passages.

use crate::models::{RetrievalResult, Role, Turn};

/// The sentence the model is told to reply with when the passages do not
/// cover the question.
pub const INSUFFICIENT_CONTEXT_REPLY: &str =
    "I don't have enough information in my knowledge base to answer that question.";

/// Reply requested for factual questions while the knowledge base is off.
pub const KNOWLEDGE_BASE_DISABLED_REPLY: &str =
    "Please enable the knowledge base to ask questions about the documents.";

/// Grounding instruction used when the knowledge base is enabled.
pub fn grounded_system_prompt() -> String {
    format!(
        "You are a helpful, professional assistant.\n\n\
         RULES:\n\
         1. For greetings or casual chat, answer naturally and concisely. Do not explain what you can or cannot do.\n\
         2. For subject-specific or factual questions, use ONLY the passages under \"Context from knowledge base\".\n\
         3. If the answer is not in the context, reply exactly: \"{}\"\n\
         4. Do not guess. If details are missing, ask for clarification.\n\
         5. Cite the passages you use with their markers, e.g. [Source 2].\n\
         6. Be direct and avoid unnecessary preamble.",
        INSUFFICIENT_CONTEXT_REPLY
    )
}

/// Instruction used when the knowledge base is disabled for the request.
pub fn ungrounded_system_prompt() -> String {
    format!(
        "You are a helpful assistant. Knowledge base access is DISABLED.\n\n\
         RULES:\n\
         1. For greetings or casual chat, answer naturally and concisely.\n\
         2. For any subject-specific or factual question, reply: \"{}\"\n\
         3. Do not use your own knowledge for factual questions. Do not guess.",
        KNOWLEDGE_BASE_DISABLED_REPLY
    )
}

/// A retrieved passage as presented to the model. `number` is 1-based and
/// matches the `[Source N]` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub number: usize,
    pub source_path: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// A grounded generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSections {
    pub system: String,
    pub history: Vec<PromptMessage>,
    pub passages: Vec<Passage>,
    pub question: String,
    pub use_knowledge_base: bool,
}

impl PromptSections {
    /// Passages rendered as `[Source N: path]` blocks, or `"None"`.
    pub fn render_context(&self) -> String {
        if self.passages.is_empty() {
            return "None".to_string();
        }
        self.passages
            .iter()
            .map(|p| format!("[Source {}: {}]\n{}\n", p.number, p.source_path, p.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The final user message: context block plus question, or the bare
    /// question when the knowledge base is off.
    pub fn user_content(&self) -> String {
        if self.use_knowledge_base {
            format!(
                "Context from knowledge base:\n{}\n\nUser question: {}",
                self.render_context(),
                self.question
            )
        } else {
            self.question.clone()
        }
    }

    /// History followed by the user message, with roles strictly
    /// alternating and the first message from the user.
    pub fn messages(&self) -> Vec<PromptMessage> {
        let mut out = self.history.clone();
        let user_content = self.user_content();
        match out.last_mut() {
            Some(last) if last.role == Role::User => {
                last.content.push_str("\n\n--- Next Question ---\n");
                last.content.push_str(&user_content);
            }
            _ => out.push(PromptMessage {
                role: Role::User,
                content: user_content,
            }),
        }
        out
    }
}

/// Turn the memory window into prompt history.
///
/// Empty turns are dropped, consecutive turns with the same role are
/// merged, and leading assistant turns are skipped.
pub fn normalize_history(turns: &[Turn]) -> Vec<PromptMessage> {
    let mut out: Vec<PromptMessage> = Vec::new();
    for turn in turns {
        let content = turn.content.trim();
        if content.is_empty() {
            continue;
        }
        if out.is_empty() && turn.role == Role::Assistant {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role == turn.role => {
                last.content.push_str("\n\n");
                last.content.push_str(content);
            }
            _ => out.push(PromptMessage {
                role: turn.role,
                content: content.to_string(),
            }),
        }
    }
    out
}

/// Assemble the request for one user message.
pub fn build_prompt(
    history: &[Turn],
    results: &[RetrievalResult],
    question: &str,
    use_knowledge_base: bool,
) -> PromptSections {
    let passages = results
        .iter()
        .enumerate()
        .map(|(i, r)| Passage {
            number: i + 1,
            source_path: r.source_path.clone(),
            text: r.text.clone(),
        })
        .collect();
    PromptSections {
        system: if use_knowledge_base {
            grounded_system_prompt()
        } else {
            ungrounded_system_prompt()
        },
        history: normalize_history(history),
        passages,
        question: question.trim().to_string(),
        use_knowledge_base,
    }
}
