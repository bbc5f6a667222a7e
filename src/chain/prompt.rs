//! Prompt assembly shared by the stages.

use crate::guideline::GuidelineSnapshot;
use crate::provider::ChatMessage;
use std::sync::Arc;

/// Fill `{name}` placeholders in `template`.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |rendered, (name, value)| {
        rendered.replace(&format!("{{{name}}}"), value)
    })
}

/// Concatenate guideline documents in the order given, each under its own heading.
pub fn render_guidelines(guidelines: &[Arc<GuidelineSnapshot>]) -> String {
    guidelines
        .iter()
        .map(|doc| {
            format!(
                "## Guidelines: {} (v{})\n{}",
                doc.key,
                doc.version,
                doc.content.trim_end()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System message: role statement followed by the stage's guidelines.
pub fn system_message(role: &str, guidelines: &[Arc<GuidelineSnapshot>]) -> ChatMessage {
    let rendered = render_guidelines(guidelines);
    if rendered.is_empty() {
        ChatMessage::system(role)
    } else {
        ChatMessage::system(format!("{role}\n\n{rendered}"))
    }
}

/// Conversation for the single corrective attempt after a rejected reply.
pub fn reinforce(mut messages: Vec<ChatMessage>, raw: &str, reason: &str) -> Vec<ChatMessage> {
    messages.push(ChatMessage::assistant(raw));
    messages.push(ChatMessage::user(format!(
        "Your previous response could not be accepted: {reason}.\n\
         Answer the original request again. Return only the requested output, \
         following the required format exactly, with no commentary."
    )));
    messages
}

pub fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}
