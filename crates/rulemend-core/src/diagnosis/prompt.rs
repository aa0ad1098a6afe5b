use crate::email::{EmailSnapshot, Header, Mailbox};
use crate::llm::{ChatMessage, ToolCallResult};
use crate::rules::{ConditionOutcome, MatchResult, Rule};

use super::types::{DiagnosisContext, RoundEntry};

const DEFAULT_MAX_BODY_LENGTH: usize = 4_000;
const MAX_SUBJECT_LENGTH: usize = 500;

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_body_length: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_LENGTH)
    }
}

impl PromptBuilder {
    pub fn new(max_body_length: usize) -> Self {
        Self { max_body_length }
    }

    /// Opening transcript: system instructions followed by the assembled context.
    pub fn build(&self, context: &DiagnosisContext) -> Vec<ChatMessage> {
        let sections = [
            format!("USER REPORT:\n{}", context.report.trim()),
            build_rule_section(context.rule.as_ref(), context.evaluation.as_ref()),
            self.build_email_section(&context.email),
            build_category_section(context),
            build_groups_section(context),
        ];

        vec![
            ChatMessage::system(system_instructions()),
            ChatMessage::user(sections.join("\n\n")),
        ]
    }

    fn build_email_section(&self, email: &EmailSnapshot) -> String {
        let mut lines = vec!["EMAIL:".to_string()];
        lines.push(format!("From: {}", email.from.display()));
        lines.push(format!("To: {}", format_mailbox_list(&email.to)));
        if !email.cc.is_empty() {
            lines.push(format!("Cc: {}", format_mailbox_list(&email.cc)));
        }
        if let Some(subject) = email.subject.as_deref() {
            lines.push(format!("Subject: {}", truncate_text(subject, MAX_SUBJECT_LENGTH)));
        }
        if let Some(date) = email.date {
            lines.push(format!("Date: {}", date.to_rfc3339()));
        }

        let headers = filter_relevant_headers(&email.headers);
        if !headers.is_empty() {
            lines.push("Headers:".to_string());
            for header in headers {
                lines.push(format!("- {}: {}", header.name, header.value));
            }
        }

        if !email.attachments.is_empty() {
            lines.push("Attachments:".to_string());
            for attachment in &email.attachments {
                lines.push(format!(
                    "- {} ({}, {} bytes)",
                    attachment.filename, attachment.mime_type, attachment.size
                ));
            }
        }

        if let Some(body) = body_text(email, self.max_body_length) {
            lines.push("Body:".to_string());
            lines.push(body);
        }

        lines.join("\n")
    }
}

fn system_instructions() -> String {
    [
        "You diagnose and repair email-filtering rules.",
        "The user believes a rule matched an email it should not have, or failed to match one it should have.",
        "Work out which condition produced the wrong outcome, then call the repair tools to fix it.",
        "Make the smallest change that fixes this email without changing how the rule treats other emails.",
        "When a whole domain sends the same kind of mail, prefer a domain-level group entry such as `@example.com`.",
        "A static-condition fix and an instruction fix are both acceptable; choose the one that best fits the report.",
        "After your changes are applied you will receive the results. Reply without tool calls once you are done, explaining what you changed and why.",
    ]
    .join("\n")
}

fn build_rule_section(rule: Option<&Rule>, evaluation: Option<&MatchResult>) -> String {
    let Some(rule) = rule else {
        return "MATCHED RULE:\nNo rule matched this email.".to_string();
    };

    let mut lines = vec!["MATCHED RULE:".to_string()];
    lines.push(format!("ID: {}", rule.id));
    lines.push(format!("Name: {}", rule.name));
    if let Some(description) = rule.description.as_deref().filter(|d| !d.trim().is_empty()) {
        lines.push(format!("Description: {description}"));
    }
    lines.push(format!("Operator: {}", rule.conditions.operator().as_str()));
    if let Some(ai) = rule.conditions.ai() {
        lines.push(format!("Instructions: {}", ai.instructions));
    }
    if let Some(static_conditions) = rule.conditions.static_conditions() {
        for (field, value) in static_conditions.matchers() {
            lines.push(format!("Static {field}: {value}"));
        }
    }
    if let Some(group) = rule.conditions.group() {
        lines.push(format!("Group: {}", group.group_id));
    }
    if let Some(category) = rule.conditions.category() {
        lines.push(format!(
            "Category filter: {} [{}]",
            category.filter_type.as_str(),
            category.category_ids.join(", ")
        ));
    }

    if let Some(evaluation) = evaluation {
        lines.push(String::new());
        lines.push(format!("EVALUATION (overall: {}):", evaluation.verdict.as_str()));
        for verdict in &evaluation.breakdown {
            let outcome = match verdict.outcome {
                ConditionOutcome::Matched => "matched",
                ConditionOutcome::NotMatched => "not matched",
                ConditionOutcome::Deferred => "needs your judgment",
            };
            lines.push(format!(
                "- {}: {outcome} ({})",
                verdict.kind.as_str(),
                verdict.reason
            ));
        }
    }

    lines.join("\n")
}

fn build_category_section(context: &DiagnosisContext) -> String {
    let mut lines = vec!["SENDER CATEGORY:".to_string()];
    lines.push(
        context
            .sender_category
            .as_ref()
            .map(|category| format!("{} ({})", category.name, category.id))
            .unwrap_or_else(|| "(uncategorized)".to_string()),
    );

    lines.push(String::new());
    lines.push("AVAILABLE CATEGORIES:".to_string());
    if context.categories.is_empty() {
        lines.push("(none)".to_string());
    }
    for category in &context.categories {
        match category.description.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(description) => lines.push(format!(
                "- {} ({}): {description}",
                category.name, category.id
            )),
            None => lines.push(format!("- {} ({})", category.name, category.id)),
        }
    }
    lines.join("\n")
}

fn build_groups_section(context: &DiagnosisContext) -> String {
    let mut lines = vec!["GROUPS:".to_string()];
    if context.groups.is_empty() {
        lines.push("(none)".to_string());
    }
    for group in &context.groups {
        let items = group
            .items
            .iter()
            .map(|item| format!("{} {}", item.item_type.as_str(), item.value))
            .collect::<Vec<_>>();
        let items = if items.is_empty() {
            "(empty)".to_string()
        } else {
            items.join(", ")
        };
        lines.push(format!("- {} ({}): {items}", group.name, group.id));
    }
    lines.join("\n")
}

/// Assistant turn as recorded in the transcript, including the tool calls it made.
pub fn assistant_turn(content: &str, tool_calls: &[ToolCallResult]) -> ChatMessage {
    let mut lines = Vec::new();
    if !content.trim().is_empty() {
        lines.push(content.trim().to_string());
    }
    for call in tool_calls {
        lines.push(format!("[called {} with {}]", call.fn_name, call.fn_arguments));
    }
    ChatMessage::assistant(lines.join("\n"))
}

/// Per-action results of a round, fed back as the next user turn.
pub fn results_turn(entries: &[RoundEntry]) -> ChatMessage {
    let mut lines = vec!["RESULTS:".to_string()];
    for entry in entries {
        match entry {
            RoundEntry::Applied(applied) => lines.push(format!(
                "- {} on {}: {}",
                applied.action.tool_name(),
                applied.action.target(),
                applied.outcome.as_str()
            )),
            RoundEntry::Rejected(rejected) => lines.push(format!(
                "- {}: rejected ({})",
                rejected.tool, rejected.reason
            )),
        }
    }
    lines.push("Propose further fixes if needed, or reply without tool calls to finish.".into());
    ChatMessage::user(lines.join("\n"))
}

pub fn truncate_text(text: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    if text.chars().count() <= max_len {
        return text.to_string();
    }

    let ellipsis = "...";
    if max_len <= ellipsis.len() {
        return ellipsis[..max_len].to_string();
    }

    let mut truncated: String = text.chars().take(max_len - ellipsis.len()).collect();
    if let Some((idx, _)) = truncated.char_indices().rfind(|(_, ch)| ch.is_whitespace()) {
        truncated.truncate(idx);
    }
    truncated.push_str(ellipsis);
    truncated
}

pub fn strip_html(html: &str) -> String {
    let mut bytes = std::io::Cursor::new(html.as_bytes());
    html2text::from_read(&mut bytes, 80)
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain body when present, otherwise the HTML body rendered to text.
pub fn body_text(email: &EmailSnapshot, max_len: usize) -> Option<String> {
    if let Some(plain) = email.body_plain.as_deref().filter(|b| !b.trim().is_empty()) {
        return Some(truncate_text(plain, max_len));
    }
    email
        .body_html
        .as_deref()
        .map(|html| truncate_text(&strip_html(html), max_len))
}

fn filter_relevant_headers(headers: &[Header]) -> Vec<&Header> {
    const WHITELIST: &[&str] = &[
        "list-id",
        "list-unsubscribe",
        "reply-to",
        "return-path",
        "precedence",
        "x-mailer",
    ];

    headers
        .iter()
        .filter(|header| WHITELIST.contains(&header.name.to_ascii_lowercase().as_str()))
        .collect()
}

fn format_mailbox_list(list: &[Mailbox]) -> String {
    if list.is_empty() {
        return "(none)".to_string();
    }
    list.iter().map(Mailbox::display).collect::<Vec<_>>().join(", ")
}
