// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use relay_config::CompactionStrategy;
use relay_model::{Message, MessageContent, Role};
use relay_tools::OutputCategory;

// ─── Compaction prompts ───────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

const STRUCTURED_COMPACTION_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections — do not add or remove sections. \
Be information-dense: preserve file paths, function names, error messages, \
code snippets, test names, and technical decisions verbatim where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why (bullet points). \
Include file or component names.

## Files & Artifacts
List every file that was read, modified, or created, with a brief note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
Write a dense technical summary (2-5 paragraphs) of what happened, \
capturing the essential flow of events, tool outputs, and reasoning. \
Focus on facts the agent will need to continue correctly.";

// ─── Public API ───────────────────────────────────────────────────────────────

/// Replace the conversation history with a single summarisation request using
/// the legacy narrative strategy.  Kept for backward compatibility and direct
/// use in tests; prefer [`compact_session_with_strategy`] for new callers.
pub fn compact_session(messages: &mut Vec<Message>, system_msg: Option<Message>) -> usize {
    compact_session_with_strategy(messages, system_msg, &CompactionStrategy::Narrative)
}

/// Strategy-aware compaction: restructures the message list so that the model
/// will produce a summary (or structured checkpoint) on the next turn.
///
/// The caller is responsible for actually invoking the model and rebuilding
/// the session from the resulting summary text.  This function only rewrites
/// the `messages` list to contain the compaction prompt.
pub fn compact_session_with_strategy(
    messages: &mut Vec<Message>,
    system_msg: Option<Message>,
    strategy: &CompactionStrategy,
) -> usize {
    let before = messages.len();
    let prompt = match strategy {
        CompactionStrategy::Structured => STRUCTURED_COMPACTION_PROMPT,
        CompactionStrategy::Narrative => SUMMARIZE_PROMPT,
    };
    let history_text = serialize_history(messages);
    let summary_request = Message::user(format!("{prompt}\n\n---\n\n{history_text}"));
    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(summary_request);
    before
}

/// Emergency fallback compaction used when the session is too large to fit even
/// a compaction prompt within the context window.
///
/// Drops all but the last `keep_n` non-system messages and prepends a canned
/// notice.  No model call is made — this is a purely deterministic operation
/// that always succeeds regardless of session size.
pub fn emergency_compact(
    messages: &mut Vec<Message>,
    system_msg: Option<Message>,
    keep_n: usize,
) -> usize {
    let before = messages.len();
    let non_system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    let keep = keep_n.min(non_system.len());
    let preserved: Vec<Message> = non_system[non_system.len() - keep..].to_vec();
    let notice = Message::assistant(
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
    );
    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(notice);
    messages.extend(preserved);
    before
}

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.
/// Otherwise applies a category-specific extraction strategy that preserves
/// the most useful portion of the output.  Dispatching on [`OutputCategory`]
/// (not on tool names) keeps this function independent of the tools crate's
/// concrete tool list; each tool declares its own category.
///
/// - [`OutputCategory::HeadTail`]: keep the first 60 + last 40 lines so both
///   the command preamble and the final result are visible.
/// - [`OutputCategory::MatchList`]: keep leading matches (highest relevance
///   first); the tail is not preserved because later matches are less relevant.
/// - [`OutputCategory::FileContent`]: balanced head + tail with a separator,
///   preserving both the imports/declarations and the most recent changes.
/// - [`OutputCategory::Generic`]: hard-truncate at the nearest line boundary.
///
/// Every truncated result ends with an explicit notice so the model knows
/// that additional content exists and how to retrieve it.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Serialise a message list into plain text for inclusion in a compaction prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !matches!(m.role, Role::System))
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                relay_model::MessageContent::Text(t) => t.clone(),
                relay_model::MessageContent::ContentParts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        relay_model::ContentPart::Text { text } => text.clone(),
                        relay_model::ContentPart::Image { .. } => "[image]".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                relay_model::MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                relay_model::MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them.  Pass `usize::MAX` to split evenly by character budget.
fn head_tail_lines(
    content: &str,
    cap_chars: usize,
    max_head: usize,
    max_tail: usize,
    notice_template: &str,
) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    // Head
    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    // Tail (collect from the end)
    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Request-time optimization passes ─────────────────────────────────────────
//
// The three passes below run on the outgoing request view, not on the
// persisted session history: unlike `compact_session_with_strategy` and
// `emergency_compact` (which replace history because an LLM call or a hard
// drop is genuinely destructive and must be durable), compression and
// reordering are lossy text transforms that only make sense for what the
// model sees on the wire. Applying them to `session.messages` directly would
// permanently corrupt stored history with bracket markers and collapsed
// whitespace every time a turn runs.

/// Collapse run-on whitespace and a handful of fixed verbose phrases.
///
/// Applied to plain-text message content before building a request. Pure
/// text shrinking: never touches tool-call/tool-result structure, never
/// drops lines, so it is safe to run on every outgoing request regardless of
/// size.
pub fn compress_prompt_text(text: &str) -> String {
    let space_tab = regex_collapse_space_tab(text);
    let collapsed_newlines = collapse_excess_newlines(&space_tab);
    let trimmed = trim_trailing_line_whitespace(&collapsed_newlines);
    let collapsed_rules = collapse_separator_runs(&trimmed);
    substitute_verbose_phrases(&collapsed_rules)
}

fn regex_collapse_space_tab(text: &str) -> String {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"[ \t]{2,}").unwrap());
    re.replace_all(text, " ").into_owned()
}

fn collapse_excess_newlines(text: &str) -> String {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"\n{3,}").unwrap());
    re.replace_all(text, "\n\n").into_owned()
}

fn trim_trailing_line_whitespace(text: &str) -> String {
    text.lines().map(|l| l.trim_end()).collect::<Vec<_>>().join("\n")
}

fn collapse_separator_runs(text: &str) -> String {
    static EQ_DASH: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    static STAR: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let eq_dash = EQ_DASH.get_or_init(|| regex::Regex::new(r"([=-]){4,}").unwrap());
    let star = STAR.get_or_init(|| regex::Regex::new(r"\*{3,}").unwrap());
    let step1 = eq_dash.replace_all(text, "$1$1$1").into_owned();
    star.replace_all(&step1, "**").into_owned()
}

const VERBOSE_SUBSTITUTIONS: &[(&str, &str)] = &[
    ("in order to", "to"),
    ("due to the fact that", "because"),
    ("at this point in time", "now"),
    ("in the event that", "if"),
    ("with regard to", "regarding"),
    ("for the purpose of", "for"),
    ("in spite of the fact that", "although"),
];

fn substitute_verbose_phrases(text: &str) -> String {
    let mut out = text.to_string();
    for (verbose, concise) in VERBOSE_SUBSTITUTIONS {
        out = out.replace(verbose, concise);
    }
    out
}

/// Prune stale tool results from a request view.
///
/// Keeps the last `keep_last_n` tool-result messages (and their matching
/// tool-call messages) byte-for-byte. Older tool results are truncated
/// through [`smart_truncate`] at `per_tool_cap_tokens`, dispatched on
/// `category_of` (the caller knows which tool produced which result; this
/// function stays tool-name-agnostic). The last `protect_last_k_assistant`
/// assistant messages and everything after them are never touched, matching
/// the same "don't split a tool-call group or a fresh turn" invariant the
/// history-summary split point already honors.
pub fn prune_tool_results(
    messages: &[Message],
    keep_last_n: usize,
    per_tool_cap_tokens: usize,
    protect_last_k_assistant: usize,
    category_of: impl Fn(&str) -> OutputCategory,
) -> Vec<Message> {
    let protect_from = protected_tail_start(messages, protect_last_k_assistant);

    let tool_result_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| *i < protect_from && matches!(m.content, MessageContent::ToolResult { .. }))
        .map(|(i, _)| i)
        .collect();

    let prune_before = tool_result_indices.len().saturating_sub(keep_last_n);
    let prune_set: std::collections::HashSet<usize> =
        tool_result_indices[..prune_before].iter().copied().collect();

    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if !prune_set.contains(&i) {
                return m.clone();
            }
            match &m.content {
                MessageContent::ToolResult { tool_call_id, content } => {
                    let Some(text) = content.as_text() else { return m.clone() };
                    let category = category_of(tool_call_id);
                    let truncated = smart_truncate(text, category, per_tool_cap_tokens);
                    Message {
                        role: m.role.clone(),
                        content: MessageContent::ToolResult {
                            tool_call_id: tool_call_id.clone(),
                            content: relay_model::ToolResultContent::Text(truncated),
                        },
                    }
                }
                _ => m.clone(),
            }
        })
        .collect()
}

/// Index of the first message in the protected tail: everything from here to
/// the end of `messages` is left untouched by pruning. Walks back from the
/// end past `protect_last_k` assistant messages (and anything interleaved
/// with them), so an in-progress tool-call/tool-result group is never split.
fn protected_tail_start(messages: &[Message], protect_last_k: usize) -> usize {
    if protect_last_k == 0 {
        return messages.len();
    }
    let mut seen_assistant = 0usize;
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::Assistant {
            seen_assistant += 1;
            if seen_assistant > protect_last_k {
                return i + 1;
            }
        }
    }
    0
}

/// Default token-estimate threshold above which [`reorder_for_large_context`]
/// activates (chars/4 estimate, matching the rest of this module).
pub const LARGE_CONTEXT_TOKEN_THRESHOLD: usize = 100_000;

/// Restructure a long request so the model's attention lands on the parts
/// that matter most: move `critical_instruction` to the very front, bracket
/// the bulk of the conversation with explicit markers, and keep the final
/// user turn last and unbracketed.
///
/// No-op below [`LARGE_CONTEXT_TOKEN_THRESHOLD`] estimated tokens. Only
/// reorders the *view* returned to the caller; never mutates `messages`.
pub fn reorder_for_large_context(
    messages: Vec<Message>,
    critical_instruction: Option<&str>,
    threshold_tokens: usize,
) -> Vec<Message> {
    let estimated_tokens: usize = messages.iter().map(approx_tokens).sum::<usize>() / 4;
    if estimated_tokens <= threshold_tokens {
        return messages;
    }

    let system_len = messages.iter().take_while(|m| m.role == Role::System).count();
    if messages.len() == system_len {
        return messages;
    }
    let (system, rest) = messages.split_at(system_len);
    let (middle, last_user) = rest.split_at(rest.len() - 1);
    let last_user = &last_user[0];

    let mut out = Vec::with_capacity(system_len + middle.len() + 3);
    out.extend(system.iter().cloned());
    if let Some(instruction) = critical_instruction {
        out.push(Message::system(instruction.to_string()));
    }
    out.push(Message::system("[CONTEXT FOLLOWS — the current request is repeated at the end]"));
    out.extend(middle.iter().cloned());
    out.push(Message::system("[END OF CONTEXT]"));
    out.push(last_user.clone());
    out
}

fn approx_tokens(m: &Message) -> usize {
    match &m.content {
        MessageContent::Text(t) => t.len(),
        MessageContent::ContentParts(parts) => parts
            .iter()
            .map(|p| match p {
                relay_model::ContentPart::Text { text } => text.len(),
                relay_model::ContentPart::Image { .. } => 0,
            })
            .sum(),
        MessageContent::ToolCall { function, .. } => function.arguments.len(),
        MessageContent::ToolResult { content, .. } => content.as_text().map(str::len).unwrap_or(0),
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
