//! Prompt construction for the summarization pipeline.
//!
//! Each source kind gets its own framing; chunk and reduce prompts wrap
//! the same framing with positional context.

use crate::pipeline::types::{Item, SourceKind};

/// System prompt shared by every summarization call.
pub fn system_prompt(kind: SourceKind) -> String {
    let focus = match kind {
        SourceKind::MailMessage => {
            "You analyse emails. Give the main points in 3-5 lines, then list any \
             action the recipient needs to take and any deadline."
        }
        SourceKind::CalendarEvent => {
            "You prepare meeting briefs. State the purpose of the meeting, who \
             attends, and what to prepare beforehand."
        }
        SourceKind::DriveFile => {
            "You summarise documents. Capture the key content and conclusions \
             concisely."
        }
        SourceKind::ChannelMessage => {
            "You summarise team chat channel messages. Capture decisions, \
             questions and requests."
        }
        SourceKind::ChatMessage => {
            "You summarise a chat message sent to an assistant. Restate the \
             request or information clearly and briefly."
        }
    };
    format!(
        "{focus}\nReply in the language of the source text. Output only the summary, \
         without preamble."
    )
}

fn header(item: &Item) -> String {
    let mut lines = vec![format!("Source: {}", item.source_kind.label())];
    for (key, label) in [
        ("title", "Title"),
        ("subject", "Subject"),
        ("sender", "From"),
        ("date", "Date"),
        ("start", "Start"),
    ] {
        if let Some(value) = item.meta(key).filter(|v| !v.is_empty()) {
            lines.push(format!("{label}: {value}"));
        }
    }
    lines.join("\n")
}

/// Prompt for content that fits in a single chunk.
pub fn single_prompt(item: &Item, content: &str) -> String {
    format!(
        "{}\n\nSummarize the following content.\n\nContent:\n{content}\n\nSummary:",
        header(item)
    )
}

/// Prompt for one chunk of a longer text (`index` is 0-based).
pub fn chunk_prompt(item: &Item, chunk: &str, index: usize, total: usize) -> String {
    format!(
        "{}\n\nThis is part {} of {total} of a longer text. Summarize this part in a \
         few sentences, keeping names, numbers and dates.\n\nPart:\n{chunk}\n\nSummary:",
        header(item),
        index + 1
    )
}

/// Prompt merging ordered partial summaries into one.
pub fn reduce_prompt(item: &Item, summaries: &[String]) -> String {
    let numbered: Vec<String> = summaries
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {s}", i + 1))
        .collect();
    format!(
        "{}\n\nCombine the following partial summaries of one text, given in order, \
         into a single coherent summary.\n\nPartial summaries:\n{}\n\nFinal summary:",
        header(item),
        numbered.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ContentRef;

    #[test]
    fn chunk_prompt_is_one_based() {
        let item = Item::new(SourceKind::DriveFile, "f", ContentRef::Remote("f".into()))
            .with_meta("title", "Plan.txt");
        let prompt = chunk_prompt(&item, "body", 0, 3);
        assert!(prompt.contains("part 1 of 3"));
        assert!(prompt.contains("Title: Plan.txt"));
        assert!(prompt.contains("body"));
    }

    #[test]
    fn reduce_prompt_numbers_summaries() {
        let item = Item::new(SourceKind::MailMessage, "m", ContentRef::Inline(String::new()));
        let prompt = reduce_prompt(&item, &["a".into(), "b".into()]);
        assert!(prompt.contains("[1] a\n[2] b"));
    }
}
