//! Context trimming.
//!
//! Chat providers have finite windows, but a dialing-in session can span
//! dozens of shots. The trimmer keeps the most recent exchanges verbatim
//! and folds everything older into a compact summary block: one line per
//! old shot message (with the assistant's first actionable advice
//! appended when one is found), plus a count of dropped plain follow-ups.
//! A synthetic assistant acknowledgment follows the summary so the
//! history still alternates roles.

use std::sync::OnceLock;

use regex::Regex;

use crate::conversation::{Message, Role};

/// Pairs of user+assistant messages kept verbatim at the tail.
pub const MAX_VERBATIM_PAIRS: usize = 3;

/// The literal acknowledgment inserted after the summary block.
pub const SUMMARY_ACK: &str =
    "Got it, I have context from your previous shots and messages. Let's continue.";

/// Markers identifying a shot-report user message.
const SHOT_MARKERS: [&str; 2] = ["Shot Summary", "Here's my latest shot"];

/// Quoted notes in a summary line are capped at 40 characters including
/// the quotes and ellipsis, leaving 35 for the note text.
const NOTES_MAX: usize = 35;

/// Advice extracts are capped at 80 characters including the ellipsis.
const ADVICE_MAX: usize = 80;

fn shot_regexes() -> &'static [Regex; 6] {
    static REGEXES: OnceLock<[Regex; 6]> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            Regex::new(r"## Shot #(\d+)"),
            Regex::new(r"\*\*Dose\*\*:\s*([\d.]+)g"),
            Regex::new(r"\*\*Yield\*\*:\s*([\d.]+)g"),
            Regex::new(r"\*\*Duration\*\*:\s*([\d.]+)s"),
            Regex::new(r"\*\*Score\*\*:\s*(\d+)"),
            Regex::new(r#"\*\*Notes\*\*:\s*"([^"]+)""#),
        ]
        .map(|r| match r {
            Ok(r) => r,
            // The patterns are literals; a failure here is a typo caught
            // by the unit tests
            Err(e) => unreachable!("invalid shot regex: {e}"),
        })
    })
}

fn advice_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        match Regex::new(
            r"(?i)(?:^|\n)\s*(?:[-•*]\s*)?((?:Try|Adjust|Grind|Increase|Decrease|Lower|Raise|Change|Move|Use|Reduce|Extend|Shorten)\s[^\n]{5,})",
        ) {
            Ok(r) => r,
            Err(e) => unreachable!("invalid advice regex: {e}"),
        }
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max).collect();
        format!("{kept}...")
    } else {
        text.to_string()
    }
}

/// Summarize one shot-report message into a single line, or `None` when
/// the message is not a shot report.
///
/// Output shape: `- Shot #N: 18.0g→36.0g, 28s, 85/100, "fruity..."` with
/// every field optional.
#[must_use]
pub fn summarize_shot_message(content: &str) -> Option<String> {
    if !SHOT_MARKERS.iter().any(|marker| content.contains(marker)) {
        return None;
    }

    let [shot_num_re, dose_re, yield_re, duration_re, score_re, notes_re] = shot_regexes();
    let capture = |re: &Regex| {
        re.captures(content).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
    };

    let shot_num = capture(shot_num_re);
    let dose = capture(dose_re);
    let yielded = capture(yield_re);
    let duration = capture(duration_re);
    let score = capture(score_re);
    let notes = capture(notes_re);

    let mut summary = String::from("- Shot");
    if let Some(num) = shot_num {
        summary.push_str(&format!(" #{num}"));
    }
    summary.push(':');
    if let (Some(dose), Some(yielded)) = (&dose, &yielded) {
        summary.push_str(&format!(" {dose}g\u{2192}{yielded}g"));
    }
    if let Some(duration) = duration {
        summary.push_str(&format!(", {duration}s"));
    }
    if let Some(score) = score {
        summary.push_str(&format!(", {score}/100"));
    }
    if let Some(notes) = notes {
        summary.push_str(&format!(", \"{}\"", truncate_chars(&notes, NOTES_MAX)));
    }

    Some(summary)
}

/// Extract the first actionable sentence from an assistant response.
///
/// Matches lines starting with a dialing verb (Try/Adjust/Grind/...),
/// strips leading bullet markers, and truncates to [`ADVICE_MAX`].
#[must_use]
pub fn summarize_advice(response: &str) -> Option<String> {
    let captures = advice_regex().captures(response)?;
    let advice = captures.get(1)?.as_str().trim();
    if advice.chars().count() > ADVICE_MAX {
        Some(format!("{}...", advice.chars().take(ADVICE_MAX - 3).collect::<String>()))
    } else {
        Some(advice.to_string())
    }
}

/// Trim a history down to `[summary, ack] ++ last (2*max_pairs + 1)`.
///
/// Messages older than the verbatim tail are folded: shot reports become
/// summary lines (with look-ahead into the immediately following
/// assistant reply for advice), plain user follow-ups are counted and
/// dropped. Histories at or under the threshold are returned unchanged.
#[must_use]
pub fn trim_history(messages: &[Message], max_pairs: usize) -> Vec<Message> {
    let max_verbatim = max_pairs * 2 + 1;
    if messages.len() <= max_verbatim {
        return messages.to_vec();
    }

    let mut old_count = messages.len() - max_verbatim;
    // The verbatim tail must begin with a user message so the rebuilt
    // history alternates roles; a split landing on an assistant reply
    // folds that reply into the summarized region with its user message.
    if messages.get(old_count).is_some_and(|m| m.role == Role::Assistant) {
        old_count += 1;
    }
    let mut summaries = Vec::new();
    let mut dropped_follow_ups = 0usize;

    for (i, message) in messages[..old_count].iter().enumerate() {
        if message.role != Role::User {
            continue;
        }
        match summarize_shot_message(&message.content) {
            Some(mut summary) => {
                // Look ahead for the paired assistant reply
                if let Some(next) = messages[..old_count].get(i + 1) {
                    if next.role == Role::Assistant {
                        if let Some(advice) = summarize_advice(&next.content) {
                            summary.push_str(&format!(" \u{2192} Advice: {advice}"));
                        }
                    }
                }
                summaries.push(summary);
            },
            None => dropped_follow_ups += 1,
        }
    }

    let mut trimmed = Vec::with_capacity(max_verbatim + 2);

    if !summaries.is_empty() || dropped_follow_ups > 0 {
        let mut summary_content = String::new();
        if !summaries.is_empty() {
            summary_content = format!("Previous shots summary:\n{}", summaries.join("\n"));
        }
        if dropped_follow_ups > 0 {
            if !summary_content.is_empty() {
                summary_content.push('\n');
            }
            summary_content.push_str(&format!(
                "({dropped_follow_ups} earlier follow-up message(s) omitted for brevity)"
            ));
        }
        trimmed.push(Message::user(summary_content));
        trimmed.push(Message::assistant(SUMMARY_ACK));
    }

    trimmed.extend_from_slice(&messages[old_count..]);

    tracing::debug!(
        removed = messages.len().saturating_sub(trimmed.len()),
        summarized = summaries.len(),
        remaining = trimmed.len(),
        "trimmed conversation history"
    );
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot_message(num: u32, notes: &str) -> String {
        format!(
            "Here's my latest shot:\n\n## Shot #{num}\n**Dose**: 18.0g\n**Yield**: 36.0g\n\
             **Duration**: 28s\n**Score**: 85\n**Notes**: \"{notes}\"\n\nWhat should I change?"
        )
    }

    #[test]
    fn shot_summary_line_format() {
        let summary =
            summarize_shot_message(&shot_message(7, "fruity notes")).expect("shot message");
        assert_eq!(summary, "- Shot #7: 18.0g\u{2192}36.0g, 28s, 85/100, \"fruity notes\"");
    }

    #[test]
    fn notes_truncate_at_forty_with_quotes() {
        let summary =
            summarize_shot_message(&shot_message(1, "Floral, bright, long finish and slightly acidic"))
                .expect("shot message");
        assert!(
            summary.ends_with(", \"Floral, bright, long finish and sli...\""),
            "got: {summary}"
        );
    }

    #[test]
    fn non_shot_message_is_not_summarized() {
        assert!(summarize_shot_message("what grind should I use?").is_none());
        // Marker alone is enough even with no extractable fields
        assert_eq!(summarize_shot_message("Shot Summary").as_deref(), Some("- Shot:"));
    }

    #[test]
    fn advice_extraction() {
        let response = "Nice shot!\n\n- Try grinding 2 steps finer to slow the shot down.\nAlso...";
        let advice = summarize_advice(response).expect("advice");
        assert_eq!(advice, "Try grinding 2 steps finer to slow the shot down.");

        // Case-insensitive, inline verb at line start
        let advice = summarize_advice("increase the dose to 18.5g for more body").expect("advice");
        assert!(advice.starts_with("increase the dose"));

        assert!(summarize_advice("That looks perfect, no changes needed.").is_none());
    }

    #[test]
    fn advice_truncates_to_eighty() {
        let long = format!("Try {}", "a very long explanation ".repeat(10));
        let advice = summarize_advice(&long).expect("advice");
        assert_eq!(advice.chars().count(), 80);
        assert!(advice.ends_with("..."));
    }

    #[test]
    fn trim_keeps_short_histories_verbatim() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        assert_eq!(trim_history(&messages, 1), messages);
    }

    #[test]
    fn trim_with_one_verbatim_pair() {
        // 4 older messages (2 shot exchanges) + 1 pair + pending user
        let messages = vec![
            Message::user(shot_message(1, "sour")),
            Message::assistant("Try grinding finer for a slower shot."),
            Message::user(shot_message(2, "better")),
            Message::assistant("Increase the dose slightly to 18.5g."),
            Message::user("last question"),
            Message::assistant("last answer"),
            Message::user("pending"),
        ];

        let trimmed = trim_history(&messages, 1);
        assert_eq!(trimmed.len(), 5);

        assert_eq!(trimmed[0].role, Role::User);
        assert!(trimmed[0].content.starts_with("Previous shots summary:\n"));
        assert!(trimmed[0].content.contains("- Shot #1:"));
        assert!(trimmed[0].content.contains("\u{2192} Advice: Try grinding finer"));
        assert!(trimmed[0].content.contains("- Shot #2:"));

        assert_eq!(trimmed[1].role, Role::Assistant);
        assert_eq!(trimmed[1].content, SUMMARY_ACK);

        assert_eq!(trimmed[2].content, "last question");
        assert_eq!(trimmed[3].content, "last answer");
        assert_eq!(trimmed[4].content, "pending");
    }

    #[test]
    fn trim_aligns_tail_to_user_message() {
        // 4 older shot messages + 1 verbatim pair, no pending user message
        let messages = vec![
            Message::user(shot_message(1, "sour")),
            Message::assistant("Try grinding finer."),
            Message::user(shot_message(2, "better")),
            Message::assistant("Increase the dose slightly."),
            Message::user("last question"),
            Message::assistant("last answer"),
        ];

        let trimmed = trim_history(&messages, 1);
        assert_eq!(trimmed.len(), 4);
        assert!(trimmed[0].content.starts_with("Previous shots summary:\n"));
        assert_eq!(trimmed[1].content, SUMMARY_ACK);
        assert_eq!(trimmed[2].content, "last question");
        assert_eq!(trimmed[3].content, "last answer");
    }

    #[test]
    fn dropped_follow_ups_are_counted() {
        let messages = vec![
            Message::user("plain follow-up one"),
            Message::assistant("answer"),
            Message::user("plain follow-up two"),
            Message::assistant("answer"),
            Message::user("recent question"),
            Message::assistant("recent answer"),
            Message::user("pending"),
        ];

        let trimmed = trim_history(&messages, 1);
        assert_eq!(trimmed[0].content, "(2 earlier follow-up message(s) omitted for brevity)");
        assert_eq!(trimmed[1].content, SUMMARY_ACK);
    }

    #[test]
    fn mixed_summary_and_dropped_count() {
        let messages = vec![
            Message::user(shot_message(1, "sour")),
            Message::assistant("Try a finer grind."),
            Message::user("plain follow-up"),
            Message::assistant("sure"),
            Message::user("recent"),
            Message::assistant("answer"),
            Message::user("pending"),
        ];

        let trimmed = trim_history(&messages, 1);
        let lines: Vec<&str> = trimmed[0].content.lines().collect();
        assert_eq!(lines[0], "Previous shots summary:");
        assert!(lines[1].starts_with("- Shot #1:"));
        assert_eq!(lines[2], "(1 earlier follow-up message(s) omitted for brevity)");
    }
}
