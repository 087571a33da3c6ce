use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A structured, renderable unit lifted out of free-text model output for
/// dedicated display. Prose around the block stays in the transcript; the
/// artifact is a copy, not a cut.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
}

impl Artifact {
    pub fn new(
        title: Option<String>,
        language: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            language,
            content: content.into(),
        }
    }
}

/// Split a fence info string like `rust title="Fibonacci"` into language and
/// title.
fn parse_info_string(info: &str) -> (Option<String>, Option<String>) {
    let mut language = None;
    let mut title = None;

    for (i, token) in info.split_whitespace().enumerate() {
        if let Some(raw) = token.strip_prefix("title=") {
            title = Some(raw.trim_matches('"').to_string());
        } else if i == 0 {
            language = Some(token.to_string());
        }
    }

    (language, title)
}

/// Extract the first fenced code block with a non-empty info string.
/// Indented code blocks and bare ``` fences don't qualify; they are
/// formatting, not artifacts.
pub fn extract_first_artifact(text: &str) -> Option<Artifact> {
    let mut capture: Option<(Option<String>, Option<String>, String)> = None;

    for event in Parser::new(text) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                if info.trim().is_empty() {
                    continue;
                }
                let (language, title) = parse_info_string(info.trim());
                capture = Some((language, title, String::new()));
            }
            Event::Text(chunk) => {
                if let Some((_, _, content)) = capture.as_mut() {
                    content.push_str(&chunk);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((language, title, content)) = capture.take() {
                    return Some(Artifact::new(title, language, content.trim_end_matches('\n')));
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_first_tagged_block() {
        let text = "Here you go:\n\n```rust\nfn main() {}\n```\n\nAnd more:\n\n```python\nprint(1)\n```\n";
        let artifact = extract_first_artifact(text).expect("artifact");
        assert_eq!(artifact.language.as_deref(), Some("rust"));
        assert_eq!(artifact.content, "fn main() {}");
    }

    #[test]
    fn title_key_is_parsed_from_the_info_string() {
        let text = "```rust title=\"Fibonacci\"\nfn fib(n: u64) -> u64 { n }\n```";
        let artifact = extract_first_artifact(text).expect("artifact");
        assert_eq!(artifact.title.as_deref(), Some("Fibonacci"));
        assert_eq!(artifact.language.as_deref(), Some("rust"));
    }

    #[test]
    fn untagged_fences_are_not_artifacts() {
        assert!(extract_first_artifact("```\njust formatting\n```").is_none());
    }

    #[test]
    fn prose_without_blocks_yields_none() {
        assert!(extract_first_artifact("no code here, just words").is_none());
    }

    #[test]
    fn indented_code_is_ignored() {
        assert!(extract_first_artifact("intro:\n\n    indented code\n").is_none());
    }
}
