//! Agent output grammar
//!
//! Agents report results as a sequence of `KEY: value` lines. A key line
//! matches `^[A-Z][A-Z0-9_]*: ?`; the value continues across subsequent
//! lines until the next key line or end of input. There is no escaping: a
//! line that looks like a key line always starts a new key. Unknown keys are
//! preserved in the raw stored output but otherwise unused.

use crate::error::{Error, Result};
use crate::storage::NewStory;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;

static KEY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z][A-Z0-9_]*): ?(.*)$").expect("valid key-line regex"));

/// Parsed `KEY: value` map. Later occurrences of a key win.
#[derive(Debug, Clone, Default)]
pub struct OutputMap {
    values: HashMap<String, String>,
}

impl OutputMap {
    /// Parse a raw output block. Text before the first key line is ignored.
    pub fn parse(raw: &str) -> Self {
        let mut values = HashMap::new();
        let mut current: Option<(String, Vec<String>)> = None;
        for line in raw.lines() {
            if let Some(caps) = KEY_LINE.captures(line) {
                if let Some((key, lines)) = current.take() {
                    values.insert(key, join_value(lines));
                }
                current = Some((caps[1].to_string(), vec![caps[2].to_string()]));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line.to_string());
            }
        }
        if let Some((key, lines)) = current {
            values.insert(key, join_value(lines));
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Declared keys whose value is absent or blank.
    pub fn missing_keys<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|key| self.get(key).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
            .collect()
    }

    /// Validate that every required key is present and non-empty.
    pub fn require(&self, required: &[String]) -> Result<()> {
        let missing = self.missing_keys(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Parse(format!(
                "missing required output keys: {}",
                missing.join(", ")
            )))
        }
    }

    /// Iterate over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn join_value(lines: Vec<String>) -> String {
    lines.join("\n").trim_end().to_string()
}

#[derive(Deserialize)]
struct StoryRecordJson {
    story_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    input: String,
}

/// Extract the `STORIES_JSON` array from a source step's output into story
/// seeds, in declared order.
pub fn parse_stories(raw_output: &str) -> Result<Vec<NewStory>> {
    let output = OutputMap::parse(raw_output);
    let value = output
        .get(crate::workflow::STORIES_KEY)
        .ok_or_else(|| Error::Parse("source output has no STORIES_JSON key".into()))?;
    let records: Vec<StoryRecordJson> = serde_json::from_str(value)
        .map_err(|e| Error::Parse(format!("invalid STORIES_JSON array: {e}")))?;
    Ok(records
        .into_iter()
        .map(|r| NewStory {
            story_id: r.story_id,
            title: r.title,
            input: r.input,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line_values() {
        let out = OutputMap::parse("SUMMARY: all good\nNOTES: none\n");
        assert_eq!(out.get("SUMMARY"), Some("all good"));
        assert_eq!(out.get("NOTES"), Some("none"));
    }

    #[test]
    fn multiline_value_runs_until_next_key_line() {
        let raw = "PLAN: first line\nsecond line\n  indented third\nVERDICT: pass\n";
        let out = OutputMap::parse(raw);
        assert_eq!(out.get("PLAN"), Some("first line\nsecond line\n  indented third"));
        assert_eq!(out.get("VERDICT"), Some("pass"));
    }

    #[test]
    fn lowercase_prefix_is_not_a_key_line() {
        let out = OutputMap::parse("SUMMARY: ok\nnote: continuation\n");
        assert_eq!(out.get("SUMMARY"), Some("ok\nnote: continuation"));
        assert_eq!(out.get("note"), None);
    }

    #[test]
    fn preamble_before_first_key_is_ignored() {
        let out = OutputMap::parse("I did the work.\n\nRESULT: done\n");
        assert_eq!(out.get("RESULT"), Some("done"));
    }

    #[test]
    fn later_occurrence_of_a_key_wins() {
        let out = OutputMap::parse("K: one\nK: two\n");
        assert_eq!(out.get("K"), Some("two"));
    }

    #[test]
    fn require_reports_missing_and_blank_keys() {
        let out = OutputMap::parse("A: ok\nB:\n");
        let required = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let err = out.require(&required).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains('B') && msg.contains('C') && !msg.contains('A'), "{msg}");
    }

    #[test]
    fn parse_stories_keeps_declared_order() {
        let raw = r#"STORIES_JSON: [{"story_id":"a","title":"A","input":"do A"},{"story_id":"b","title":"B","input":"do B"}]"#;
        let stories = parse_stories(raw).unwrap();
        assert_eq!(stories.len(), 2);
        assert_eq!(stories[0].story_id, "a");
        assert_eq!(stories[1].story_id, "b");
        assert_eq!(stories[1].input, "do B");
    }

    #[test]
    fn parse_stories_rejects_bad_json() {
        let err = parse_stories("STORIES_JSON: not json").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn parse_stories_rejects_missing_key() {
        let err = parse_stories("PLAN: nothing here").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn parse_stories_accepts_empty_array() {
        let stories = parse_stories("STORIES_JSON: []").unwrap();
        assert!(stories.is_empty());
    }
}
