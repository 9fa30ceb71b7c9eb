use serde_json::{Map, Value};

use super::{ClassificationRequest, ClassifierOutput};
use crate::error::{PipelineError, PipelineResult};

const MAX_OCR_CHARS: usize = 4000;

pub const SYSTEM_PROMPT: &str = "You label short spans of computer activity from a screenshot, \
on-screen text and window context. Reply with a single JSON object and nothing else.";

/// User prompt for one event. The image, when present, travels as a separate content part.
pub fn build_prompt(request: &ClassificationRequest) -> String {
    let mut prompt = String::from(
        "Classify this activity. Respond with JSON using these keys:\n\
         category (string), subcategories (string array), caption (one sentence), \
         tags (string array), confidence (0..1),\n\
         addictionCandidate (string or null, e.g. \"social media\", \"video streaming\", \"gaming\"), \
         addictionConfidence (0..1 or null),\n\
         project (string or null), projectProgress (boolean), \
         projectProgressConfidence (0..1 or null), evidence (string array).\n",
    );

    prompt.push_str(&format!("\nDuration: {}s\n", request.duration_secs.max(0)));

    if let Some(key) = &request.context_key {
        prompt.push_str(&format!("Context key: {key}\n"));
    }
    if let Some(context) = &request.context {
        if let Ok(json) = serde_json::to_string(context) {
            prompt.push_str(&format!("Context: {json}\n"));
        }
    }
    if let Some(text) = request.ocr_text.as_deref().filter(|t| !t.trim().is_empty()) {
        let clipped: String = text.chars().take(MAX_OCR_CHARS).collect();
        prompt.push_str("\nOn-screen text:\n");
        prompt.push_str(&clipped);
        prompt.push('\n');
    }

    prompt
}

/// Pulls the first JSON object out of a model reply (code fences and chatter
/// around it are ignored) and maps it onto `ClassifierOutput`. Replies with
/// no object are transient: the next attempt may well produce one.
pub fn parse_reply(content: &str) -> PipelineResult<ClassifierOutput> {
    let object = extract_object(content)
        .ok_or_else(|| PipelineError::transient("classifier reply contained no JSON object"))?;

    Ok(ClassifierOutput {
        category: string_field(&object, &["category"]),
        subcategories: list_field(&object, &["subcategories", "subCategories"]),
        caption: string_field(&object, &["caption", "summary"]),
        tags: list_field(&object, &["tags"]),
        confidence: number_field(&object, &["confidence"]),
        addiction_candidate: string_field(&object, &["addictionCandidate", "addiction_candidate", "addiction"]),
        addiction_confidence: number_field(&object, &["addictionConfidence", "addiction_confidence"]),
        project: string_field(&object, &["project"]),
        project_progress: bool_field(&object, &["projectProgress", "project_progress"]),
        project_progress_confidence: number_field(
            &object,
            &["projectProgressConfidence", "project_progress_confidence"],
        ),
        evidence: list_field(&object, &["evidence", "projectProgressEvidence"]),
    })
}

fn extract_object(content: &str) -> Option<Map<String, Value>> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&content[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key)).filter(|v| !v.is_null())
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match lookup(object, keys)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_field(object: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    match lookup(object, keys)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bool_field(object: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    match lookup(object, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn list_field(object: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    match lookup(object, keys) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"category\": \"Work\", \"confidence\": 0.9, \
                     \"tags\": [\"rust\", \" \"], \"projectProgress\": true}\n```";
        let output = parse_reply(reply).unwrap();
        assert_eq!(output.category.as_deref(), Some("Work"));
        assert_eq!(output.confidence, Some(0.9));
        assert_eq!(output.tags, vec!["rust".to_string()]);
        assert_eq!(output.project_progress, Some(true));
    }

    #[test]
    fn test_lenient_field_shapes() {
        let reply = r#"{"confidence": "0.75", "subcategories": "coding, review", "addiction_candidate": "gaming"}"#;
        let output = parse_reply(reply).unwrap();
        assert_eq!(output.confidence, Some(0.75));
        assert_eq!(output.subcategories, vec!["coding", "review"]);
        assert_eq!(output.addiction_candidate.as_deref(), Some("gaming"));
    }

    #[test]
    fn test_reply_without_object_is_transient() {
        let err = parse_reply("I cannot see the screen").unwrap_err();
        assert!(err.is_transient());
        assert!(parse_reply("[1, 2]").unwrap_err().is_transient());
    }

    #[test]
    fn test_prompt_carries_context_and_clipped_text() {
        let request = ClassificationRequest {
            context_key: Some("app:Editor".into()),
            ocr_text: Some("x".repeat(MAX_OCR_CHARS + 50)),
            duration_secs: 42,
            ..ClassificationRequest::default()
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains("Context key: app:Editor"));
        assert!(prompt.contains("Duration: 42s"));
        assert!(!prompt.contains(&"x".repeat(MAX_OCR_CHARS + 1)));
    }
}
