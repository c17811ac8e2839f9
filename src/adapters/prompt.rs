//! Prompt rendering and JSON extraction for text-based agents.

use anyhow::Result;
use serde_json::{json, Value};

use super::AgentRequest;

/// Template used when an agent has none configured
pub const DEFAULT_TEMPLATE: &str = "{{task}}

## Context

```json
{{context}}
```

Respond with a single JSON value and nothing else.
";

/// Fill `{{task}}` and `{{context}}` in a template
pub fn render_prompt(template: &str, request: &AgentRequest) -> Result<String> {
    let context = json!({
        "input": request.input,
        "context": request.agent.prompt.context,
    });
    let context = serde_json::to_string_pretty(&context)?;

    let task = task_text(request);
    Ok(substitute(template, &[("{{task}}", &task), ("{{context}}", &context)]))
}

/// Replace placeholders in one pass, so substituted text is never rescanned
fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push_str("{{");
                rest = &tail[2..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn task_text(request: &AgentRequest) -> String {
    let prompt = &request.agent.prompt;
    let mut text = String::new();

    if !prompt.role.is_empty() {
        text.push_str(&format!("You are {}.\n\n", prompt.role));
    }
    text.push_str(&format!("# {}\n\n{}\n", request.title, prompt.task));

    if !prompt.instructions.is_empty() {
        text.push_str("\n## Instructions\n\n");
        for (i, instruction) in prompt.instructions.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, instruction));
        }
    }

    if !prompt.output_format.is_empty() {
        text.push_str(&format!("\n## Output format\n\n{}\n", prompt.output_format));
    }

    if let Ok(schema) = serde_json::to_string_pretty(&request.agent.output_schema) {
        text.push_str(&format!("\n## Output schema\n\n```json\n{}\n```\n", schema));
    }

    text
}

/// Decode agent output bytes, honoring UTF-8 and UTF-16 byte-order marks
pub fn decode_text(raw: &[u8]) -> String {
    match raw {
        [0xff, 0xfe, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xfe, 0xff, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        [0xef, 0xbb, 0xbf, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(raw).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Find the first JSON object or array embedded in free text.
///
/// Tries every `{` or `[` in order and returns the first value that parses
/// from there; anything after the value is ignored.
pub fn extract_first_json(text: &str) -> Option<Value> {
    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .find_map(|(start, _)| {
            serde_json::Deserializer::from_str(&text[start..])
                .into_iter::<Value>()
                .next()
                .and_then(|parsed| parsed.ok())
        })
}
