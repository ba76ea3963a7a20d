//! 模型输出的尽力 JSON 解码
//!
//! 去掉行首的 ``` 代码块围栏，取第一个括号配平的 `{...}`（跳过字符串内的括号与转义），再反序列化为目标类型；
//! 失败时用调用方给出的确定性兜底值（decode_or）。与网络调用无关，可单独测试。

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;

use crate::core::AgentError;

/// 第一个位于行首（前面只有空白）的 ```
fn fence_at_line_start(text: &str) -> Option<usize> {
    let mut offset = 0;
    loop {
        let idx = offset + text[offset..].find("```")?;
        let line_start = text[..idx].rfind('\n').map_or(0, |nl| nl + 1);
        if text[line_start..idx].trim().is_empty() {
            return Some(idx);
        }
        offset = idx + 3;
    }
}

/// 取 markdown 代码块（```json ... ``` 或 ``` ... ```）的内容；围栏须在行首
fn fenced_body(text: &str) -> Option<&str> {
    let start = fence_at_line_start(text)? + 3;
    let rest = &text[start..];
    // 跳过语言标记（如 json）到行尾
    let rest = match rest.find('\n') {
        Some(nl) if rest[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => &rest[nl + 1..],
        _ => rest,
    };
    match fence_at_line_start(rest) {
        Some(end) => Some(rest[..end].trim()),
        None => Some(rest.trim()),
    }
}

/// 从第一个 `{` 起扫描配平的对象，跳过字符串内的括号与转义
fn balanced_object(body: &str) -> Option<&str> {
    let start = body.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in body[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&body[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 提取第一个括号配平的 JSON 对象
///
/// 以 `{` 开头的输出直接扫描原文（字符串里的 ``` 不当作围栏）；
/// 否则先看行首围栏内的内容，找不到对象再回到原文。
pub fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Some(json) = balanced_object(trimmed) {
            return Some(json);
        }
    }
    fenced_body(trimmed)
        .and_then(balanced_object)
        .or_else(|| balanced_object(trimmed))
}

/// 解码为 T；找不到对象或结构不符时返回 JsonParseError
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, AgentError> {
    let json = extract_json_object(text).ok_or_else(|| {
        let preview: String = text.chars().take(120).collect();
        AgentError::JsonParseError(format!("no JSON object in output: {}", preview))
    })?;
    serde_json::from_str(json).map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json)))
}

/// 解码为 T；失败时返回 fallback 给出的类型化兜底值
pub fn decode_or<T: DeserializeOwned>(text: &str, fallback: impl FnOnce(&AgentError) -> T) -> T {
    match decode_json(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "model output decode failed, using fallback");
            fallback(&e)
        }
    }
}

/// 宽松布尔：接受 true / "true" / "yes" / 1
pub fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
        Num(f64),
        Null(()),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => Ok(b),
        Raw::Str(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "" => Ok(false),
            other => Err(de::Error::custom(format!("not a boolean: {}", other))),
        },
        Raw::Num(n) => Ok(n != 0.0),
        Raw::Null(()) => Ok(false),
    }
}

/// 宽松字符串：非字符串值按 JSON 文本保存，null 为空串
pub fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default, deserialize_with = "lenient_bool")]
        done: bool,
        #[serde(default, deserialize_with = "lenient_string")]
        note: String,
    }

    #[test]
    fn test_plain_json() {
        let p: Sample = decode_json(r#"{"done": true, "note": "ok"}"#).unwrap();
        assert_eq!(p, Sample { done: true, note: "ok".into() });
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here you go:\n```json\n{\"done\": \"true\", \"note\": \"fenced\"}\n```\nthanks";
        let p: Sample = decode_json(text).unwrap();
        assert!(p.done);
        assert_eq!(p.note, "fenced");
    }

    #[test]
    fn test_prose_wrapped_and_trailing_object() {
        let text = r#"I think {"done": false, "note": "first"} and later {"done": true}"#;
        let p: Sample = decode_json(text).unwrap();
        assert!(!p.done);
        assert_eq!(p.note, "first");
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"{"note": "use {curly} and \"quoted }\" text", "done": 1}"#;
        assert_eq!(extract_json_object(text), Some(text));
        let p: Sample = decode_json(text).unwrap();
        assert!(p.done);
        assert_eq!(p.note, "use {curly} and \"quoted }\" text");
    }

    #[test]
    fn test_nested_objects() {
        let text = r#"prefix {"a": {"b": {"c": 1}}, "done": true} suffix }"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"a": {"b": {"c": 1}}, "done": true}"#)
        );
    }

    #[test]
    fn test_non_string_note_is_stringified() {
        let p: Sample = decode_json(r#"{"note": ["a", 2]}"#).unwrap();
        assert_eq!(p.note, r#"["a",2]"#);
    }

    #[test]
    fn test_missing_or_unbalanced_is_error() {
        assert!(matches!(
            decode_json::<Sample>("no json here"),
            Err(AgentError::JsonParseError(_))
        ));
        assert!(extract_json_object(r#"{"done": true"#).is_none());
        assert!(matches!(
            decode_json::<Sample>("{ not json }"),
            Err(AgentError::JsonParseError(_))
        ));
    }

    #[test]
    fn test_decode_or_uses_typed_fallback() {
        let p = decode_or("no json here", |e| Sample {
            done: false,
            note: format!("fallback: {}", matches!(e, AgentError::JsonParseError(_))),
        });
        assert_eq!(p.note, "fallback: true");

        let p = decode_or(r#"{"done": true}"#, |_| Sample { done: false, note: String::new() });
        assert!(p.done);
    }

    #[test]
    fn test_backticks_inside_string_are_not_a_fence() {
        let text = r#"{"note": "the page shows ```npm install``` as the answer", "done": true}"#;
        let p: Sample = decode_json(text).unwrap();
        assert!(p.done);
        assert_eq!(p.note, "the page shows ```npm install``` as the answer");

        let prose = r#"Answer: {"note": "run ```make```", "done": "yes"}"#;
        let p: Sample = decode_json(prose).unwrap();
        assert!(p.done);
        assert_eq!(p.note, "run ```make```");
    }

    #[test]
    fn test_fence_without_object_falls_back_to_raw_text() {
        let text = "```\nno object here\n```\n{\"done\": true}";
        let p: Sample = decode_json(text).unwrap();
        assert!(p.done);
    }
}
