//! Recovery of structured payloads from free-form model output.
//!
//! Models wrap JSON in prose or fenced blocks and regularly hit their output
//! limit mid-payload. [`extract_payload`] walks a fixed ladder:
//!
//! 1. the content of a fenced block, when there is one;
//! 2. the first balanced `{…}` / `[…]` span, scanned with string awareness;
//! 3. for a truncated span, a short list of closing suffixes;
//!
//! and reports which rung succeeded. [`recover_records`] is the last resort:
//! per-field regexes over the raw text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Inserted before the computed closers when a payload was cut short.
const REPAIR_PREFIXES: &[&str] = &["", "\"", "0", "0.5", "\"\""];

/// Outcome of running the ladder over a raw response.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// A complete payload parsed as-is.
    Parsed(Value),
    /// A truncated payload closed by `suffix`. `cut` is set when the text
    /// stopped inside a quoted string, whose repaired value is then partial.
    Repaired {
        value: Value,
        suffix: String,
        cut: Option<CutString>,
    },
    Unrecoverable,
}

/// The string a truncated payload stopped in.
#[derive(Debug, Clone, PartialEq)]
pub struct CutString {
    /// Key the string was the value of; `None` for a list element.
    pub key: Option<String>,
    /// Decoded text that made it into the repaired payload.
    pub text: String,
}

impl CutString {
    /// Whether `item` is a record whose name, under one of `name_keys`, is
    /// the cut string.
    #[must_use]
    pub fn is_name_of(&self, item: &Value, name_keys: &[&str]) -> bool {
        match item {
            Value::String(s) => self.key.is_none() && *s == self.text,
            Value::Object(map) => self.key.as_deref().is_some_and(|key| {
                name_keys.contains(&key) && map.get(key).and_then(Value::as_str) == Some(self.text.as_str())
            }),
            _ => false,
        }
    }
}

impl Extraction {
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Parsed(value) | Self::Repaired { value, .. } => Some(value),
            Self::Unrecoverable => None,
        }
    }
}

/// Run the fence → balanced span → suffix repair ladder.
#[must_use]
pub fn extract_payload(raw: &str) -> Extraction {
    if let Some(block) = fenced_block(raw) {
        let extraction = scan(block);
        if extraction != Extraction::Unrecoverable {
            return extraction;
        }
    }
    scan(raw)
}

/// Content of the first ``` fence, without its language tag. An unterminated
/// fence runs to the end of the text.
fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after = &raw[open + 3..];
    let tag_len = after
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(after.len());
    let content = &after[tag_len..];
    let end = content.find("```").unwrap_or(content.len());
    Some(&content[..end])
}

enum Balance {
    /// Byte length of the balanced span.
    Closed(usize),
    Mismatched,
    Open {
        closers: Vec<char>,
        /// Byte offset of the opening quote of the unterminated string.
        open_string: Option<usize>,
    },
}

fn balance(text: &str) -> Balance {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_start = 0;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                string_start = i;
            }
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.pop() != Some(c) {
                    return Balance::Mismatched;
                }
                if closers.is_empty() {
                    return Balance::Closed(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }

    Balance::Open {
        closers,
        open_string: in_string.then_some(string_start),
    }
}

fn scan(body: &str) -> Extraction {
    let mut from = 0;
    while let Some(offset) = body[from..].find(['{', '[']) {
        let start = from + offset;
        let span = &body[start..];
        match balance(span) {
            Balance::Closed(len) => {
                if let Ok(value) = serde_json::from_str::<Value>(&span[..len]) {
                    return Extraction::Parsed(value);
                }
            }
            Balance::Mismatched => {}
            // Inner spans of a truncated payload are fragments, not candidates.
            Balance::Open {
                closers,
                open_string,
            } => {
                return repair(span, &closers, open_string).unwrap_or(Extraction::Unrecoverable);
            }
        }
        from = start + 1;
    }
    Extraction::Unrecoverable
}

fn repair(span: &str, closers: &[char], open_string: Option<usize>) -> Option<Extraction> {
    let mut base = span.trim_end();
    let cut = if let Some(start) = open_string {
        base = base.strip_suffix('\\').unwrap_or(base);
        Some(cut_string(base, start))
    } else {
        base = base.strip_suffix(',').unwrap_or(base).trim_end();
        None
    };
    let tail: String = closers.iter().rev().collect();

    REPAIR_PREFIXES.iter().find_map(|prefix| {
        let suffix = format!("{prefix}{tail}");
        let candidate = format!("{base}{suffix}");
        serde_json::from_str::<Value>(&candidate)
            .ok()
            .map(|value| Extraction::Repaired {
                value,
                suffix,
                cut: cut.clone(),
            })
    })
}

/// Describe the unterminated string opening at `start` in `base`.
fn cut_string(base: &str, start: usize) -> CutString {
    let text = unescape(&base[start + 1..]);
    let key = base[..start]
        .trim_end()
        .strip_suffix(':')
        .and_then(|before| KEY_BEFORE_RE.captures(before.trim_end()))
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()));
    CutString { key, text }
}

/// Fields of one food recovered straight from raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredRecord {
    pub food_name: String,
    pub weight_g: Option<f64>,
    pub carbs_per_100g: Option<f64>,
    pub total_carbs_g: Option<f64>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:foodName|food_name|name|aliment)"\s*:\s*"((?:[^"\\]|\\.)*)""#)
        .expect("valid regex")
});
static WEIGHT_RE: LazyLock<Regex> = LazyLock::new(|| number_field(&["estimatedWeightG", "weightG", "weight_g"]));
static CARBS_RE: LazyLock<Regex> = LazyLock::new(|| number_field(&["carbsPer100g", "carbs_per_100g"]));
static TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| number_field(&["totalCarbsG", "total_carbs_g", "totalCarbs"]));
static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| number_field(&["confidence"]));
static REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:reasoning|rationale)"\s*:\s*"((?:[^"\\]|\\.)*)"?"#).expect("valid regex")
});
static KEY_BEFORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)"$"#).expect("valid regex"));
static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""error"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex")
});

fn number_field(keys: &[&str]) -> Regex {
    let pattern = format!(r#""(?:{})"\s*:\s*"?(-?\d+(?:\.\d+)?)"#, keys.join("|"));
    Regex::new(&pattern).expect("valid regex")
}

fn unescape(s: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{s}\"")).unwrap_or_else(|_| s.to_string())
}

fn capture_number(re: &Regex, segment: &str) -> Option<f64> {
    re.captures(segment)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Per-field regex recovery. Each record starts at a complete, quoted food
/// name and spans up to the next one; fields outside that span are not read.
#[must_use]
pub fn recover_records(raw: &str) -> Vec<RecoveredRecord> {
    let starts: Vec<(usize, String)> = NAME_RE
        .captures_iter(raw)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let name = unescape(c.get(1)?.as_str()).trim().to_string();
            (!name.is_empty()).then_some((whole.start(), name))
        })
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, (start, name))| {
            let end = starts.get(i + 1).map_or(raw.len(), |(next, _)| *next);
            let segment = &raw[*start..end];
            RecoveredRecord {
                food_name: name.clone(),
                weight_g: capture_number(&WEIGHT_RE, segment),
                carbs_per_100g: capture_number(&CARBS_RE, segment),
                total_carbs_g: capture_number(&TOTAL_RE, segment),
                confidence: capture_number(&CONFIDENCE_RE, segment),
                reasoning: REASONING_RE
                    .captures(segment)
                    .and_then(|c| c.get(1))
                    .map(|m| unescape(m.as_str())),
            }
        })
        .collect()
}

/// A model-declared failure message found directly in raw text.
#[must_use]
pub fn recover_error_message(raw: &str) -> Option<String> {
    ERROR_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()))
        .filter(|m| !m.trim().is_empty())
}
