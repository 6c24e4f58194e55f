//! Lenient decoding of JSON objects produced by text generators.
//!
//! Generated scripts usually contain a JSON object, but it may be wrapped in
//! markdown fences, surrounded by prose, or slightly malformed. [`decode`]
//! tries a strict parse first and then a fixed sequence of repairs:
//!
//! 1. strip code fences and keep the outermost `{ ... }` span
//! 2. escape raw control characters and stray quotes inside strings
//! 3. drop trailing commas before `}` / `]`
//! 4. quote bare object keys
//!
//! The result always reports whether the input had to be modified, so callers
//! can persist the normalized form.

use serde_json::Value;

/// Maximum number of characters of the input echoed back in errors.
const SNIPPET_LEN: usize = 80;

/// Why an input could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("input is empty")]
    Empty,

    #[error("input does not contain a JSON object: {snippet}")]
    NoObject { snippet: String },

    #[error("JSON object is not terminated")]
    Unterminated,

    #[error("invalid JSON after repair: {0}")]
    Invalid(String),
}

/// Outcome of a lenient decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Parsed value, if any strategy succeeded.
    pub value: Option<Value>,
    /// Whether the input was altered before it parsed.
    pub modified: bool,
    /// Set when no strategy succeeded.
    pub error: Option<DecodeError>,
}

impl Decoded {
    fn ok(value: Value, modified: bool) -> Self {
        Self {
            value: Some(value),
            modified,
            error: None,
        }
    }

    fn err(error: DecodeError) -> Self {
        Self {
            value: None,
            modified: false,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.value.is_some()
    }

    /// Convert into a `Result` carrying the `modified` flag.
    pub fn into_result(self) -> Result<(Value, bool), DecodeError> {
        match (self.value, self.error) {
            (Some(value), _) => Ok((value, self.modified)),
            (None, Some(error)) => Err(error),
            (None, None) => Err(DecodeError::Empty),
        }
    }
}

/// Decode `input` into a JSON value, repairing common defects.
pub fn decode(input: &str) -> Decoded {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Decoded::err(DecodeError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Decoded::ok(value, false);
    }

    let unfenced = strip_code_fences(trimmed);
    let Some(start) = unfenced.find('{') else {
        return Decoded::err(DecodeError::NoObject {
            snippet: snippet(trimmed),
        });
    };
    let Some(end) = unfenced.rfind('}').filter(|end| *end > start) else {
        return Decoded::err(DecodeError::Unterminated);
    };
    let candidate = &unfenced[start..=end];

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Decoded::ok(value, true);
    }

    let repaired = remove_trailing_commas(&escape_string_contents(candidate));
    let first_error = match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => return Decoded::ok(value, true),
        Err(e) => e,
    };

    let quoted = quote_bare_keys(&repaired);
    match serde_json::from_str::<Value>(&quoted) {
        Ok(value) => Decoded::ok(value, true),
        Err(_) => Decoded::err(DecodeError::Invalid(first_error.to_string())),
    }
}

fn snippet(input: &str) -> String {
    let mut out: String = input.chars().take(SNIPPET_LEN).collect();
    if input.chars().count() > SNIPPET_LEN {
        out.push_str("...");
    }
    out
}

/// Return the body of the first fenced block, or the input when unfenced.
fn strip_code_fences(input: &str) -> &str {
    let Some(open) = input.find("```") else {
        return input;
    };
    let after_open = &input[open + 3..];
    // Skip the info string (e.g. "json") up to the end of the fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Whether the quote at `chars[idx - 1]` plausibly terminates a string.
fn closes_string(chars: &[char], idx: usize) -> bool {
    let mut i = idx;
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    let Some(&next) = chars.get(i) else {
        return true;
    };
    match next {
        '}' | ']' | ':' => true,
        ',' => {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            match chars.get(j) {
                None => true,
                Some('"' | '{' | '[' | '}' | ']' | '-') => true,
                Some(c) if c.is_ascii_digit() => true,
                Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                    // Either a literal or a bare key (`name:`).
                    let mut k = j;
                    while k < chars.len() && (chars[k].is_ascii_alphanumeric() || chars[k] == '_')
                    {
                        k += 1;
                    }
                    let word: String = chars[j..k].iter().collect();
                    while k < chars.len() && chars[k].is_whitespace() {
                        k += 1;
                    }
                    matches!(word.as_str(), "true" | "false" | "null") || chars.get(k) == Some(&':')
                }
                Some(_) => false,
            }
        }
        _ => false,
    }
}

fn escape_string_contents(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }

        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }

        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                if closes_string(&chars, i + 1) {
                    in_string = false;
                    out.push('"');
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn remove_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn quote_bare_keys(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    // True right after `{` or `,` outside a string (ignoring whitespace).
    let mut expect_key = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            i += 1;
            continue;
        }

        if expect_key && (c.is_ascii_alphabetic() || c == '_') {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if chars.get(j) == Some(&':') {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
            } else {
                out.push_str(&ident);
            }
            expect_key = false;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                expect_key = false;
            }
            '{' | ',' => expect_key = true,
            c if c.is_whitespace() => {}
            _ => expect_key = false,
        }
        out.push(c);
        i += 1;
    }
    out
}
