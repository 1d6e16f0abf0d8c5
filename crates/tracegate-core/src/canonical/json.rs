//! Deterministic JSON output with sorted keys and minimal escaping.
//!
//! The emitter follows RFC 8785 (JCS) formatting for structure and string
//! escaping: keys in lexicographic (byte-order) order, no whitespace between
//! tokens, and only the escapes JSON requires. Unlike a strict JCS profile it
//! is total over `serde_json::Value` - trace payloads legitimately carry
//! floats (policy amounts, clock offsets), so numbers are emitted via their
//! `serde_json` representation rather than rejected.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};

/// Produces the canonical string form of a JSON value.
///
/// The output is deterministic: two structurally equal values always yield
/// byte-identical strings regardless of original key order.
#[must_use]
pub fn to_canonical_string(value: &Value) -> String {
    let mut output = String::new();
    emit_value(value, &mut output);
    output
}

fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => emit_array(arr, output),
        Value::Object(obj) => emit_object(obj, output),
    }
}

fn emit_number(n: &Number, output: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
    } else {
        output.push_str(&n.to_string());
    }
}

/// Emits a string with minimal escaping per RFC 8785 Section 3.2.2.2.
///
/// Only `"`, `\`, and control characters U+0000 through U+001F are escaped;
/// short escapes are used where defined and `\uXXXX` otherwise.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_array(arr: &[Value], output: &mut String) {
    output.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_value(item, output);
    }
    output.push(']');
}

fn emit_object(obj: &Map<String, Value>, output: &mut String) {
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort();

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output);
    }
    output.push('}');
}
