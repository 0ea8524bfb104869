//! Flat `key=value` text serialization of the store map.
//!
//! This is the subset of the Java properties format that other keystore
//! implementations write. Parsing is strict: decrypting with the wrong
//! password produces bytes that must be rejected here instead of being taken
//! for an empty or partial map.

use crate::error::{KeyStoreError, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

pub type PropertyMap = HashMap<String, String>;

pub fn serialize(map: &PropertyMap) -> String {
    let sorted: BTreeMap<&String, &String> = map.iter().collect();
    let mut out = String::with_capacity(map.len() * 64);
    out.push('#');
    out.push_str(&Utc::now().to_rfc2822());
    out.push('\n');
    for (key, value) in sorted {
        escape_into(&mut out, key, true);
        out.push('=');
        escape_into(&mut out, value, false);
        out.push('\n');
    }
    out
}

pub fn parse(bytes: &[u8]) -> Result<PropertyMap> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| KeyStoreError::Malformed(format!("not utf-8: {e}")))?;
    let mut map = PropertyMap::new();
    let mut lines = text.split('\n').enumerate();
    while let Some((index, raw)) = lines.next() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        check_controls(raw, index)?;
        let trimmed = raw.trim_start_matches([' ', '\t', '\u{c}']);
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }
        let mut line = trimmed.to_string();
        while ends_with_continuation(&line) {
            line.pop();
            match lines.next() {
                Some((next_index, next)) => {
                    let next = next.strip_suffix('\r').unwrap_or(next);
                    check_controls(next, next_index)?;
                    line.push_str(next.trim_start_matches([' ', '\t', '\u{c}']));
                }
                None => break,
            }
        }
        let (key, value) = split_entry(&line)
            .ok_or_else(|| KeyStoreError::Malformed(format!("line {}: no separator", index + 1)))?;
        let key = unescape(key, index)?;
        let value = unescape(value, index)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn check_controls(line: &str, index: usize) -> Result<()> {
    if line.chars().any(|c| c.is_control() && c != '\t' && c != '\u{c}') {
        return Err(KeyStoreError::Malformed(format!(
            "line {}: control character",
            index + 1
        )));
    }
    Ok(())
}

// An odd run of trailing backslashes continues the line.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => {
                let value = line[i + 1..].trim_start_matches([' ', '\t', '\u{c}']);
                return Some((line[..i].trim_end_matches([' ', '\t', '\u{c}']), value));
            }
            _ => {}
        }
    }
    None
}

fn unescape(raw: &str, index: usize) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let bad = || KeyStoreError::Malformed(format!("line {}: bad \\u escape", index + 1));
                let unit = read_code_unit(&mut chars).ok_or_else(bad)?;
                let decoded = if (0xd800..0xdc00).contains(&unit) {
                    // supplementary characters arrive as an escaped surrogate pair
                    let mut ahead = chars.clone();
                    let low = match (ahead.next(), ahead.next()) {
                        (Some('\\'), Some('u')) => read_code_unit(&mut ahead),
                        _ => None,
                    }
                    .ok_or_else(bad)?;
                    chars = ahead;
                    char::decode_utf16([unit, low])
                        .next()
                        .and_then(|r| r.ok())
                        .ok_or_else(bad)?
                } else {
                    char::from_u32(u32::from(unit)).ok_or_else(bad)?
                };
                out.push(decoded);
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    Ok(out)
}

fn read_code_unit(chars: &mut std::str::Chars<'_>) -> Option<u16> {
    let code: String = chars.by_ref().take(4).collect();
    if code.len() != 4 {
        return None;
    }
    u16::from_str_radix(&code, 16).ok()
}

fn escape_into(out: &mut String, raw: &str, is_key: bool) {
    for (i, c) in raw.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{c}' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_then_parse_preserves_awkward_values() {
        let mut map = PropertyMap::new();
        map.insert("bob@example.com/phone.publicKey".into(), "MIIBtzCCASsGByqGSM44BAEwggEe".into());
        map.insert("key with = and :".into(), " leading space\tand tab".into());
        map.insert("version".into(), "2.0.0".into());
        map.insert("unicode".into(), "grüße\\path\nnext".into());
        let text = serialize(&map);
        assert!(text.starts_with('#'));
        assert_eq!(parse(text.as_bytes()).unwrap(), map);
    }

    #[test]
    fn parses_java_style_file() {
        let text = "#Sat Jan 01 00:00:00 UTC 2022\n\
                    ! comment\n\
                    version=2.0.0\n\
                    alice@example.com.fingerprint : 0a1b\n\
                    long=abc\\\n    def\n\
                    escaped\\:key=\\u0041\n";
        let map = parse(text.as_bytes()).unwrap();
        assert_eq!(map["version"], "2.0.0");
        assert_eq!(map["alice@example.com.fingerprint"], "0a1b");
        assert_eq!(map["long"], "abcdef");
        assert_eq!(map["escaped:key"], "A");
    }

    #[test]
    fn joins_escaped_surrogate_pairs() {
        let map = parse(b"bob@example.com/\\ud83d\\udcf1.fingerprint=\\u00e9\\ud83d\\ude00\n").unwrap();
        assert_eq!(map["bob@example.com/\u{1f4f1}.fingerprint"], "\u{e9}\u{1f600}");

        assert!(matches!(parse(b"k=\\ud83d"), Err(KeyStoreError::Malformed(_))));
        assert!(matches!(parse(b"k=\\ud83dx"), Err(KeyStoreError::Malformed(_))));
        assert!(matches!(parse(b"k=\\ud83d\\u0041"), Err(KeyStoreError::Malformed(_))));
        assert!(matches!(parse(b"k=\\udcf1"), Err(KeyStoreError::Malformed(_))));
    }

    #[test]
    fn empty_input_is_empty_map() {
        assert!(parse(b"").unwrap().is_empty());
        assert!(parse(b"#only a comment\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse(&[0xff, 0xfe, 0x00, 0x41]), Err(KeyStoreError::Malformed(_))));
        assert!(matches!(parse(b"key\x01=value"), Err(KeyStoreError::Malformed(_))));
        assert!(matches!(parse(b"no separator here"), Err(KeyStoreError::Malformed(_))));
        assert!(matches!(parse(b"k=\\u00zz"), Err(KeyStoreError::Malformed(_))));
    }
}
