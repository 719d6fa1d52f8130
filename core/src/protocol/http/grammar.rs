/*
 * grammar.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, an HTTP/1.x client engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! RFC 2616 basic rules: token, separators, quoted-string, LWS.
//!
//! Only what the engine needs to validate header names and split challenge
//! parameter lists.

/// True if `b` is a separator character (RFC 2616 section 2.2).
pub fn is_separator(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'['
            | b']' | b'?' | b'=' | b'{' | b'}' | b' ' | b'\t'
    )
}

/// True if `b` may appear in a token.
pub fn is_token_char(b: u8) -> bool {
    (33..127).contains(&b) && !is_separator(b)
}

/// True if `s` is a non-empty token.
pub fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_char)
}

/// One lexical item of a header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word {
    Token(String),
    /// Unescaped content of a quoted-string.
    Quoted(String),
    Separator(u8),
}

/// Split a header value into words, dropping linear white space.
///
/// Returns `None` on an unterminated quoted-string or a control character.
pub fn words(value: &str) -> Option<Vec<Word>> {
    let bytes = value.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' {
            i += 1;
        } else if b == b'"' {
            let mut text = Vec::new();
            i += 1;
            loop {
                match bytes.get(i) {
                    None => return None,
                    Some(b'"') => {
                        i += 1;
                        break;
                    }
                    Some(b'\\') => {
                        let escaped = *bytes.get(i + 1)?;
                        text.push(escaped);
                        i += 2;
                    }
                    Some(&c) => {
                        text.push(c);
                        i += 1;
                    }
                }
            }
            out.push(Word::Quoted(String::from_utf8_lossy(&text).into_owned()));
        } else if is_separator(b) {
            out.push(Word::Separator(b));
            i += 1;
        } else if b < 32 || b == 127 {
            return None;
        } else {
            let start = i;
            while i < bytes.len() && !is_separator(bytes[i]) && bytes[i] >= 32 && bytes[i] != 127 {
                i += 1;
            }
            out.push(Word::Token(value[start..i].to_string()));
        }
    }
    Some(out)
}

/// Split a comma-separated list header into trimmed, non-empty elements,
/// respecting quoted-strings.
pub fn split_list(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                let item = value[start..i].trim();
                if !item.is_empty() {
                    items.push(item);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let item = value[start..].trim();
    if !item.is_empty() {
        items.push(item);
    }
    items
}

/// Quote `s` as a quoted-string if it is not a token.
pub fn quote_if_needed(s: &str) -> String {
    if is_token(s) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
