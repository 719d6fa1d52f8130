/*
 * headers.rs
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

//! Ordered, case-insensitive header multimap.

use crate::protocol::http::grammar::split_list;

/// Header collection. Names keep the case they were added with but compare
/// case-insensitively; repeated names keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a value, keeping any existing values for the name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for the name with one value. The new entry takes the
    /// position of the first existing one, or goes last.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(first) => {
                self.entries[first] = (name.clone(), value);
                let mut i = first + 1;
                while i < self.entries.len() {
                    if self.entries[i].0.eq_ignore_ascii_case(&name) {
                        self.entries.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Remove all values for the name; returns true if any were present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// First value for the name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the name in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values joined with ", " in insertion order (RFC 2616 4.2).
    pub fn combined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// True if the comma-separated list header contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(split_list)
            .any(|t| t.eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k, v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_compare_case_insensitively() {
        let mut h = Headers::new();
        h.append("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert!(h.contains("CONTENT-TYPE"));
    }

    #[test]
    fn combined_keeps_insertion_order() {
        let mut h = Headers::new();
        h.append("Accept", "text/html");
        h.append("X-Other", "1");
        h.append("accept", "application/json");
        assert_eq!(h.combined("ACCEPT").as_deref(), Some("text/html, application/json"));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut h = Headers::new();
        h.append("A", "1");
        h.append("B", "2");
        h.append("a", "3");
        h.set("a", "4");
        let all: Vec<(&str, &str)> = h.iter().collect();
        assert_eq!(all, vec![("a", "4"), ("B", "2")]);
    }

    #[test]
    fn has_token_scans_lists() {
        let mut h = Headers::new();
        h.append("Connection", "Keep-Alive, Upgrade");
        h.append("Connection", "close");
        assert!(h.has_token("connection", "close"));
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "te"));
    }

    #[test]
    fn remove_drops_every_value() {
        let mut h: Headers = vec![("Expect", "100-continue"), ("expect", "x")].into_iter().collect();
        assert!(h.remove("EXPECT"));
        assert!(h.is_empty());
        assert!(!h.remove("Expect"));
    }
}
