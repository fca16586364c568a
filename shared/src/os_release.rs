use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Name used when an os-release file offers neither `PRETTY_NAME` nor `NAME`.
pub const DEFAULT_OS_NAME: &str = "Linux";

/// An os-release file represented by a BTreeMap.
///
/// Ordered keys keep the `Display` output stable, which the snapshot tests rely on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OsRelease(pub BTreeMap<String, String>);

impl OsRelease {
    /// Parse os-release data embedded in a binary.
    ///
    /// The data is cut at the first NUL byte, because `.osrel` sections are usually padded. Data
    /// that is not valid UTF-8 is rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let text = std::str::from_utf8(&data[..end]).context("os-release data is not valid UTF-8")?;
        Self::from_str(text)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// A name for display, preferring `PRETTY_NAME` over `NAME`. Empty values count as missing.
    pub fn pretty_name(&self) -> &str {
        ["PRETTY_NAME", "NAME"]
            .into_iter()
            .filter_map(|key| self.get(key))
            .find(|value| !value.is_empty())
            .unwrap_or(DEFAULT_OS_NAME)
    }
}

const COMMENTS: &str = "#;";
const WHITESPACE: &str = " \t\n\r";
const NEWLINE: &str = "\r\n";
const SHELL_NEED_ESCAPE: &str = "\"\\`$";

#[derive(Clone, Copy)]
enum State {
    PreKey,
    Key,
    PreValue,
    Value,
    ValueEscape,
    SingleQuoteValue,
    DoubleQuoteValue,
    DoubleQuoteValueEscape,
    Comment,
    CommentEscape,
}

/// Shell-like `KEY=VALUE` assignment reader, fed one character at a time.
struct Assignments {
    state: State,
    key: String,
    value: String,
    entries: BTreeMap<String, String>,
}

impl Assignments {
    fn new() -> Self {
        Self {
            state: State::PreKey,
            key: String::new(),
            value: String::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Store the pending assignment. Unquoted values lose their trailing whitespace.
    fn commit(&mut self, trim_value: bool) {
        let key = self.key.trim_end();
        let value = if trim_value {
            self.value.trim_end()
        } else {
            self.value.as_str()
        };

        if is_valid_key(key) {
            self.entries.insert(key.to_owned(), value.to_owned());
        } else {
            log::debug!("Ignoring os-release assignment with invalid key {key:?}.");
        }

        self.key.clear();
        self.value.clear();
    }

    fn feed(&mut self, c: char) {
        use State::*;

        let state = self.state;
        self.state = match state {
            PreKey if COMMENTS.contains(c) => Comment,
            PreKey if WHITESPACE.contains(c) => PreKey,
            PreKey => {
                self.key.push(c);
                Key
            }

            // A line without '=' is dropped.
            Key if NEWLINE.contains(c) => {
                self.key.clear();
                PreKey
            }
            Key if c == '=' => PreValue,
            Key => {
                self.key.push(c);
                Key
            }

            PreValue | Value if NEWLINE.contains(c) => {
                self.commit(matches!(state, Value));
                PreKey
            }
            PreValue if c == '\'' => SingleQuoteValue,
            PreValue if c == '"' => DoubleQuoteValue,
            PreValue | Value if c == '\\' => ValueEscape,
            PreValue if WHITESPACE.contains(c) => PreValue,
            PreValue | Value => {
                self.value.push(c);
                Value
            }

            // Escaped newlines join lines.
            ValueEscape => {
                if !NEWLINE.contains(c) {
                    self.value.push(c);
                }
                Value
            }

            SingleQuoteValue if c == '\'' => PreValue,
            SingleQuoteValue => {
                self.value.push(c);
                SingleQuoteValue
            }

            DoubleQuoteValue if c == '"' => PreValue,
            DoubleQuoteValue if c == '\\' => DoubleQuoteValueEscape,
            DoubleQuoteValue => {
                self.value.push(c);
                DoubleQuoteValue
            }

            // Like the shell, only the special characters are unescaped. Any other escape keeps
            // its backslash, and escaped newlines vanish.
            DoubleQuoteValueEscape => {
                if SHELL_NEED_ESCAPE.contains(c) {
                    self.value.push(c);
                } else if c != '\n' {
                    self.value.push('\\');
                    self.value.push(c);
                }
                DoubleQuoteValue
            }

            Comment if c == '\\' => CommentEscape,
            Comment if NEWLINE.contains(c) => PreKey,
            Comment => Comment,

            CommentEscape if NEWLINE.contains(c) => PreKey,
            CommentEscape => Comment,
        };
    }

    fn finish(mut self) -> BTreeMap<String, String> {
        use State::*;

        match self.state {
            Value => self.commit(true),
            PreValue | ValueEscape | SingleQuoteValue | DoubleQuoteValue
            | DoubleQuoteValueEscape => self.commit(false),
            PreKey | Key | Comment | CommentEscape => {}
        }

        self.entries
    }
}

/// Environment-variable style keys: ASCII letters, digits and underscores, not starting with a
/// digit.
fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for OsRelease {
    type Err = anyhow::Error;

    /// Parse the string representation of an os-release file.
    ///
    /// Comments, quoting and backslash escapes follow the shell-compatible subset described in
    /// os-release(5). Assignments with invalid keys are skipped.
    fn from_str(value: &str) -> Result<Self> {
        let mut assignments = Assignments::new();
        value.chars().for_each(|c| assignments.feed(c));
        Ok(Self(assignments.finish()))
    }
}

/// Display OsRelease in the format of an os-release file.
impl fmt::Display for OsRelease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (key, value) in &self.0 {
            writeln!(f, "{}={}", key, value)?
        }
        Ok(())
    }
}
