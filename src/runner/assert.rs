use crate::error::{DazzleError, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Which output stream an assertion inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A check evaluated against the result of a test command
#[derive(Debug, Clone)]
pub enum Assertion {
    StatusEq(i32),
    StatusNe(i32),
    Contains(Stream, String),
    Equals(Stream, String),
    Matches(Stream, Regex),
    Empty(Stream),
}

impl PartialEq for Assertion {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

fn status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^status\s*(==|!=)\s*(-?\d+)$").expect("status pattern is valid")
    })
}

fn stream_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^(stdout|stderr)\s+(?:(empty)|(contains|==|matches)\s+"((?:[^"\\]|\\.)*)")$"#)
            .expect("stream pattern is valid")
    })
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl FromStr for Assertion {
    type Err = DazzleError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(caps) = status_pattern().captures(s) {
            let code: i32 = caps[2]
                .parse()
                .map_err(|e| DazzleError::configuration(s, e))?;
            return Ok(if &caps[1] == "==" {
                Assertion::StatusEq(code)
            } else {
                Assertion::StatusNe(code)
            });
        }

        if let Some(caps) = stream_pattern().captures(s) {
            let stream = if &caps[1] == "stdout" {
                Stream::Stdout
            } else {
                Stream::Stderr
            };
            if caps.get(2).is_some() {
                return Ok(Assertion::Empty(stream));
            }
            let operand = unescape(&caps[4]);
            return match &caps[3] {
                "contains" => Ok(Assertion::Contains(stream, operand)),
                "==" => Ok(Assertion::Equals(stream, operand)),
                _ => Regex::new(&operand)
                    .map(|re| Assertion::Matches(stream, re))
                    .map_err(|e| DazzleError::configuration(s, e)),
            };
        }

        Err(DazzleError::configuration(
            s,
            "unrecognised assertion (expected `status == N`, `status != N`, \
             `stdout|stderr contains|==|matches \"...\"` or `stdout|stderr empty`)",
        ))
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assertion::StatusEq(code) => write!(f, "status == {}", code),
            Assertion::StatusNe(code) => write!(f, "status != {}", code),
            Assertion::Contains(stream, text) => write!(f, "{} contains {:?}", stream, text),
            Assertion::Equals(stream, text) => write!(f, "{} == {:?}", stream, text),
            Assertion::Matches(stream, re) => write!(f, "{} matches {:?}", stream, re.as_str()),
            Assertion::Empty(stream) => write!(f, "{} empty", stream),
        }
    }
}

impl Assertion {
    pub fn check(&self, status: i32, stdout: &str, stderr: &str) -> bool {
        let select = |stream: &Stream| match stream {
            Stream::Stdout => stdout,
            Stream::Stderr => stderr,
        };
        match self {
            Assertion::StatusEq(code) => status == *code,
            Assertion::StatusNe(code) => status != *code,
            Assertion::Contains(stream, text) => select(stream).contains(text.as_str()),
            // trailing newlines are what echo adds, not what the author means
            Assertion::Equals(stream, text) => select(stream).trim_end_matches('\n') == text,
            Assertion::Matches(stream, re) => re.is_match(select(stream)),
            Assertion::Empty(stream) => select(stream).trim().is_empty(),
        }
    }
}
