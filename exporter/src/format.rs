//! Access log line parser
//!
//! Compiles an nginx-style `log_format` string into an anchored regex. Each
//! `$variable` becomes a named capture that runs up to the character
//! following it in the format, or up to the next space for a trailing
//! variable.
//!
//! ```
//! use nginxlog_exporter::format::LineParser;
//!
//! let parser = LineParser::new(r#"$remote_addr "$request" $status"#).unwrap();
//! let fields = parser.parse(r#"10.0.0.1 "GET / HTTP/1.1" 200"#).unwrap();
//! assert_eq!(fields.get("status").unwrap(), "200");
//! ```

use crate::error::{ExporterError, ParseError};
use regex::Regex;
use std::collections::HashMap;

/// Compiled line grammar for one namespace
#[derive(Debug, Clone)]
pub struct LineParser {
    format: String,
    re: Regex,
}

impl LineParser {
    /// Compile a format string
    ///
    /// # Errors
    /// Returns `ExporterError::Config` for duplicate variable names.
    pub fn new(format: &str) -> Result<Self, ExporterError> {
        let pattern = format_to_pattern(format);
        let re = Regex::new(&pattern).map_err(|e| {
            ExporterError::Config(format!("cannot compile format '{format}': {e}"))
        })?;

        Ok(Self {
            format: format.to_string(),
            re,
        })
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// Variable names declared by the format, in order
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.re.capture_names().flatten()
    }

    /// Extract all format variables from a line
    pub fn parse<'a>(&'a self, line: &'a str) -> Result<Fields<'a>, ParseError> {
        let caps = self.re.captures(line).ok_or_else(|| ParseError::NoMatch {
            format: self.format.clone(),
        })?;

        let values = self
            .re
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name, m.as_str())))
            .collect();

        Ok(Fields { values })
    }
}

fn format_to_pattern(format: &str) -> String {
    let mut pattern = String::with_capacity(format.len() * 2);
    pattern.push('^');

    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        let starts_variable = c == '$'
            && chars
                .peek()
                .is_some_and(|n| n.is_ascii_lowercase() || *n == '_');
        if !starts_variable {
            pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
            continue;
        }

        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_lowercase() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }

        let delimiter = chars.peek().copied().unwrap_or(' ');
        pattern.push_str("(?P<");
        pattern.push_str(&name);
        pattern.push_str(">[^");
        pattern.push_str(&regex::escape(delimiter.encode_utf8(&mut [0; 4])));
        pattern.push_str("]*)");
    }

    pattern
}

/// Field values of one parsed line, borrowed from the line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fields<'a> {
    values: HashMap<&'a str, &'a str>,
}

impl<'a> Fields<'a> {
    /// Raw value of a field
    pub fn get(&self, name: &str) -> Result<&'a str, ParseError> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| ParseError::MissingField(name.to_string()))
    }

    /// Numeric value of a field
    ///
    /// Fails if the field is absent or not a finite number (nginx writes
    /// `-` for unset values).
    pub fn float(&self, name: &str) -> Result<f64, ParseError> {
        let raw = self.get(name)?;
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError::NotNumeric {
                field: name.to_string(),
                value: raw.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
