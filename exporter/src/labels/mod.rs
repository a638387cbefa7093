//! Label resolution
//!
//! A [`LabelSchema`] is compiled once per namespace. It fixes the label names
//! and, slot for slot, where each value comes from:
//!
//! ```text
//! method, status, [request_uri], static labels..., relabel targets...
//! ```
//!
//! Metric vectors are registered with [`LabelSchema::names`], and every line is
//! resolved through the same slots, so a resolved vector always has the
//! registered arity.

pub mod relabel;
pub mod route;

use crate::config::NamespaceConfig;
use crate::error::{ExporterError, Result};
use crate::format::Fields;
use std::collections::HashSet;

pub use relabel::{OTHER, Relabeler};
pub use route::RouteMatcher;

pub const METHOD_LABEL: &str = "method";
pub const STATUS_LABEL: &str = "status";
pub const ROUTE_LABEL: &str = "request_uri";

/// Method value when the request field is absent or empty
pub const UNKNOWN_METHOD: &str = "UNKNOWN";
/// Status value when the status field is absent
pub const UNKNOWN_STATUS: &str = "0";

const REQUEST_FIELD: &str = "request";
const STATUS_FIELD: &str = "status";

/// Where a label value comes from
#[derive(Debug, Clone)]
enum Slot {
    Method,
    Status,
    Route,
    Static(String),
    Relabel(Relabeler),
}

/// Label names and value sources for one namespace
#[derive(Debug, Clone)]
pub struct LabelSchema {
    names: Vec<String>,
    slots: Vec<Slot>,
    routes: RouteMatcher,
}

impl LabelSchema {
    /// Compile the schema for a namespace
    ///
    /// # Errors
    /// Returns `ExporterError::Schema` for invalid or duplicate label names
    /// and for route patterns that do not compile.
    pub fn compile(cfg: &NamespaceConfig) -> Result<Self> {
        let schema_err = |message: String| ExporterError::Schema {
            namespace: cfg.name.clone(),
            message,
        };

        let routes = RouteMatcher::from_config(&cfg.routes)
            .map_err(|e| schema_err(format!("invalid route pattern: {e}")))?;

        let mut builder = SchemaBuilder::default();
        builder.push(METHOD_LABEL, Slot::Method);
        builder.push(STATUS_LABEL, Slot::Status);
        if !routes.is_empty() {
            builder.push(ROUTE_LABEL, Slot::Route);
        }
        for (name, value) in &cfg.labels {
            builder.push(name, Slot::Static(value.clone()));
        }
        for relabel in &cfg.relabel_configs {
            if relabel.from.is_empty() {
                return Err(schema_err(format!(
                    "relabel target '{}' has no source field",
                    relabel.target_label
                )));
            }
            builder.push(&relabel.target_label, Slot::Relabel(relabel.into()));
        }

        let (names, slots) = builder.finish().map_err(schema_err)?;
        Ok(Self {
            names,
            slots,
            routes,
        })
    }

    /// Label names in registration order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of labels on every metric of the namespace
    pub fn arity(&self) -> usize {
        self.names.len()
    }

    pub fn has_routes(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Build the label vector for one parsed line
    ///
    /// Every slot is computed from this line alone; nothing carries over
    /// from previously resolved lines.
    pub fn resolve(&self, fields: &Fields<'_>) -> LabelValues {
        let request = RequestLine::from_field(fields.get(REQUEST_FIELD).ok());

        let values = self
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Method => request.method.unwrap_or(UNKNOWN_METHOD).to_string(),
                Slot::Status => fields
                    .get(STATUS_FIELD)
                    .unwrap_or(UNKNOWN_STATUS)
                    .to_string(),
                Slot::Route => request
                    .path
                    .and_then(|path| self.routes.classify(path))
                    .unwrap_or_default()
                    .to_string(),
                Slot::Static(value) => value.clone(),
                Slot::Relabel(relabeler) => relabeler.resolve(fields).to_string(),
            })
            .collect();

        LabelValues(values)
    }
}

/// Collects named slots and checks the resulting names
#[derive(Default)]
struct SchemaBuilder {
    names: Vec<String>,
    slots: Vec<Slot>,
}

impl SchemaBuilder {
    fn push(&mut self, name: &str, slot: Slot) {
        self.names.push(name.to_string());
        self.slots.push(slot);
    }

    fn finish(self) -> std::result::Result<(Vec<String>, Vec<Slot>), String> {
        let mut seen = HashSet::new();
        for name in &self.names {
            if !is_valid_label_name(name) {
                return Err(format!("invalid label name '{name}'"));
            }
            if !seen.insert(name.as_str()) {
                return Err(format!("duplicate label name '{name}'"));
            }
        }
        Ok((self.names, self.slots))
    }
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    first_ok && !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Method and path tokens of a `$request` value
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RequestLine<'a> {
    method: Option<&'a str>,
    path: Option<&'a str>,
}

impl<'a> RequestLine<'a> {
    fn from_field(request: Option<&'a str>) -> Self {
        let mut tokens = request.unwrap_or_default().split_whitespace();
        Self {
            method: tokens.next(),
            path: tokens.next(),
        }
    }
}

/// Ordered label values aligned with [`LabelSchema::names`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelValues(Vec<String>);

impl LabelValues {
    pub fn as_strs(&self) -> Vec<&str> {
        self.0.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }
}

impl From<Vec<String>> for LabelValues {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}
