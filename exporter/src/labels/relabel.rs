//! Field relabeling
//!
//! Copies a parsed field into a label. With a whitelist configured, values
//! outside it collapse to [`OTHER`] so label cardinality stays bounded.

use crate::config::RelabelConfig;
use crate::format::Fields;
use std::collections::HashSet;

/// Value used for fields outside the whitelist
pub const OTHER: &str = "other";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relabeler {
    source: String,
    target: String,
    whitelist: Option<HashSet<String>>,
}

impl Relabeler {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            whitelist: None,
        }
    }

    /// Restrict values to `allowed`; an empty list disables the whitelist
    pub fn whitelist<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = allowed.into_iter().map(Into::into).collect();
        self.whitelist = (!set.is_empty()).then_some(set);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Label value for a raw field value (`None` when the field is absent)
    pub fn apply<'a>(&self, value: Option<&'a str>) -> &'a str {
        match (value, &self.whitelist) {
            (None, _) => "",
            (Some(v), Some(allowed)) if !allowed.contains(v) => OTHER,
            (Some(v), _) => v,
        }
    }

    /// Label value for this rule's source field
    pub fn resolve<'a>(&self, fields: &Fields<'a>) -> &'a str {
        self.apply(fields.get(&self.source).ok())
    }
}

impl From<&RelabelConfig> for Relabeler {
    fn from(cfg: &RelabelConfig) -> Self {
        Relabeler::new(cfg.from.as_str(), cfg.target_label.as_str())
            .whitelist(cfg.whitelist.iter().cloned())
    }
}
