//! Accumulated engine options and their rendering into invocation arguments.
//!
//! Option names are not validated here. The engine owns the set of valid
//! names, so anything unknown is passed through and rejected engine-side.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::{GatewayError, GatewayResult};

pub const ROOT: &str = "root";
pub const TABLE_DEFINITIONS_ROOT: &str = "table-definitions-root";
pub const LOG_DIR: &str = "log-dir";
pub const QUERY_FILE: &str = "query-file";
pub const QUERY: &str = "query";
pub const TEST_QUERY_FILE: &str = "test-query-file";
pub const TEST_QUERY: &str = "test-query";
pub const NAME: &str = "name";
pub const SETUP_FILE: &str = "setup-file";
pub const SETUP_QUERIES: &str = "setup-queries";
pub const TABLE_FILE: &str = "table-file";
pub const TABLE_QUERIES: &str = "table-queries";
pub const PARAM_FILE: &str = "param-file";
pub const PARAM_QUERY: &str = "param-query";

/// Short name of the mandatory working-root argument.
pub(crate) const WORKING_ROOT_FLAG: &str = "r";

/// Value held by a single option name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Scalar(String),
    List(Vec<String>),
}

/// Ordered option set keyed by case-sensitive option name.
///
/// Keys iterate in the order they were first used; overwriting a key keeps
/// its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    entries: IndexMap<String, OptionValue>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any previous value of `name` with a scalar.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(name.into(), OptionValue::Scalar(value.into()));
    }

    /// Append `value` to the list bucket of `name`.
    ///
    /// A scalar already stored under `name` becomes the first list element.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let entry = self
            .entries
            .entry(name.into())
            .or_insert_with(|| OptionValue::List(Vec::new()));
        match entry {
            OptionValue::List(values) => values.push(value),
            OptionValue::Scalar(existing) => {
                let first = std::mem::take(existing);
                *entry = OptionValue::List(vec![first, value]);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.entries.get(name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Render every entry in key order, list values expanded in append order.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            match value {
                OptionValue::Scalar(value) => args.push(render_option(name, value)),
                OptionValue::List(values) => {
                    args.extend(values.iter().map(|value| render_option(name, value)))
                }
            }
        }
        args
    }
}

/// Render a single `name`/`value` pair as one invocation argument.
///
/// One-character names use `-x value`, longer names use `--name=value`.
pub fn render_option(name: &str, value: &str) -> String {
    if name.chars().count() == 1 {
        format!("-{name} {value}")
    } else {
        format!("--{name}={value}")
    }
}

/// Join path segments, refusing any non-leading segment that starts at a root.
///
/// `PathBuf::push` silently drops everything before a rooted segment, which
/// would produce a different path from the one the caller spelled out.
pub fn join_path<P: AsRef<Path>>(parts: &[P]) -> GatewayResult<PathBuf> {
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| GatewayError::config("path requires at least one segment"))?;

    let mut path = first.as_ref().to_path_buf();
    for part in rest {
        let part = part.as_ref();
        if part.has_root() || part.to_string_lossy().starts_with('/') {
            let joined: Vec<_> = parts
                .iter()
                .map(|part| part.as_ref().display().to_string())
                .collect();
            return Err(GatewayError::config(format!(
                "path part starts with slash, joining would discard earlier parts: {joined:?}"
            )));
        }
        path.push(part);
    }
    Ok(path)
}

pub(crate) fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
