//! `${name}` placeholder substitution over layered variable sources.
//!
//! Sources are consulted in priority order and the first one that knows a
//! name wins. Substituted values are rescanned, so a property may refer to
//! another property; self-reference is reported instead of looping.

use std::collections::HashMap;
use std::path::MAIN_SEPARATOR;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

use crate::config::{ConfigNode, ConfigValue, PROPERTIES_NODE};

/// Local variables handed down through an extraction.
pub type Variables = HashMap<String, String>;

/// Maximum nesting of placeholder expansion.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstitutionError {
    #[error("cyclic placeholder reference: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("placeholder nesting too deep while resolving '{0}'")]
    TooDeep(String),
}

/// One named lookup consulted during substitution.
#[derive(Debug, Clone)]
pub enum VariableSource {
    /// Caller-supplied map
    Local(Variables),
    /// Configuration-relative properties
    Properties(Variables),
    /// Process environment
    Environment,
    /// Host facts such as `os.name` or `user.home`
    System,
}

impl VariableSource {
    /// Build the properties source for a configuration.
    ///
    /// Every literal under the `properties` sub-node is exposed by its
    /// dotted path, plus `config.dir` when the configuration came from a file.
    pub fn properties(config: &ConfigNode) -> Self {
        let mut values = Variables::new();
        if let Some(props) = config.node(PROPERTIES_NODE) {
            flatten_into(props, "", &mut values);
        }
        if let Some(dir) = config.base_dir() {
            values.insert("config.dir".to_string(), dir.display().to_string());
        }
        VariableSource::Properties(values)
    }

    pub fn name(&self) -> &'static str {
        match self {
            VariableSource::Local(_) => "local",
            VariableSource::Properties(_) => "properties",
            VariableSource::Environment => "environment",
            VariableSource::System => "system",
        }
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        match self {
            VariableSource::Local(values) | VariableSource::Properties(values) => {
                values.get(name).cloned()
            }
            VariableSource::Environment => std::env::var(name).ok(),
            VariableSource::System => system_property(name),
        }
    }
}

fn flatten_into(node: &ConfigNode, prefix: &str, out: &mut Variables) {
    for (key, value) in node.entries() {
        let path = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            ConfigValue::Literal(literal) => {
                out.insert(path, literal.clone());
            }
            ConfigValue::Node(child) => flatten_into(child, &path, out),
        }
    }
}

fn system_property(name: &str) -> Option<String> {
    match name {
        "os.name" => Some(std::env::consts::OS.to_string()),
        "os.arch" => Some(std::env::consts::ARCH.to_string()),
        "file.separator" => Some(MAIN_SEPARATOR.to_string()),
        "path.separator" => Some(if cfg!(windows) { ";" } else { ":" }.to_string()),
        "line.separator" => Some(if cfg!(windows) { "\r\n" } else { "\n" }.to_string()),
        "user.dir" => std::env::current_dir()
            .ok()
            .map(|dir| dir.display().to_string()),
        "user.home" => std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .ok(),
        "user.name" => std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok(),
        "tmp.dir" => Some(std::env::temp_dir().display().to_string()),
        _ => None,
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(\$)?\{([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern is valid")
    })
}

/// Resolve `template` against an ordered list of sources.
///
/// Unknown placeholders are left untouched and `$${name}` renders as a
/// literal `${name}`.
///
/// # Example
/// ```
/// use course_scraper::substitution::{resolve, VariableSource, Variables};
///
/// let mut local = Variables::new();
/// local.insert("term".to_string(), "2024FA".to_string());
///
/// let out = resolve("catalog-${term}.xml", &[VariableSource::Local(local)]).unwrap();
/// assert_eq!(out, "catalog-2024FA.xml");
/// ```
pub fn resolve(template: &str, sources: &[VariableSource]) -> Result<String, SubstitutionError> {
    let lookup = |name: &str| sources.iter().find_map(|source| source.lookup(name));
    expand(template, &lookup, &mut Vec::new())
}

fn expand(
    template: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    stack: &mut Vec<String>,
) -> Result<String, SubstitutionError> {
    if !template.contains("${") {
        return Ok(template.to_string());
    }
    if stack.len() >= MAX_DEPTH {
        return Err(SubstitutionError::TooDeep(template.to_string()));
    }

    let mut failure = None;
    let output = placeholder_pattern().replace_all(template, |caps: &Captures| {
        let name = &caps[2];
        if caps.get(1).is_some() {
            return format!("${{{}}}", name);
        }
        if failure.is_some() {
            return caps[0].to_string();
        }
        if stack.iter().any(|seen| seen == name) {
            let mut chain = stack.clone();
            chain.push(name.to_string());
            failure = Some(SubstitutionError::Cycle(chain));
            return caps[0].to_string();
        }
        match lookup(name) {
            Some(value) => {
                stack.push(name.to_string());
                let expanded = expand(&value, lookup, stack);
                stack.pop();
                match expanded {
                    Ok(expanded) => expanded,
                    Err(e) => {
                        failure = Some(e);
                        caps[0].to_string()
                    }
                }
            }
            None => caps[0].to_string(),
        }
    });

    match failure {
        Some(e) => Err(e),
        None => Ok(output.into_owned()),
    }
}

/// Layered substitution engine bound to one configuration.
///
/// Local variables passed to [`Substitutor::resolve`] take priority over
/// the configured sources (properties, environment, system).
#[derive(Debug, Clone)]
pub struct Substitutor {
    sources: Vec<VariableSource>,
}

impl Substitutor {
    pub fn new(sources: Vec<VariableSource>) -> Self {
        Self { sources }
    }

    /// Standard layering for a configuration: properties, environment, system.
    pub fn for_config(config: &ConfigNode) -> Self {
        Self::new(vec![
            VariableSource::properties(config),
            VariableSource::Environment,
            VariableSource::System,
        ])
    }

    pub fn sources(&self) -> &[VariableSource] {
        &self.sources
    }

    /// Look a single name up, local variables first.
    pub fn lookup(&self, name: &str, local: &Variables) -> Option<String> {
        local
            .get(name)
            .cloned()
            .or_else(|| self.sources.iter().find_map(|source| source.lookup(name)))
    }

    pub fn resolve(&self, template: &str, local: &Variables) -> Result<String, SubstitutionError> {
        let lookup = |name: &str| self.lookup(name, local);
        expand(template, &lookup, &mut Vec::new())
    }
}
