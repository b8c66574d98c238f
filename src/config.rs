//! Hierarchical configuration nodes.
//!
//! A [`ConfigNode`] describes both the extraction schema (which queries to run
//! at which level) and the retrieval settings (batch size, data source, ...).
//! Nodes are loaded from YAML once per retrieval and are immutable afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use thiserror::Error;

/// Reserved sub-node holding field-name -> query-expression pairs.
pub const QUERY_NODE: &str = "_query";

/// Reserved sub-node holding field-name -> script-body pairs.
pub const SCRIPT_NODE: &str = "_script";

/// Reserved sub-node describing occurrence-level (per detail row) fields.
pub const OCCURRENCE_NODE: &str = "_occurrence";

/// Sub-node whose literals are exposed to placeholder substitution.
pub const PROPERTIES_NODE: &str = "properties";

/// Errors raised while loading or reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration root must be a mapping")]
    NotAMapping,

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required key '{0}'")]
    Missing(String),
}

/// A value stored under a configuration key.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// A literal string (or a query expression, which is also a string)
    Literal(String),
    /// A nested node
    Node(ConfigNode),
}

/// Hierarchical, order-preserving key -> (literal | node) store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigNode {
    entries: IndexMap<String, ConfigValue>,
    base_dir: Option<PathBuf>,
}

impl ConfigNode {
    /// Create an empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    ///
    /// The directory containing the file is remembered and exposed to
    /// placeholder substitution as `config.dir`.
    ///
    /// # Errors
    /// Returns error if the file can't be read or is not a YAML mapping
    ///
    /// # Example
    /// ```ignore
    /// use course_scraper::ConfigNode;
    ///
    /// let config = ConfigNode::load_from_file("config/university.yaml")?;
    /// let batch = config.get("batch-size", "unbounded");
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut node = Self::from_yaml_str(&contents)?;
        node.base_dir = Some(config_dir(path));

        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(node)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let yaml: YamlValue = serde_yaml::from_str(contents)?;
        Self::from_yaml_value(yaml)
    }

    /// Convert an already-parsed YAML value.
    ///
    /// Mappings become nested nodes, sequences become nodes keyed by index
    /// and every scalar becomes a literal string.
    pub fn from_yaml_value(value: YamlValue) -> Result<Self, ConfigError> {
        match value {
            YamlValue::Null => Ok(Self::new()),
            YamlValue::Mapping(_) | YamlValue::Sequence(_) | YamlValue::Tagged(_) => {
                match convert(value) {
                    ConfigValue::Node(node) => Ok(node),
                    ConfigValue::Literal(_) => Err(ConfigError::NotAMapping),
                }
            }
            _ => Err(ConfigError::NotAMapping),
        }
    }

    /// Builder: add a literal entry.
    pub fn with_literal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert_literal(key, value);
        self
    }

    /// Builder: add a nested node.
    pub fn with_node(mut self, key: impl Into<String>, node: ConfigNode) -> Self {
        self.insert_node(key, node);
        self
    }

    pub fn insert_literal(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into(), ConfigValue::Literal(value.into()));
    }

    pub fn insert_node(&mut self, key: impl Into<String>, node: ConfigNode) {
        self.entries.insert(key.into(), ConfigValue::Node(node));
    }

    /// Get a literal by (possibly dotted) key, falling back to `default`.
    pub fn get<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.literal(key).unwrap_or(default)
    }

    /// Get a literal by (possibly dotted) key.
    ///
    /// An exact key match wins; otherwise the key is split at each `.` and
    /// walked through nested nodes, so `source.charset` finds both
    /// `{"source.charset": ..}` and `{"source": {"charset": ..}}`.
    pub fn literal(&self, key: &str) -> Option<&str> {
        match self.lookup(key)? {
            ConfigValue::Literal(value) => Some(value.as_str()),
            ConfigValue::Node(_) => None,
        }
    }

    /// Get a child node by (possibly dotted) name.
    pub fn node(&self, child: &str) -> Option<&ConfigNode> {
        match self.lookup(child)? {
            ConfigValue::Node(node) => Some(node),
            ConfigValue::Literal(_) => None,
        }
    }

    /// Raw value under a key.
    pub fn value(&self, key: &str) -> Option<&ConfigValue> {
        self.lookup(key)
    }

    /// Keys of this node in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries of this node in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Directory of the file this node was loaded from, if any.
    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    pub fn set_base_dir(&mut self, dir: impl Into<PathBuf>) {
        self.base_dir = Some(dir.into());
    }

    /// Parse a literal into `T`.
    ///
    /// Returns `Ok(None)` when the key is absent.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.literal(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("'{}': {}", raw, e),
                }),
        }
    }

    /// Parse a positive size; `0`, `unbounded` and absence mean "no bound".
    pub fn get_bound(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        match self.literal(key).map(str::trim) {
            None | Some("") | Some("unbounded") => Ok(None),
            Some(_) => Ok(self.parse::<usize>(key)?.filter(|n| *n > 0)),
        }
    }

    /// Parse a boolean flag (`true`/`false`/`yes`/`no`/`1`/`0`).
    pub fn get_flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.literal(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("'{}' is not a boolean", v),
                }),
            },
        }
    }

    /// Collect the numbered `prefix.N.name` / `prefix.N.value` pairs
    /// (e.g. `param.0.name`, `header.1.value`) in index order.
    pub fn indexed_pairs(&self, prefix: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut index = 0;
        loop {
            let name = self.literal(&format!("{}.{}.name", prefix, index));
            let value = self.literal(&format!("{}.{}.value", prefix, index));
            match (name, value) {
                (Some(name), value) => {
                    pairs.push((name.to_string(), value.unwrap_or("").to_string()))
                }
                (None, _) => break,
            }
            index += 1;
        }
        pairs
    }

    fn lookup(&self, key: &str) -> Option<&ConfigValue> {
        if let Some(value) = self.entries.get(key) {
            return Some(value);
        }

        for (split, _) in key.match_indices('.') {
            let (head, rest) = (&key[..split], &key[split + 1..]);
            if let Some(ConfigValue::Node(child)) = self.entries.get(head) {
                if let Some(found) = child.lookup(rest) {
                    return Some(found);
                }
            }
        }
        None
    }
}

/// Absolute directory of a configuration file; a bare file name lives in `.`.
fn config_dir(path: &Path) -> PathBuf {
    if let Some(dir) = path.canonicalize().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        return dir;
    }
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn convert(value: YamlValue) -> ConfigValue {
    match value {
        YamlValue::Null => ConfigValue::Literal(String::new()),
        YamlValue::Bool(b) => ConfigValue::Literal(b.to_string()),
        YamlValue::Number(n) => ConfigValue::Literal(n.to_string()),
        YamlValue::String(s) => ConfigValue::Literal(s),
        YamlValue::Sequence(items) => {
            let mut node = ConfigNode::new();
            for (index, item) in items.into_iter().enumerate() {
                node.entries.insert(index.to_string(), convert(item));
            }
            ConfigValue::Node(node)
        }
        YamlValue::Mapping(map) => {
            let mut node = ConfigNode::new();
            for (key, item) in map {
                node.entries.insert(key_to_string(key), convert(item));
            }
            ConfigValue::Node(node)
        }
        YamlValue::Tagged(tagged) => convert(tagged.value),
    }
}

fn key_to_string(key: YamlValue) -> String {
    match key {
        YamlValue::String(s) => s,
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
batch-size: 2
query-all: "//course/@id"
source:
  type: file
  charset: UTF-8
param:
  - name: term
    value: "${term}"
  - name: dept
    value: CS
_query:
  name: "./name/text()"
  sections: "./section"
sections:
  _query:
    time: "./time/text()"
"#;

    #[test]
    fn test_load_nested_and_dotted_keys() {
        let config = ConfigNode::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.get("query-all", ""), "//course/@id");
        assert_eq!(config.get("source.charset", "UTF-8"), "UTF-8");
        assert_eq!(config.get("source.missing", "fallback"), "fallback");
        assert_eq!(config.get_bound("batch-size").unwrap(), Some(2));
    }

    #[test]
    fn test_exact_dotted_key_wins() {
        let config = ConfigNode::new()
            .with_literal("source.charset", "latin1")
            .with_node("source", ConfigNode::new().with_literal("charset", "utf-8"));

        assert_eq!(config.literal("source.charset"), Some("latin1"));
    }

    #[test]
    fn test_keys_preserve_order() {
        let config = ConfigNode::from_yaml_str(SAMPLE).unwrap();
        let query = config.node(QUERY_NODE).unwrap();

        let keys: Vec<&str> = query.keys().collect();
        assert_eq!(keys, vec!["name", "sections"]);
    }

    #[test]
    fn test_sequences_become_indexed_nodes() {
        let config = ConfigNode::from_yaml_str(SAMPLE).unwrap();

        let params = config.indexed_pairs("param");
        assert_eq!(
            params,
            vec![
                ("term".to_string(), "${term}".to_string()),
                ("dept".to_string(), "CS".to_string())
            ]
        );
    }

    #[test]
    fn test_invalid_batch_size() {
        let config = ConfigNode::new().with_literal("batch-size", "lots");
        assert!(matches!(
            config.get_bound("batch-size"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unbounded_batch_size() {
        let config = ConfigNode::new().with_literal("batch-size", "0");
        assert_eq!(config.get_bound("batch-size").unwrap(), None);
        assert_eq!(ConfigNode::new().get_bound("batch-size").unwrap(), None);
    }

    #[test]
    fn test_scalar_root_is_rejected() {
        assert!(matches!(
            ConfigNode::from_yaml_str("just a string"),
            Err(ConfigError::NotAMapping)
        ));
    }

    #[test]
    fn test_load_from_file_remembers_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ConfigNode::load_from_file(&path).unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(config.base_dir(), Some(expected.as_path()));
    }

    #[test]
    fn test_flags() {
        let config = ConfigNode::new()
            .with_literal("combine-rows", "yes")
            .with_literal("broken", "maybe");

        assert!(config.get_flag("combine-rows", false).unwrap());
        assert!(!config.get_flag("absent", false).unwrap());
        assert!(config.get_flag("broken", false).is_err());
    }
}
