//! Document query tool.
//!
//! Runs path queries against extraction targets and flattens nested,
//! configuration-described structures into dotted field paths.

pub mod eval;
pub mod parser;

use indexmap::IndexMap;
use thiserror::Error;

use crate::config::{ConfigNode, ConfigValue, QUERY_NODE};
use crate::document::Target;
use crate::extraction::FieldPath;
use crate::script::ScriptEngine;
use crate::substitution::{SubstitutionError, Substitutor, Variables};

pub use parser::{parse, Query};

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("invalid query '{expr}': {message}")]
    Syntax { expr: String, message: String },

    #[error("query placeholder resolution failed: {0}")]
    Substitution(#[from] SubstitutionError),

    #[error("'{key}' under _query must be a query string, found a nested node")]
    NotAQuery { key: String },
}

/// Destination for flattened `field path -> value` pairs.
pub trait FieldSink {
    fn record(&mut self, path: &FieldPath, value: String);
}

impl FieldSink for IndexMap<String, String> {
    fn record(&mut self, path: &FieldPath, value: String) {
        self.insert(path.to_string(), value);
    }
}

impl FieldSink for std::collections::BTreeMap<String, String> {
    fn record(&mut self, path: &FieldPath, value: String) {
        self.insert(path.to_string(), value);
    }
}

/// Evaluates queries and performs bulk recursive field resolution.
#[derive(Debug, Clone)]
pub struct QueryTool {
    substitutor: Substitutor,
    scripts: ScriptEngine,
}

impl QueryTool {
    pub fn new(substitutor: Substitutor, scripts: ScriptEngine) -> Self {
        Self {
            substitutor,
            scripts,
        }
    }

    pub fn substitutor(&self) -> &Substitutor {
        &self.substitutor
    }

    pub fn scripts(&self) -> &ScriptEngine {
        &self.scripts
    }

    /// Run `expr` against `target`, returning matches in document order.
    ///
    /// Placeholders in `expr` are resolved against `vars` (and the
    /// configured sources) before parsing.
    pub fn query(&self, target: &Target, expr: &str, vars: &Variables) -> Result<Vec<Target>, QueryError> {
        let resolved = self.substitutor.resolve(expr, vars)?;
        let query = parser::parse(&resolved)?;
        let matches = eval::evaluate(target.document(), &query, target.node());

        tracing::trace!("Query '{}' matched {} node(s)", resolved, matches.len());
        Ok(matches.into_iter().map(|id| target.at(id)).collect())
    }

    /// Resolve every query of `level` into a fresh, insertion-ordered map.
    pub fn resolve(
        &self,
        target: &Target,
        level: &ConfigNode,
        vars: &Variables,
    ) -> Result<IndexMap<String, String>, QueryError> {
        let mut fields = IndexMap::new();
        self.resolve_into(target, level, &FieldPath::root(), vars, &mut fields)?;
        Ok(fields)
    }

    /// Resolve every query of `level` below `base`, writing into `sink`.
    ///
    /// For each key of the level's `_query` sub-node the match count is
    /// recorded at `base.key`. Each match `i` then either descends into the
    /// sibling sub-node named `key` (when it is non-empty) with base
    /// `base.key.i`, or is recorded as the leaf `base.key.i = text`, passed
    /// through `_script.key` when the level defines one.
    pub fn resolve_into(
        &self,
        target: &Target,
        level: &ConfigNode,
        base: &FieldPath,
        vars: &Variables,
        sink: &mut dyn FieldSink,
    ) -> Result<(), QueryError> {
        let Some(queries) = level.node(QUERY_NODE) else {
            return Ok(());
        };

        for (key, value) in queries.entries() {
            let expr = match value {
                ConfigValue::Literal(expr) => expr,
                ConfigValue::Node(_) => {
                    return Err(QueryError::NotAQuery {
                        key: key.to_string(),
                    })
                }
            };

            let matches = self.query(target, expr, vars)?;
            let path = base.child(key);
            sink.record(&path, matches.len().to_string());

            let nested = level.node(key).filter(|sub| !sub.is_empty());
            for (index, matched) in matches.iter().enumerate() {
                let item = path.index(index);
                match nested {
                    Some(sub) => self.resolve_into(matched, sub, &item, vars, sink)?,
                    None => {
                        let text = matched.text();
                        let value = self.scripts.apply(level, key, &text, vars);
                        sink.record(&item, value);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SCRIPT_NODE;
    use crate::document::Document;
    use crate::script::ScriptBackend;
    use crate::substitution::VariableSource;
    use std::sync::Arc;

    const CATALOG: &str = r#"
<catalog>
  <course id="CS101" credits="3">
    <name>Intro to CS</name>
    <section crn="11"><time>MWF 9:00</time><room>A1</room></section>
    <section crn="12"><time>TTh 13:00</time></section>
  </course>
  <course id="CS102" credits="4">
    <name>Data Structures</name>
    <section crn="21" cancelled="true"><time>MW 10:00</time></section>
  </course>
  <course id="MATH200" credits="3"><name>Linear Algebra</name></course>
</catalog>"#;

    fn tool() -> QueryTool {
        let substitutor = Substitutor::new(vec![VariableSource::System]);
        let scripts = ScriptEngine::new(ScriptBackend::Rhai, substitutor.clone());
        QueryTool::new(substitutor, scripts)
    }

    fn root() -> Target {
        Target::root(Arc::new(Document::parse_str(CATALOG).unwrap()))
    }

    fn texts(targets: &[Target]) -> Vec<String> {
        targets.iter().map(Target::text).collect()
    }

    #[test]
    fn test_attribute_query() {
        let found = tool().query(&root(), "//course/@id", &Variables::new()).unwrap();
        assert_eq!(texts(&found), vec!["CS101", "CS102", "MATH200"]);
    }

    #[test]
    fn test_placeholder_in_query() {
        let mut vars = Variables::new();
        vars.insert("course.id".to_string(), "CS102".to_string());

        let found = tool()
            .query(&root(), "//course[@id='${course.id}']/name/text()", &vars)
            .unwrap();
        assert_eq!(texts(&found), vec!["Data Structures"]);
    }

    #[test]
    fn test_positional_and_boolean_predicates() {
        let tool = tool();
        let vars = Variables::new();

        let first = tool.query(&root(), "//section[1]/@crn", &vars).unwrap();
        assert_eq!(texts(&first), vec!["11", "21"]);

        let last = tool.query(&root(), "//course[last()]/name", &vars).unwrap();
        assert_eq!(texts(&last), vec!["Linear Algebra"]);

        let open = tool
            .query(&root(), "//section[not(@cancelled) and room]/@crn", &vars)
            .unwrap();
        assert_eq!(texts(&open), vec!["11"]);

        let heavy = tool.query(&root(), "//course[@credits >= 4]/@id", &vars).unwrap();
        assert_eq!(texts(&heavy), vec!["CS102"]);

        let cs = tool
            .query(&root(), "//course[starts-with(@id, 'CS') and contains(name, 'Data')]/@id", &vars)
            .unwrap();
        assert_eq!(texts(&cs), vec!["CS102"]);
    }

    #[test]
    fn test_union_is_document_ordered() {
        let found = tool()
            .query(&root(), "//course[@id='MATH200']/name | //course[@id='CS101']/name", &Variables::new())
            .unwrap();
        assert_eq!(texts(&found), vec!["Intro to CS", "Linear Algebra"]);
    }

    #[test]
    fn test_parent_and_sibling_axes() {
        let tool = tool();
        let vars = Variables::new();

        let owners = tool.query(&root(), "//time[.='MW 10:00']/../../@id", &vars).unwrap();
        assert_eq!(texts(&owners), vec!["CS102"]);

        let next = tool
            .query(&root(), "//section[@crn='11']/following-sibling::section/@crn", &vars)
            .unwrap();
        assert_eq!(texts(&next), vec!["12"]);

        let ancestors = tool.query(&root(), "//room/ancestor::course/@id", &vars).unwrap();
        assert_eq!(texts(&ancestors), vec!["CS101"]);
    }

    #[test]
    fn test_relative_query_from_match() {
        let tool = tool();
        let vars = Variables::new();
        let course = tool.query(&root(), "//course[@id='CS101']", &vars).unwrap();

        let times = tool.query(&course[0], "./section/time/text()", &vars).unwrap();
        assert_eq!(texts(&times), vec!["MWF 9:00", "TTh 13:00"]);
    }

    #[test]
    fn test_resolve_flat_leaves_write_count_plus_values() {
        let level = ConfigNode::new().with_node(
            QUERY_NODE,
            ConfigNode::new().with_literal("names", "//course/name/text()"),
        );

        let fields = tool().resolve(&root(), &level, &Variables::new()).unwrap();

        assert_eq!(fields.len(), 4);
        assert_eq!(fields.get("names").map(String::as_str), Some("3"));
        assert_eq!(fields.get("names.0").map(String::as_str), Some("Intro to CS"));
        assert_eq!(fields.get("names.2").map(String::as_str), Some("Linear Algebra"));
    }

    #[test]
    fn test_leaf_values_match_mixed_content_text() {
        let doc = Document::parse_str(
            "<catalog>\n  <course><desc>Intro to <em>Computer</em> Science</desc></course>\n</catalog>",
        )
        .unwrap();
        let level = ConfigNode::new().with_node(
            QUERY_NODE,
            ConfigNode::new().with_literal("desc", "//desc"),
        );

        let fields = tool()
            .resolve(&Target::root(Arc::new(doc)), &level, &Variables::new())
            .unwrap();
        assert_eq!(fields["desc.0"], "Intro to Computer Science");
    }

    #[test]
    fn test_resolve_nested_levels() {
        let level = ConfigNode::from_yaml_str(
            r#"
_query:
  name: "./name/text()"
  sections: "./section"
sections:
  _query:
    crn: "@crn"
    time: "./time"
"#,
        )
        .unwrap();
        let course = tool()
            .query(&root(), "//course[@id='CS101']", &Variables::new())
            .unwrap();

        let fields = tool().resolve(&course[0], &level, &Variables::new()).unwrap();

        assert_eq!(fields["name"], "1");
        assert_eq!(fields["name.0"], "Intro to CS");
        assert_eq!(fields["sections"], "2");
        assert_eq!(fields["sections.0.crn.0"], "11");
        assert_eq!(fields["sections.1.time"], "1");
        assert_eq!(fields["sections.1.time.0"], "TTh 13:00");
    }

    #[test]
    fn test_resolve_records_zero_count_for_missing_field() {
        let level = ConfigNode::new().with_node(
            QUERY_NODE,
            ConfigNode::new().with_literal("sections", "./section"),
        );
        let course = tool()
            .query(&root(), "//course[@id='MATH200']", &Variables::new())
            .unwrap();

        let fields = tool().resolve(&course[0], &level, &Variables::new()).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["sections"], "0");
    }

    #[test]
    fn test_resolve_applies_field_scripts() {
        let level = ConfigNode::new()
            .with_node(QUERY_NODE, ConfigNode::new().with_literal("credits", "@credits"))
            .with_node(
                SCRIPT_NODE,
                ConfigNode::new().with_literal("credits", "source + \" cr\""),
            );
        let course = tool()
            .query(&root(), "//course[@id='CS102']", &Variables::new())
            .unwrap();

        let fields = tool().resolve(&course[0], &level, &Variables::new()).unwrap();
        assert_eq!(fields["credits.0"], "4 cr");
    }

    #[test]
    fn test_invalid_query_is_reported() {
        let err = tool()
            .query(&root(), "//course[@id=", &Variables::new())
            .unwrap_err();
        assert!(matches!(err, QueryError::Syntax { .. }));
    }
}
