//! Recursive extraction of a catalog into a [`Dataset`].
//!
//! A retrieval acquires the catalog through the configured data source,
//! discovers group keys with `query-all`, builds one sub-task per group
//! (running `query-single` to find the group's rows) and hands the tasks to
//! the [`BatchCoordinator`]. Each sub-task flattens the configured field
//! tree into the group's entry. A failing group is reported and never
//! stops its siblings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::batch::{BatchCoordinator, BatchError, BatchReport, Task, TaskFailure};
use crate::config::{ConfigError, ConfigNode, OCCURRENCE_NODE, PROPERTIES_NODE, QUERY_NODE, SCRIPT_NODE};
use crate::dataset::Dataset;
use crate::document::{Charset, Document, DocumentError, Target};
use crate::extraction::FieldPath;
use crate::query::{FieldSink, QueryError, QueryTool};
use crate::script::ScriptEngine;
use crate::source::{DataSource, SourceError, TeeSink};
use crate::substitution::{Substitutor, Variables};

/// Group discovery query, run against the document root.
pub const QUERY_ALL_KEY: &str = "query-all";
/// Per-group row query; may refer to the group key variable.
pub const QUERY_SINGLE_KEY: &str = "query-single";
/// Name the group key is bound under while a group is extracted.
pub const GROUP_VARIABLE_KEY: &str = "group-variable";
pub const DEFAULT_GROUP_VARIABLE: &str = "course.id";
/// Always bound to the group key, whatever `group-variable` says.
pub const GROUP_KEY_VAR: &str = "group.key";
/// `_script` entry post-processing discovered group keys.
pub const GROUP_KEY_SCRIPT: &str = "group-key";
/// Resolve record-level fields against all rows of a group at once.
pub const COMBINE_ROWS_KEY: &str = "combine-rows";
/// Variable bound to the current term by [`Retriever::retrieve_terms`].
pub const TERM_VAR: &str = "term";

const OCCURRENCE_FIELD: &str = "occurrence";
const GROUP_ELEMENT: &str = "group";
const SOURCE_KEYS: [&str; 4] = ["source", "file-uri-template", "file-path-template", "uri"];
/// Root sub-nodes holding settings; a record-level field may not share their names.
const SETTINGS_NODES: [&str; 7] = [
    "source",
    "param",
    "header",
    PROPERTIES_NODE,
    QUERY_NODE,
    SCRIPT_NODE,
    OCCURRENCE_NODE,
];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("configuration is missing '{0}'")]
    MissingSetting(String),

    #[error("record field '{0}' clashes with a settings node of the same name")]
    ReservedField(String),

    #[error("group '{key}' failed: {reason}")]
    GroupFailed { key: String, reason: String },

    #[error("extraction task panicked: {0}")]
    Panicked(String),
}

/// What happened during one retrieval.
#[derive(Debug, Clone, Default)]
pub struct RetrievalReport {
    /// Distinct group keys discovered
    pub groups: usize,
    /// Joined batches in submission order
    pub batches: Vec<BatchReport>,
    /// Groups whose sub-task could not be built
    pub skipped: Vec<TaskFailure>,
    /// Groups whose sub-task failed while running
    pub failed: Vec<TaskFailure>,
}

impl RetrievalReport {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(|b| b.size).collect()
    }

    pub fn succeeded(&self) -> usize {
        self.batches.iter().map(|b| b.succeeded.len()).sum()
    }

    /// Every discovered group was extracted.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Result of one retrieval: the dataset plus its report.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub dataset: Dataset,
    pub report: RetrievalReport,
}

/// Runs retrievals described by one configuration.
#[derive(Debug, Clone)]
pub struct Retriever {
    settings: Arc<ConfigNode>,
    tool: Arc<QueryTool>,
    coordinator: BatchCoordinator,
    source: Option<DataSource>,
    charset: Charset,
    group_variable: String,
    combine_rows: bool,
}

impl Retriever {
    /// Build a retriever and every engine it needs from `settings`.
    ///
    /// # Errors
    /// Fails when `query-all` or `query-single` is missing, when a
    /// record-level field is named after a settings node such as `source`,
    /// or when the source, script engine, batch or charset settings are
    /// invalid.
    pub fn new(settings: ConfigNode) -> Result<Self, ExtractionError> {
        for key in [QUERY_ALL_KEY, QUERY_SINGLE_KEY] {
            if settings.literal(key).is_none() {
                return Err(ExtractionError::MissingSetting(key.to_string()));
            }
        }
        if let Some(fields) = settings.node(QUERY_NODE) {
            if let Some(clash) = fields.keys().find(|key| SETTINGS_NODES.contains(key)) {
                return Err(ExtractionError::ReservedField(clash.to_string()));
            }
        }

        let substitutor = Substitutor::for_config(&settings);
        let scripts = ScriptEngine::from_config(&settings, substitutor.clone())?;
        let coordinator = BatchCoordinator::from_config(&settings)?;

        let source = if SOURCE_KEYS.iter().any(|key| settings.contains_key(key)) {
            Some(DataSource::from_config(&settings, substitutor.clone())?)
        } else {
            None
        };
        let charset: Charset = settings.get("source.charset", "utf-8").parse()?;

        Ok(Self {
            group_variable: settings
                .get(GROUP_VARIABLE_KEY, DEFAULT_GROUP_VARIABLE)
                .to_string(),
            combine_rows: settings.get_flag(COMBINE_ROWS_KEY, false)?,
            tool: Arc::new(QueryTool::new(substitutor, scripts)),
            settings: Arc::new(settings),
            coordinator,
            source,
            charset,
        })
    }

    pub fn settings(&self) -> &ConfigNode {
        &self.settings
    }

    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    pub fn source(&self) -> Option<&DataSource> {
        self.source.as_ref()
    }

    pub fn query_tool(&self) -> &QueryTool {
        &self.tool
    }

    /// Acquire the catalog and extract it.
    pub async fn retrieve(&self, vars: &Variables) -> Result<Retrieval, ExtractionError> {
        self.retrieve_with_tee(vars, None).await
    }

    /// Like [`retrieve`](Self::retrieve), copying the raw catalog to `tee`.
    ///
    /// The catalog is drained into memory before parsing starts, since the
    /// document arena needs the whole input. The pipe keeps the producer at
    /// most `pipe-capacity` bytes ahead of that drain; it does not overlap
    /// parsing with acquisition.
    pub async fn retrieve_with_tee(
        &self,
        vars: &Variables,
        tee: Option<TeeSink>,
    ) -> Result<Retrieval, ExtractionError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| ExtractionError::MissingSetting("source".to_string()))?;

        let bytes = source.open(vars, tee)?.read_all().await?;
        tracing::debug!("Acquired {} bytes of catalog data", bytes.len());

        let this = self.clone();
        let vars = vars.clone();
        tokio::task::spawn_blocking(move || {
            let document = Document::parse_bytes(&bytes, this.charset)?;
            this.extract(Arc::new(document), &vars)
        })
        .await
        .map_err(|e| ExtractionError::Panicked(e.to_string()))?
    }

    /// Run one retrieval per term, binding `term` for each.
    ///
    /// A failing term does not stop the others.
    pub async fn retrieve_terms(
        &self,
        terms: &[String],
        vars: &Variables,
    ) -> BTreeMap<String, Result<Retrieval, ExtractionError>> {
        let mut results = BTreeMap::new();
        for term in terms {
            let mut local = vars.clone();
            local.insert(TERM_VAR.to_string(), term.clone());

            let result = self.retrieve(&local).await;
            if let Err(e) = &result {
                tracing::error!("Retrieval for term {} failed: {}", term, e);
            }
            results.insert(term.clone(), result);
        }
        results
    }

    /// Extract an already parsed document.
    ///
    /// Blocks until every batch has joined. Must not be called from a
    /// thread of the retriever's own worker pool.
    pub fn extract(&self, document: Arc<Document>, vars: &Variables) -> Result<Retrieval, ExtractionError> {
        let root = Target::root(document);
        let keys = self.discover_groups(&root, vars)?;
        tracing::info!("Discovered {} group(s)", keys.len());

        let dataset = Dataset::new();
        let mut skipped = Vec::new();

        let tasks = keys.iter().map(|key| match self.build_task(&root, key, vars, &dataset) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!("Skipping group {}: {}", key, e);
                skipped.push(TaskFailure {
                    label: key.clone(),
                    reason: e.to_string(),
                });
                None
            }
        });
        let batches = self.coordinator.run(tasks);

        let failed: Vec<TaskFailure> = batches.iter().flat_map(|b| b.failed.iter().cloned()).collect();
        for failure in &failed {
            tracing::warn!("Group {} failed: {}", failure.label, failure.reason);
        }
        tracing::info!(
            "Extracted {} group(s) in {} batch(es), {} skipped, {} failed",
            dataset.len(),
            batches.len(),
            skipped.len(),
            failed.len()
        );

        Ok(Retrieval {
            dataset,
            report: RetrievalReport {
                groups: keys.len(),
                batches,
                skipped,
                failed,
            },
        })
    }

    /// Distinct, sorted group keys.
    pub fn discover_groups(&self, root: &Target, vars: &Variables) -> Result<Vec<String>, ExtractionError> {
        let query_all = self
            .settings
            .literal(QUERY_ALL_KEY)
            .ok_or_else(|| ExtractionError::MissingSetting(QUERY_ALL_KEY.to_string()))?;

        let keys: BTreeSet<String> = self
            .tool
            .query(root, query_all, vars)?
            .iter()
            .map(|found| {
                let text = found.text();
                self.tool
                    .scripts()
                    .apply(&self.settings, GROUP_KEY_SCRIPT, text.trim(), vars)
                    .trim()
                    .to_string()
            })
            .filter(|key| !key.is_empty())
            .collect();

        Ok(keys.into_iter().collect())
    }

    fn build_task(
        &self,
        root: &Target,
        key: &str,
        vars: &Variables,
        dataset: &Dataset,
    ) -> Result<Task<ExtractionError>, ExtractionError> {
        let mut local = vars.clone();
        local.insert(self.group_variable.clone(), key.to_string());
        local.insert(GROUP_KEY_VAR.to_string(), key.to_string());

        let query_single = self
            .settings
            .literal(QUERY_SINGLE_KEY)
            .ok_or_else(|| ExtractionError::MissingSetting(QUERY_SINGLE_KEY.to_string()))?;
        let rows = self.tool.query(root, query_single, &local)?;
        if rows.is_empty() {
            return Err(ExtractionError::GroupFailed {
                key: key.to_string(),
                reason: "query-single matched no rows".to_string(),
            });
        }

        let group = GroupTask {
            key: key.to_string(),
            rows,
            vars: local,
            settings: Arc::clone(&self.settings),
            tool: Arc::clone(&self.tool),
            dataset: dataset.clone(),
            combine_rows: self.combine_rows,
        };
        Ok(Task::new(key, move || group.run()))
    }
}

/// Extraction of one group's rows into its dataset entry.
struct GroupTask {
    key: String,
    rows: Vec<Target>,
    vars: Variables,
    settings: Arc<ConfigNode>,
    tool: Arc<QueryTool>,
    dataset: Dataset,
    combine_rows: bool,
}

impl GroupTask {
    fn run(self) -> Result<(), ExtractionError> {
        let mut writer = self.dataset.writer(&self.key);

        let record = self.record_target();
        self.tool
            .resolve_into(&record, &self.settings, &FieldPath::root(), &self.vars, &mut writer)?;

        if let Some(occurrence) = self.settings.node(OCCURRENCE_NODE) {
            let base = FieldPath::root().child(OCCURRENCE_FIELD);
            writer.record(&base, self.rows.len().to_string());
            for (index, row) in self.rows.iter().enumerate() {
                self.tool
                    .resolve_into(row, occurrence, &base.index(index), &self.vars, &mut writer)?;
            }
        }

        tracing::debug!("Group {} extracted from {} row(s)", self.key, self.rows.len());
        Ok(())
    }

    /// First row, or a fresh `<group>` document holding copies of every row.
    fn record_target(&self) -> Target {
        if self.combine_rows && self.rows.len() > 1 {
            let document = Arc::new(Document::regroup(&self.rows, GROUP_ELEMENT));
            let node = document.document_element().unwrap_or_else(|| document.root());
            return Target::new(document, node);
        }
        self.rows[0].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::Extractor;

    const CATALOG: &str = r#"
<catalog>
  <course id="CS101"><name>Intro to CS</name>
    <section crn="11"><time>MWF 9:00</time></section>
    <section crn="12"><time>TTh 13:00</time></section>
  </course>
  <course id="CS102"><name>Data Structures</name>
    <section crn="21"><time>MW 10:00</time></section>
  </course>
  <course id="CS101"><name>Intro to CS (lab)</name>
    <section crn="13"><time>F 14:00</time></section>
  </course>
</catalog>"#;

    fn retriever(yaml: &str) -> Retriever {
        Retriever::new(ConfigNode::from_yaml_str(yaml).unwrap()).unwrap()
    }

    fn document() -> Arc<Document> {
        Arc::new(Document::parse_str(CATALOG).unwrap())
    }

    const BASE: &str = r#"
query-all: "//course/@id"
query-single: "//course[@id='${course.id}']"
_query:
  name: "./name/text()"
"#;

    #[test]
    fn test_groups_are_deduplicated_and_sorted() {
        let retriever = retriever(BASE);
        let keys = retriever
            .discover_groups(&Target::root(document()), &Variables::new())
            .unwrap();
        assert_eq!(keys, vec!["CS101", "CS102"]);
    }

    #[test]
    fn test_record_fields_use_first_row() {
        let retrieval = retriever(BASE).extract(document(), &Variables::new()).unwrap();
        let cs101 = retrieval.dataset.get("CS101").unwrap();

        assert_eq!(cs101.first_occurrence(&"name".into()).as_deref(), Some("Intro to CS"));
        assert_eq!(cs101.count(&"name".into()), 1);
        assert!(retrieval.report.is_complete());
    }

    #[test]
    fn test_occurrence_fields_per_row() {
        let yaml = format!(
            "{}_occurrence:\n  _query:\n    crn: \"./section/@crn\"\n",
            BASE
        );
        let retrieval = retriever(&yaml).extract(document(), &Variables::new()).unwrap();
        let cs101 = retrieval.dataset.get("CS101").unwrap();

        assert_eq!(cs101.get("occurrence").as_deref(), Some("2"));
        assert_eq!(cs101.occurrences(&"occurrence.0.crn".into()), vec!["11", "12"]);
        assert_eq!(cs101.occurrences(&"occurrence.1.crn".into()), vec!["13"]);
    }

    #[test]
    fn test_combine_rows_sees_every_row() {
        let yaml = r#"
query-all: "//course/@id"
query-single: "//course[@id='${group.key}']"
combine-rows: true
_query:
  names: "./course/name/text()"
"#;
        let retrieval = retriever(yaml).extract(document(), &Variables::new()).unwrap();
        let cs101 = retrieval.dataset.get("CS101").unwrap();
        assert_eq!(
            cs101.occurrences(&"names".into()),
            vec!["Intro to CS", "Intro to CS (lab)"]
        );
    }

    #[test]
    fn test_record_field_named_after_settings_node_is_rejected() {
        let yaml = r#"
query-all: "//course/@id"
query-single: "//course[@id='${course.id}']"
source:
  type: file
  file-path-template: catalog.xml
_query:
  source: "./name/text()"
"#;
        let err = Retriever::new(ConfigNode::from_yaml_str(yaml).unwrap()).unwrap_err();
        assert!(matches!(err, ExtractionError::ReservedField(field) if field == "source"));
    }

    #[test]
    fn test_group_key_script() {
        let yaml = format!("{}_script:\n  group-key: \"source.to_lower()\"\ngroup-variable: raw.id\n", BASE);
        let retriever = retriever(&yaml);
        let keys = retriever
            .discover_groups(&Target::root(document()), &Variables::new())
            .unwrap();
        assert_eq!(keys, vec!["cs101", "cs102"]);
    }

    #[test]
    fn test_unmatched_group_is_skipped_but_counted() {
        let yaml = r#"
query-all: "//course/@id | //missing/@id"
query-single: "//course[@id='${course.id}' and section[@crn='21']]"
batch-size: 1
_query:
  name: "./name/text()"
"#;
        let retrieval = retriever(yaml).extract(document(), &Variables::new()).unwrap();

        assert_eq!(retrieval.report.groups, 2);
        assert_eq!(retrieval.report.skipped.len(), 1);
        assert_eq!(retrieval.report.skipped[0].label, "CS101");
        assert_eq!(retrieval.dataset.keys(), vec!["CS102"]);
        assert_eq!(retrieval.report.batch_sizes(), vec![1]);
    }

    #[test]
    fn test_missing_settings_are_rejected() {
        let err = Retriever::new(ConfigNode::from_yaml_str("query-all: //a\n").unwrap()).unwrap_err();
        assert!(matches!(err, ExtractionError::MissingSetting(key) if key == "query-single"));
    }

    #[test]
    fn test_discovery_failure_aborts() {
        let retriever = retriever("query-all: \"//course[\"\nquery-single: \".\"\n");
        let err = retriever.extract(document(), &Variables::new()).unwrap_err();
        assert!(matches!(err, ExtractionError::Query(_)));
    }

    #[tokio::test]
    async fn test_retrieve_requires_source() {
        let err = retriever(BASE).retrieve(&Variables::new()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::MissingSetting(key) if key == "source"));
    }
}
