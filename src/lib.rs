//! # Course Scraper: Configuration-Driven Catalog Extraction
//!
//! Course Scraper pulls course catalogs from local files or HTTP endpoints
//! and flattens them into per-course datasets of dotted field paths. What
//! to fetch and what to extract is described entirely in YAML, so the same
//! engine retargets to another university's catalog without code changes.
//!
//! ## Features
//!
//! - **Placeholder substitution**: `${name}` templates resolved from local variables, configuration properties, the environment and host facts
//! - **Scripted post-processing**: per-field Rhai scripts for cleaning values and group keys
//! - **Streaming acquisition**: file and HTTP sources feeding a bounded pipe, with an optional tee
//! - **Path queries**: XPath-style queries over an immutable document arena
//! - **Bounded fan-out**: per-course sub-tasks forked in batches onto a work-stealing pool
//!
//! ## Example configuration
//!
//! ```yaml
//! source:
//!   type: http
//!   uri: "https://catalog.example.edu/api/courses"
//!   param:
//!     - name: term
//!       value: "${term}"
//! batch-size: 50
//! query-all: "//course/@id"
//! query-single: "//course[@id='${course.id}']"
//! _query:
//!   title: "./title/text()"
//!   sections: "./section"
//! sections:
//!   _query:
//!     crn: "@crn"
//!     time: "./meeting/@time"
//! ```
//!
//! For course `CS101` with two sections this yields fields such as
//! `title.0`, `sections` (= `2`), `sections.1.crn.0` and `sections.1.time.0`.

// Leaf engines
pub mod config;
pub mod substitution;
pub mod script;

// Acquisition and documents
pub mod source;
pub mod document;
pub mod query;
pub mod extraction;

// Extraction runtime
pub mod batch;
pub mod dataset;
pub mod retrieval;
pub mod serialization;

// Re-export key types
pub use config::{ConfigError, ConfigNode, ConfigValue};
pub use substitution::{SubstitutionError, Substitutor, VariableSource, Variables};
pub use script::{ScriptBackend, ScriptEngine};
pub use source::{DataSource, SourceError, SourceStream};
pub use document::{Charset, Document, DocumentError, NodeId, Target};
pub use query::{FieldSink, QueryError, QueryTool};
pub use extraction::{Extractor, FieldPath};
pub use batch::{BatchCoordinator, BatchReport};
pub use dataset::{Dataset, GroupEntry, GroupRecord};
pub use retrieval::{ExtractionError, Retrieval, RetrievalReport, Retriever};
pub use serialization::{OutputFormat, SerializationError};
