//! Data sources turning a file or HTTP resource into a byte stream.
//!
//! [`DataSource::open`] resolves the location against the caller's
//! variables, spawns a producer task and hands back the reader end of a
//! bounded pipe right away. Producer failures are logged and close the pipe,
//! so a blocked reader sees end-of-stream and can then ask
//! [`SourceStream::failure`] what went wrong.

pub mod file;
pub mod http;
pub mod pipe;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::config::{ConfigError, ConfigNode};
use crate::substitution::{SubstitutionError, Substitutor, Variables};

pub use file::FileSource;
pub use http::{HttpRequest, HttpSource};
pub use pipe::{pipe, PipeWriter, SourceStream, TeeSink, DEFAULT_CAPACITY};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown data source type '{0}' (expected 'file' or 'http')")]
    UnknownKind(String),

    #[error("data source is missing '{0}'")]
    MissingKey(String),

    #[error("invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error(transparent)]
    Substitution(#[from] SubstitutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("I/O error on {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request to {uri} failed: {source}")]
    Http {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {uri} returned HTTP {status}")]
    Status { uri: String, status: u16 },

    #[error("data sources must be opened inside a tokio runtime")]
    NoRuntime,

    #[error("data source failed: {0}")]
    Failed(String),
}

/// Kinds of data source selectable with `source.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    #[default]
    File,
    Http,
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SourceKind::File),
            "http" | "https" => Ok(SourceKind::Http),
            other => Err(SourceError::UnknownKind(other.to_string())),
        }
    }
}

/// Source keys read from the `source` sub-node, falling back to the
/// configuration root.
pub(crate) struct SourceSettings<'a> {
    config: &'a ConfigNode,
}

impl<'a> SourceSettings<'a> {
    pub(crate) fn new(config: &'a ConfigNode) -> Self {
        Self { config }
    }

    pub(crate) fn literal(&self, key: &str) -> Option<&'a str> {
        self.config
            .literal(&format!("source.{}", key))
            .or_else(|| self.config.literal(key))
    }

    pub(crate) fn get(&self, key: &str, default: &'a str) -> &'a str {
        self.literal(key).unwrap_or(default)
    }

    pub(crate) fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let scoped = format!("source.{}", key);
        if self.config.contains_key(&scoped) {
            self.config.parse(&scoped)
        } else {
            self.config.parse(key)
        }
    }

    pub(crate) fn indexed_pairs(&self, prefix: &str) -> Vec<(String, String)> {
        let scoped = self.config.indexed_pairs(&format!("source.{}", prefix));
        if scoped.is_empty() {
            self.config.indexed_pairs(prefix)
        } else {
            scoped
        }
    }
}

/// Where a source reads from, after placeholder resolution.
#[derive(Debug, Clone)]
pub enum Location {
    File(PathBuf),
    Http(HttpRequest),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::File(path) => write!(f, "{}", path.display()),
            Location::Http(request) => write!(f, "{} {}", request.method, request.url),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceBackend {
    File(FileSource),
    Http(HttpSource),
}

/// A configured data source.
#[derive(Debug, Clone)]
pub struct DataSource {
    backend: SourceBackend,
    substitutor: Substitutor,
    capacity: usize,
    tee_template: Option<String>,
}

impl DataSource {
    pub fn new(backend: SourceBackend, substitutor: Substitutor) -> Self {
        Self {
            backend,
            substitutor,
            capacity: DEFAULT_CAPACITY,
            tee_template: None,
        }
    }

    /// Build the source described by `source.type` and its keys.
    pub fn from_config(config: &ConfigNode, substitutor: Substitutor) -> Result<Self, SourceError> {
        let settings = SourceSettings::new(config);
        let kind: SourceKind = settings.get("type", "file").parse()?;

        let backend = match kind {
            SourceKind::File => SourceBackend::File(FileSource::from_settings(&settings)?),
            SourceKind::Http => SourceBackend::Http(HttpSource::from_settings(&settings)?),
        };

        let mut source = Self::new(backend, substitutor);
        if let Some(capacity) = settings.parse::<usize>("pipe-capacity")? {
            source.capacity = capacity.max(1);
        }
        source.tee_template = settings.literal("tee-file").map(str::to_string);
        Ok(source)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn kind(&self) -> SourceKind {
        match self.backend {
            SourceBackend::File(_) => SourceKind::File,
            SourceBackend::Http(_) => SourceKind::Http,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolve the location templates against `vars`.
    pub fn locate(&self, vars: &Variables) -> Result<Location, SourceError> {
        match &self.backend {
            SourceBackend::File(file) => Ok(Location::File(file.locate(&self.substitutor, vars)?)),
            SourceBackend::Http(http) => Ok(Location::Http(http.locate(&self.substitutor, vars)?)),
        }
    }

    /// Start producing and return the reader end of the pipe.
    ///
    /// Location errors are returned directly. Failures while producing are
    /// logged, end the stream and are reported by [`SourceStream::failure`].
    /// When `tee` is `None` and `tee-file` is configured, bytes are copied
    /// to that file instead.
    pub fn open(&self, vars: &Variables, tee: Option<TeeSink>) -> Result<SourceStream, SourceError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SourceError::NoRuntime)?;
        let location = self.locate(vars)?;
        let tee_path = match (&tee, &self.tee_template) {
            (None, Some(template)) => Some(PathBuf::from(self.substitutor.resolve(template, vars)?)),
            _ => None,
        };

        let (mut writer, reader) = pipe(self.capacity);
        if let Some(tee) = tee {
            writer.set_tee(tee);
        }

        runtime.spawn(async move {
            if let Some(path) = tee_path {
                match tokio::fs::File::create(&path).await {
                    Ok(file) => writer.set_tee(Box::new(file)),
                    Err(e) => tracing::warn!("Cannot open tee file {}: {}", path.display(), e),
                }
            }

            tracing::debug!("Reading data source {}", location);
            let result = match &location {
                Location::File(path) => file::produce(path, &mut writer).await,
                Location::Http(request) => http::produce(request, &mut writer).await,
            };

            match result {
                Ok(bytes) => {
                    tracing::debug!("Data source {} produced {} bytes", location, bytes);
                    writer.close().await;
                }
                Err(e) => {
                    tracing::error!("Data source {} failed: {}", location, e);
                    writer.fail(e.to_string()).await;
                }
            }
        });

        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substitution::VariableSource;
    use std::io::Write;

    fn substitutor() -> Substitutor {
        Substitutor::new(vec![VariableSource::System])
    }

    #[test]
    fn test_kind_selection() {
        let file = ConfigNode::from_yaml_str("source:\n  file-path-template: /tmp/a.xml\n").unwrap();
        assert_eq!(DataSource::from_config(&file, substitutor()).unwrap().kind(), SourceKind::File);

        let http = ConfigNode::from_yaml_str("source:\n  type: http\n  uri: http://localhost/a\n").unwrap();
        assert_eq!(DataSource::from_config(&http, substitutor()).unwrap().kind(), SourceKind::Http);

        let ftp = ConfigNode::from_yaml_str("source:\n  type: ftp\n").unwrap();
        assert!(matches!(
            DataSource::from_config(&ftp, substitutor()),
            Err(SourceError::UnknownKind(kind)) if kind == "ftp"
        ));
    }

    #[test]
    fn test_pipe_capacity_is_configurable() {
        let config = ConfigNode::from_yaml_str(
            "source:\n  file-path-template: /tmp/a.xml\n  pipe-capacity: 128\n",
        )
        .unwrap();
        assert_eq!(DataSource::from_config(&config, substitutor()).unwrap().capacity(), 128);
    }

    #[test]
    fn test_open_requires_runtime() {
        let config = ConfigNode::from_yaml_str("file-path-template: /tmp/a.xml\n").unwrap();
        let source = DataSource::from_config(&config, substitutor()).unwrap();
        assert!(matches!(
            source.open(&Variables::new(), None),
            Err(SourceError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_file_source_streams_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"<catalog><course id=\"CS101\"/></catalog>").unwrap();

        let source = DataSource::new(
            SourceBackend::File(FileSource::new(None, Some("${catalog}".to_string()))),
            substitutor(),
        )
        .with_capacity(4);
        let mut vars = Variables::new();
        vars.insert("catalog".to_string(), file.path().display().to_string());

        let bytes = source.open(&vars, None).unwrap().read_all().await.unwrap();
        assert_eq!(bytes, b"<catalog><course id=\"CS101\"/></catalog>");
    }

    #[tokio::test]
    async fn test_missing_file_ends_stream_with_failure() {
        let source = DataSource::new(
            SourceBackend::File(FileSource::new(None, Some("/definitely/not/here.xml".to_string()))),
            substitutor(),
        );

        let err = source.open(&Variables::new(), None).unwrap().read_all().await.unwrap_err();
        assert!(matches!(err, SourceError::Failed(_)));
    }
}
