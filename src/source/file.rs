//! Local file data source.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use url::Url;

use super::pipe::PipeWriter;
use super::{SourceError, SourceSettings};
use crate::substitution::{Substitutor, Variables};

const CHUNK_SIZE: usize = 8 * 1024;

/// Reads a catalog from disk.
///
/// The location is a `file://` URI template (`file-uri-template`) or a
/// plain path template (`file-path-template`); the URI wins when both are set.
#[derive(Debug, Clone)]
pub struct FileSource {
    uri_template: Option<String>,
    path_template: Option<String>,
}

impl FileSource {
    pub fn new(uri_template: Option<String>, path_template: Option<String>) -> Self {
        Self {
            uri_template,
            path_template,
        }
    }

    pub(crate) fn from_settings(settings: &SourceSettings<'_>) -> Result<Self, SourceError> {
        let source = Self::new(
            settings.literal("file-uri-template").map(str::to_string),
            settings.literal("file-path-template").map(str::to_string),
        );
        if source.uri_template.is_none() && source.path_template.is_none() {
            return Err(SourceError::MissingKey(
                "file-uri-template or file-path-template".to_string(),
            ));
        }
        Ok(source)
    }

    /// Resolve the templates into a concrete path.
    pub fn locate(&self, substitutor: &Substitutor, vars: &Variables) -> Result<PathBuf, SourceError> {
        if let Some(template) = &self.uri_template {
            let uri = substitutor.resolve(template, vars)?;
            return file_uri_to_path(&uri);
        }

        match &self.path_template {
            Some(template) => Ok(PathBuf::from(substitutor.resolve(template, vars)?)),
            None => Err(SourceError::MissingKey(
                "file-uri-template or file-path-template".to_string(),
            )),
        }
    }
}

fn file_uri_to_path(uri: &str) -> Result<PathBuf, SourceError> {
    let parsed = Url::parse(uri).map_err(|e| SourceError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;

    if parsed.scheme() != "file" {
        return Err(SourceError::InvalidUri {
            uri: uri.to_string(),
            reason: format!("expected a file:// URI, found scheme '{}'", parsed.scheme()),
        });
    }

    parsed.to_file_path().map_err(|_| SourceError::InvalidUri {
        uri: uri.to_string(),
        reason: "not a local file path".to_string(),
    })
}

/// Copy the file into the pipe chunk by chunk. Returns the bytes written.
pub(crate) async fn produce(path: &Path, writer: &mut PipeWriter) -> Result<u64, SourceError> {
    let io_error = |source| SourceError::Io {
        location: path.display().to_string(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await.map_err(io_error)?;
        if n == 0 {
            break;
        }
        writer.write_chunk(&buf[..n]).await.map_err(io_error)?;
        total += n as u64;
    }

    Ok(total)
}
