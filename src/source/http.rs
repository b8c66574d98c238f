//! HTTP data source wrapping reqwest.
//!
//! Streams the response body into the pipe as it arrives instead of
//! buffering the whole catalog in memory.

use std::time::Duration;

use futures::StreamExt;
use reqwest::{Method, Url};

use super::pipe::PipeWriter;
use super::{SourceError, SourceSettings};
use crate::substitution::{Substitutor, Variables};

/// Default request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Templates describing one HTTP request.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    method: String,
    uri: String,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

/// A fully resolved HTTP request, bound to the client that sends it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    client: reqwest::Client,
    pub method: Method,
    pub url: Url,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpSource {
    pub(crate) fn from_settings(settings: &SourceSettings<'_>) -> Result<Self, SourceError> {
        let uri = settings
            .literal("uri")
            .ok_or_else(|| SourceError::MissingKey("uri".to_string()))?
            .to_string();
        let timeout_ms = settings.parse::<u64>("timeout-ms")?.unwrap_or(DEFAULT_TIMEOUT_MS);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(SourceError::Client)?;

        Ok(Self {
            client,
            method: settings.get("method", "GET").to_string(),
            uri,
            params: settings.indexed_pairs("param"),
            headers: settings.indexed_pairs("header"),
        })
    }

    /// Resolve method, URI, parameters and headers against `vars`.
    pub fn locate(&self, substitutor: &Substitutor, vars: &Variables) -> Result<HttpRequest, SourceError> {
        let method_name = substitutor.resolve(&self.method, vars)?;
        let method = Method::from_bytes(method_name.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| SourceError::InvalidMethod(method_name.clone()))?;

        let uri = substitutor.resolve(&self.uri, vars)?;
        let url = Url::parse(&uri).map_err(|e| SourceError::InvalidUri {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;

        let resolve_pairs = |pairs: &[(String, String)]| -> Result<Vec<(String, String)>, SourceError> {
            pairs
                .iter()
                .map(|(name, value)| -> Result<(String, String), SourceError> {
                    Ok((substitutor.resolve(name, vars)?, substitutor.resolve(value, vars)?))
                })
                .collect()
        };

        Ok(HttpRequest {
            client: self.client.clone(),
            method,
            url,
            params: resolve_pairs(&self.params)?,
            headers: resolve_pairs(&self.headers)?,
        })
    }
}

/// Send the request and stream the body into the pipe. Returns the bytes written.
pub(crate) async fn produce(
    request: &HttpRequest,
    writer: &mut PipeWriter,
) -> Result<u64, SourceError> {
    let uri = request.url.to_string();

    let mut builder = request.client.request(request.method.clone(), request.url.clone());
    if !request.params.is_empty() {
        builder = if request.method == Method::GET {
            builder.query(&request.params)
        } else {
            builder.form(&request.params)
        };
    }
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().await.map_err(|source| SourceError::Http {
        uri: uri.clone(),
        source,
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            uri,
            status: status.as_u16(),
        });
    }

    let mut body = response.bytes_stream();
    let mut total = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|source| SourceError::Http {
            uri: uri.clone(),
            source,
        })?;
        writer
            .write_chunk(&chunk)
            .await
            .map_err(|source| SourceError::Io {
                location: uri.clone(),
                source,
            })?;
        total += chunk.len() as u64;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigNode;
    use crate::substitution::VariableSource;

    fn source(yaml: &str) -> HttpSource {
        let config = ConfigNode::from_yaml_str(yaml).unwrap();
        HttpSource::from_settings(&SourceSettings::new(&config)).unwrap()
    }

    #[test]
    fn test_locate_resolves_every_part() {
        let http = source(
            r#"
source:
  type: http
  method: post
  uri: "https://catalog.example.edu/${term}/search"
  param:
    - name: term
      value: "${term}"
  header:
    - name: X-Campus
      value: main
"#,
        );
        let mut vars = Variables::new();
        vars.insert("term".to_string(), "2024FA".to_string());

        let request = http
            .locate(&Substitutor::new(vec![VariableSource::System]), &vars)
            .unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url.as_str(), "https://catalog.example.edu/2024FA/search");
        assert_eq!(request.params, vec![("term".to_string(), "2024FA".to_string())]);
        assert_eq!(request.headers, vec![("X-Campus".to_string(), "main".to_string())]);
    }

    #[test]
    fn test_missing_uri_is_rejected() {
        let config = ConfigNode::from_yaml_str("source:\n  type: http\n").unwrap();
        let err = HttpSource::from_settings(&SourceSettings::new(&config)).unwrap_err();
        assert!(matches!(err, SourceError::MissingKey(key) if key == "uri"));
    }

    #[test]
    fn test_invalid_uri_is_rejected() {
        let http = source("uri: \"not a uri\"\n");
        let err = http
            .locate(&Substitutor::new(vec![VariableSource::System]), &Variables::new())
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidUri { .. }));
    }
}
