//! HTTP data source tests against a local mock server

use course_scraper::source::SourceError;
use course_scraper::{ConfigNode, DataSource, ExtractionError, Retriever, Substitutor, Variables};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CATALOG: &str = r#"<catalog>
  <course id="CS101"><name>Intro to CS</name></course>
  <course id="CS102"><name>Data Structures</name></course>
</catalog>"#;

fn vars(server: &MockServer) -> Variables {
    let mut vars = Variables::new();
    vars.insert("server".to_string(), server.uri());
    vars.insert("term".to_string(), "2024FA".to_string());
    vars
}

fn http_config(method_name: &str) -> ConfigNode {
    ConfigNode::from_yaml_str(&format!(
        r#"
source:
  type: http
  method: {}
  uri: "${{server}}/catalog"
  timeout-ms: 5000
  param:
    - name: term
      value: "${{term}}"
  header:
    - name: X-Campus
      value: main
query-all: "//course/@id"
query-single: "//course[@id='${{course.id}}']"
_query:
  name: "./name/text()"
"#,
        method_name
    ))
    .unwrap()
}

#[tokio::test]
async fn test_get_sends_params_as_query_string() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .and(query_param("term", "2024FA"))
        .and(header("X-Campus", "main"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CATALOG))
        .expect(1)
        .mount(&server)
        .await;

    let retriever = Retriever::new(http_config("GET")).unwrap();
    let retrieval = retriever.retrieve(&vars(&server)).await.unwrap();

    assert_eq!(retrieval.dataset.keys(), vec!["CS101", "CS102"]);
    assert!(retrieval.report.is_complete());
}

#[tokio::test]
async fn test_post_sends_params_as_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/catalog"))
        .and(body_string_contains("term=2024FA"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CATALOG))
        .expect(1)
        .mount(&server)
        .await;

    let retriever = Retriever::new(http_config("POST")).unwrap();
    let retrieval = retriever.retrieve(&vars(&server)).await.unwrap();

    assert_eq!(retrieval.dataset.len(), 2);
}

#[tokio::test]
async fn test_error_status_closes_stream_with_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = http_config("GET");
    let source = DataSource::from_config(&config, Substitutor::for_config(&config)).unwrap();
    let stream = source.open(&vars(&server), None).unwrap();

    let err = stream.read_all().await.unwrap_err();
    assert!(matches!(err, SourceError::Failed(message) if message.contains("503")));

    let retriever = Retriever::new(http_config("GET")).unwrap();
    let err = retriever.retrieve(&vars(&server)).await.unwrap_err();
    assert!(matches!(err, ExtractionError::Source(SourceError::Failed(_))));
}

#[tokio::test]
async fn test_tee_sink_receives_response_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CATALOG))
        .mount(&server)
        .await;

    let config = http_config("GET");
    let source = DataSource::from_config(&config, Substitutor::for_config(&config))
        .unwrap()
        .with_capacity(8);
    let (tee_write, mut tee_read) = tokio::io::duplex(64 * 1024);

    let bytes = source
        .open(&vars(&server), Some(Box::new(tee_write)))
        .unwrap()
        .read_all()
        .await
        .unwrap();

    let mut copy = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut tee_read, &mut copy)
        .await
        .unwrap();
    assert_eq!(bytes, CATALOG.as_bytes());
    assert_eq!(copy, CATALOG.as_bytes());
}
