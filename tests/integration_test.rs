//! Integration tests for course-scraper retrievals

use std::fs;
use std::sync::Arc;

use course_scraper::source::SourceError;
use course_scraper::{ConfigNode, Document, ExtractionError, Extractor, Retriever, Variables};

const CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<catalog term="2024FA">
  <course id="CS101" credits="3">
    <name>Intro to CS</name>
    <section crn="11"><time>MWF 9:00</time><room>A1</room></section>
    <section crn="12"><time>TTh 13:00</time><room>B2</room></section>
  </course>
  <course id="CS102" credits="4">
    <name>Data Structures</name>
    <section crn="21"><time>MW 10:00</time><room>A1</room></section>
  </course>
</catalog>"#;

fn retriever(yaml: &str) -> Retriever {
    Retriever::new(ConfigNode::from_yaml_str(yaml).unwrap()).unwrap()
}

fn document(xml: &str) -> Arc<Document> {
    Arc::new(Document::parse_str(xml).unwrap())
}

#[test]
fn test_two_courses_each_get_their_name() {
    let retriever = retriever(
        r#"
query-all: "//course/@id"
query-single: "//course[@id='${course.id}']"
_query:
  name: "./name/text()"
"#,
    );

    let retrieval = retriever.extract(document(CATALOG), &Variables::new()).unwrap();
    let dataset = retrieval.dataset.snapshot();

    assert_eq!(dataset.keys().collect::<Vec<_>>(), vec!["CS101", "CS102"]);
    assert_eq!(dataset["CS101"].first_occurrence(&"name".into()).as_deref(), Some("Intro to CS"));
    assert_eq!(dataset["CS102"].first_occurrence(&"name".into()).as_deref(), Some("Data Structures"));
    assert_eq!(dataset["CS101"].len(), 2);
}

#[test]
fn test_five_groups_in_batches_of_two() {
    let xml: String = (1..=5)
        .map(|i| format!("<course id=\"C{}\"><name>Course {}</name></course>", i, i))
        .collect();
    let xml = format!("<catalog>{}</catalog>", xml);

    let retriever = retriever(
        r#"
batch-size: 2
query-all: "//course/@id"
query-single: "//course[@id='${course.id}']"
_query:
  name: "./name/text()"
"#,
    );

    let retrieval = retriever.extract(document(&xml), &Variables::new()).unwrap();

    assert_eq!(retrieval.report.batch_sizes(), vec![2, 2, 1]);
    assert_eq!(retrieval.dataset.len(), 5);
    assert_eq!(retrieval.report.succeeded(), 5);
    for i in 1..=5 {
        let entry = retrieval.dataset.get(&format!("C{}", i)).unwrap();
        assert_eq!(entry.first_occurrence(&"name".into()), Some(format!("Course {}", i)));
    }
}

#[test]
fn test_nested_sections_flatten_with_counts() {
    let retriever = retriever(
        r#"
query-all: "//course/@id"
query-single: "//course[@id='${course.id}']"
_query:
  name: "./name/text()"
  sections: "./section"
sections:
  _query:
    crn: "@crn"
    time: "./time/text()"
  _script:
    crn: "\"CRN-\" + source"
"#,
    );

    let retrieval = retriever.extract(document(CATALOG), &Variables::new()).unwrap();
    let cs101 = retrieval.dataset.get("CS101").unwrap();

    assert_eq!(cs101.count(&"sections".into()), 2);
    assert_eq!(cs101.first_occurrence(&"sections.0.crn".into()).as_deref(), Some("CRN-11"));
    assert_eq!(cs101.first_occurrence(&"sections.1.time".into()).as_deref(), Some("TTh 13:00"));
    assert_eq!(cs101.extract(&"sections.2".into()), None);
}

#[test]
fn test_failing_group_does_not_touch_others() {
    let xml = r#"<catalog>
  <course id="CS101"><name>Intro to CS</name></course>
  <course id="X'1"><name>Broken</name></course>
  <course id="CS102"><name>Data Structures</name></course>
</catalog>"#;

    let retriever = retriever(
        r#"
query-all: "//course/@id"
query-single: "//course[@id=\"${course.id}\"]"
_query:
  name: "./name/text()"
  code: "./code[@key='${group.key}']"
"#,
    );

    let retrieval = retriever.extract(document(xml), &Variables::new()).unwrap();

    assert_eq!(retrieval.report.failed.len(), 1);
    assert_eq!(retrieval.report.failed[0].label, "X'1");
    assert!(!retrieval.report.is_complete());

    for (key, name) in [("CS101", "Intro to CS"), ("CS102", "Data Structures")] {
        let entry = retrieval.dataset.get(key).unwrap();
        assert_eq!(entry.first_occurrence(&"name".into()).as_deref(), Some(name));
        assert_eq!(entry.count(&"code".into()), 0);
        assert_eq!(entry.len(), 3);
    }
}

#[test]
fn test_extract_is_repeatable() {
    let retriever = retriever(
        r#"
batch-size: 1
query-all: "//section/@crn"
query-single: "//section[@crn='${course.id}']"
_query:
  room: "./room/text()"
"#,
    );

    let first = retriever.extract(document(CATALOG), &Variables::new()).unwrap();
    let second = retriever.extract(document(CATALOG), &Variables::new()).unwrap();

    assert_eq!(first.dataset.snapshot(), second.dataset.snapshot());
    assert_eq!(first.report.batch_sizes(), vec![1, 1, 1]);
}

#[tokio::test]
async fn test_retrieve_from_file_with_tee() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("2024FA.xml"), CATALOG).unwrap();

    let yaml = format!(
        r#"
properties:
  catalog.dir: "{}"
source:
  type: file
  file-path-template: "${{catalog.dir}}/${{term}}.xml"
  tee-file: "${{catalog.dir}}/${{term}}.copy.xml"
  pipe-capacity: 16
query-all: "//course/@id"
query-single: "//course[@id='${{course.id}}']"
_query:
  credits: "@credits"
"#,
        dir.path().display()
    );
    let retriever = retriever(&yaml);

    let mut vars = Variables::new();
    vars.insert("term".to_string(), "2024FA".to_string());
    let retrieval = retriever.retrieve(&vars).await.unwrap();

    assert_eq!(
        retrieval.dataset.get("CS102").unwrap().first_occurrence(&"credits".into()).as_deref(),
        Some("4")
    );
    assert_eq!(fs::read_to_string(dir.path().join("2024FA.copy.xml")).unwrap(), CATALOG);
}

#[tokio::test]
async fn test_missing_catalog_is_an_acquisition_error() {
    let retriever = retriever(
        r#"
file-path-template: "/nonexistent/catalog/${term}.xml"
query-all: "//course/@id"
query-single: "//course[@id='${course.id}']"
"#,
    );

    let mut vars = Variables::new();
    vars.insert("term".to_string(), "2024FA".to_string());
    let err = retriever.retrieve(&vars).await.unwrap_err();

    assert!(matches!(err, ExtractionError::Source(SourceError::Failed(_))));
}

#[tokio::test]
async fn test_retrieve_terms_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("fall.xml"), CATALOG).unwrap();

    let yaml = format!(
        r#"
file-uri-template: "file://{}/${{term}}.xml"
query-all: "//course/@id"
query-single: "//course[@id='${{course.id}}']"
_query:
  name: "./name/text()"
"#,
        dir.path().display()
    );
    let retriever = retriever(&yaml);

    let terms = vec!["fall".to_string(), "spring".to_string()];
    let results = retriever.retrieve_terms(&terms, &Variables::new()).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results["fall"].as_ref().unwrap().dataset.len(), 2);
    assert!(results["spring"].is_err());
}

#[test]
fn test_config_file_directory_is_a_property() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("catalog.yaml");
    fs::write(
        &config_path,
        r#"
file-path-template: "${config.dir}/catalog.xml"
query-all: "//course/@id"
query-single: "//course[@id='${course.id}']"
"#,
    )
    .unwrap();

    let retriever = Retriever::new(ConfigNode::load_from_file(&config_path).unwrap()).unwrap();
    let location = retriever.source().unwrap().locate(&Variables::new()).unwrap();

    assert_eq!(
        location.to_string(),
        dir.path().canonicalize().unwrap().join("catalog.xml").display().to_string()
    );
}
