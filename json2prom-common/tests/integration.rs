//! Integration tests for json2prom-common.

use std::io::Write;

use json2prom_common::{ConfigFormat, LoggingConfig, Query, QueryResult, load_config, parse_config};
use serde::Deserialize;
use serde_json::json;

#[test]
fn test_items_then_fields_workflow() {
    let body = r#"{"users":[{"name":"alice","score":5},{"name":"bob","score":3}]}"#;
    let doc: serde_json::Value = serde_json::from_str(body).unwrap();

    let items = Query::parse("users[*]").unwrap();
    let value = Query::parse("score").unwrap();
    let label = Query::parse("name").unwrap();

    let QueryResult::Sequence(users) = items.evaluate(&doc) else {
        panic!("items query should fan out");
    };
    assert_eq!(users.len(), 2);

    let pairs: Vec<_> = users
        .iter()
        .map(|user| (label.evaluate(user), value.evaluate(user)))
        .collect();

    assert_eq!(
        pairs,
        vec![
            (
                QueryResult::Value(&json!("alice")),
                QueryResult::Value(&json!(5))
            ),
            (
                QueryResult::Value(&json!("bob")),
                QueryResult::Value(&json!(3))
            ),
        ]
    );
}

#[test]
fn test_single_object_document() {
    let doc = json!({"status": "ok", "count": 7});

    assert_eq!(Query::identity().evaluate(&doc), QueryResult::Value(&doc));
    assert_eq!(
        Query::parse("count").unwrap().evaluate(&doc),
        QueryResult::Value(&json!(7))
    );
}

#[derive(Debug, Deserialize)]
struct Sample {
    name: String,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_load_yaml_and_json5_files() {
    let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(yaml, "name: from-yaml\nlogging:\n  level: debug").unwrap();

    let mut json5 = tempfile::Builder::new().suffix(".json5").tempfile().unwrap();
    writeln!(json5, "{{ name: 'from-json5', /* comment */ }}").unwrap();

    let from_yaml: Sample = load_config(yaml.path()).unwrap();
    let from_json5: Sample = load_config(json5.path()).unwrap();

    assert_eq!(from_yaml.name, "from-yaml");
    assert_eq!(from_yaml.logging.level, "debug");
    assert_eq!(from_json5.name, "from-json5");
    assert_eq!(from_json5.logging.level, "info");
}

#[test]
fn test_plain_json_is_valid_json5() {
    let sample: Sample = parse_config(r#"{"name": "plain"}"#, ConfigFormat::Json5).unwrap();
    assert_eq!(sample.name, "plain");
}
