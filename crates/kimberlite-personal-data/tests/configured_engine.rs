//! Engine built from a schema file and a project configuration file.

use std::fs;

use kimberlite_config::{AuditConfig, QuerySynthesisMode, SubjectSearchMode};
use kimberlite_personal_data::{PersonalDataAudit, Schema};
use tempfile::tempdir;

const SCHEMA: &str = r#"{
    "entities": [
        {
            "name": "crm.Customer",
            "semantics": "data_subject",
            "role": "Customer",
            "fields": [
                { "name": "ID", "key": true, "semantics": "data_subject_id" },
                { "name": "email", "personal": true }
            ],
            "relationships": [
                {
                    "name": "addresses",
                    "target": "crm.Address",
                    "cardinality": "to_many",
                    "composition": true,
                    "on": { "compare": {
                        "left": { "field": ["addresses", "customer"] },
                        "op": "eq",
                        "right": "self"
                    } }
                }
            ]
        },
        {
            "name": "crm.Address",
            "semantics": "data_subject_details",
            "fields": [
                { "name": "ID", "key": true },
                { "name": "street", "personal": true }
            ],
            "relationships": [
                {
                    "name": "customer",
                    "target": "crm.Customer",
                    "foreign_keys": [{ "local": "customer_ID", "target": "ID" }]
                }
            ]
        }
    ]
}"#;

#[test]
fn project_config_switches_modes() {
    let dir = tempdir().expect("tempdir");
    let schema_file = dir.path().join("schema.json");
    fs::write(&schema_file, SCHEMA).expect("write schema");
    fs::write(
        dir.path().join("kimberlite-audit.toml"),
        "[personal_data]\nsubject_search = \"greedy\"\nquery_synthesis = \"placeholder\"\n",
    )
    .expect("write config");

    let config = AuditConfig::load_from_dir(dir.path()).expect("config loads");
    assert_eq!(config.personal_data.subject_search, SubjectSearchMode::Greedy);
    assert_eq!(config.personal_data.query_synthesis, QuerySynthesisMode::Placeholder);

    let schema = Schema::from_json(&fs::read_to_string(&schema_file).expect("read schema"))
        .expect("schema parses");
    let audit = PersonalDataAudit::new(schema, config.personal_data);

    let explanation = audit
        .explain("crm.Address")
        .expect("no fault")
        .expect("resolves");
    assert_eq!(explanation.subject, "crm.Customer");
    assert_eq!(explanation.role, "Customer");
    assert_eq!(explanation.depth, 1);
    assert_eq!(explanation.paths.len(), 1);
    assert!(explanation.lookup.sql.ends_with(r#"d1."ID" = $1)"#));
}

#[test]
fn missing_project_config_uses_defaults() {
    let dir = tempdir().expect("tempdir");
    let config = AuditConfig::load_from_dir(dir.path()).expect("config loads");
    let audit = PersonalDataAudit::new(
        Schema::from_json(SCHEMA).expect("schema parses"),
        config.personal_data,
    );

    let explanation = audit
        .explain("crm.Address")
        .expect("no fault")
        .expect("resolves");
    assert!(explanation.lookup.sql.ends_with(r#"d1."ID" = ':ID')"#));
    assert!(audit.explain("crm.Customer").expect("no fault").is_some_and(|e| e.depth == 0));
}
