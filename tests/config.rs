use std::fs;

use assert_matches::assert_matches;

use biopipeline::config::{Config, ConfigLoader};
use biopipeline::domain::{AnalysisUnit, DuplicatePolicy};
use biopipeline::error::PipelineError;

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("biopipeline.json");
    fs::write(
        &path,
        r#"{
            "bind": "0.0.0.0:9100",
            "data_dir": "/var/lib/biopipeline",
            "duplicate_policy": "skip-identical",
            "analysis_unit": "whole-file",
            "fetch": { "timeout_secs": 5 },
            "sources": [
                { "id": "demo", "name": "Demo", "url": "https://example.org/demo.fasta", "description": "d" }
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.bind.port(), 9100);
    assert_eq!(resolved.data_dir.as_str(), "/var/lib/biopipeline");
    assert_eq!(resolved.duplicate_policy, DuplicatePolicy::SkipIdentical);
    assert_eq!(resolved.analysis_unit, AnalysisUnit::WholeFile);
    assert_eq!(resolved.fetch.timeout.as_secs(), 5);
    assert_eq!(resolved.fetch.max_retries, 3);
    assert_eq!(resolved.max_upload_bytes, 64 * 1024 * 1024);
    assert_eq!(resolved.sources.len(), 1);
    assert_eq!(resolved.sources[0].id, "demo");
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(PipelineError::ConfigRead(_))
    );
}

#[test]
fn malformed_json_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(PipelineError::ConfigParse(_))
    );
}

#[test]
fn unknown_policy_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    fs::write(&path, r#"{ "duplicate_policy": "overwrite" }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(PipelineError::ConfigParse(_))
    );
}

#[test]
fn duplicate_source_ids_are_rejected() {
    let source = r#"{ "id": "x", "name": "X", "url": "https://example.org/x.fa", "description": "" }"#;
    let config: Config = serde_json::from_str(&format!(r#"{{ "sources": [{source}, {source}] }}"#)).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(PipelineError::ConfigParse(message)) if message.contains("duplicate source id")
    );
}
