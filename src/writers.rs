//! Output writers for accepted records.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;

/// Write all records into a single NDJSON file, one compact JSON object per
/// line, ordered by resource type then id for reproducible output.
pub fn write_ndjson(records: &[Value], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in sorted(records) {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    info!(path = %path.display(), records = records.len(), "wrote NDJSON");
    Ok(())
}

/// Write one NDJSON file per resource type under `dir`, named
/// `<ResourceType>.ndjson`. Records without a string resourceType land in
/// `Unknown.ndjson`.
pub fn write_ndjson_split(records: &[Value], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut by_type: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for record in sorted(records) {
        let resource_type = record["resourceType"].as_str().unwrap_or("Unknown");
        by_type.entry(resource_type).or_default().push(record);
    }
    for (resource_type, group) in &by_type {
        let path = dir.join(format!("{resource_type}.ndjson"));
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for record in group {
            serde_json::to_writer(&mut out, record)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    info!(dir = %dir.display(), types = by_type.len(), records = records.len(), "wrote split NDJSON");
    Ok(())
}

/// Write all records as a single FHIR Bundle of the given type. A transaction
/// bundle gets a PUT request entry per resource.
pub fn write_bundle(records: &[Value], path: &Path, bundle_type: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let entries: Vec<Value> = sorted(records)
        .into_iter()
        .map(|record| {
            let mut entry = json!({ "resource": record });
            if bundle_type == "transaction" {
                let resource_type = record["resourceType"].as_str().unwrap_or("Unknown");
                let id = record["id"].as_str().unwrap_or("unknown");
                entry["request"] = json!({
                    "method": "PUT",
                    "url": format!("{resource_type}/{id}"),
                });
            }
            entry
        })
        .collect();
    let bundle = json!({
        "resourceType": "Bundle",
        "type": bundle_type,
        "entry": entries,
    });
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &bundle)?;
    info!(path = %path.display(), records = records.len(), "wrote bundle");
    Ok(())
}

/// Stable output order: resource type, then id, then original position.
fn sorted(records: &[Value]) -> Vec<&Value> {
    let mut out: Vec<&Value> = records.iter().collect();
    out.sort_by_key(|r| {
        (
            r["resourceType"].as_str().unwrap_or("").to_string(),
            r["id"].as_str().unwrap_or("").to_string(),
        )
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_records() -> Vec<Value> {
        vec![
            json!({"resourceType": "Patient", "id": "p2"}),
            json!({"resourceType": "Condition", "id": "c1",
                   "subject": {"reference": "Patient/p1"}}),
            json!({"resourceType": "Patient", "id": "p1"}),
        ]
    }

    #[test]
    fn test_ndjson_is_sorted_and_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        write_ndjson(&sample_records(), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        // Condition sorts before Patient; ids ascending within a type.
        assert!(lines[0].contains("Condition"));
        assert!(lines[1].contains("\"p1\""));
        assert!(lines[2].contains("\"p2\""));
        for line in lines {
            let parsed: Value = serde_json::from_str(line).unwrap();
            assert!(parsed.is_object());
        }
    }

    #[test]
    fn test_split_writes_one_file_per_type() {
        let dir = tempfile::tempdir().unwrap();
        write_ndjson_split(&sample_records(), dir.path()).unwrap();

        let patients = std::fs::read_to_string(dir.path().join("Patient.ndjson")).unwrap();
        assert_eq!(patients.lines().count(), 2);
        let conditions = std::fs::read_to_string(dir.path().join("Condition.ndjson")).unwrap();
        assert_eq!(conditions.lines().count(), 1);
    }

    #[test]
    fn test_transaction_bundle_carries_request_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        write_bundle(&sample_records(), &path, "transaction").unwrap();

        let bundle: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(bundle["resourceType"], "Bundle");
        assert_eq!(bundle["type"], "transaction");
        let entries = bundle["entry"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["request"]["method"], "PUT");
        assert_eq!(entries[0]["request"]["url"], "Condition/c1");
    }

    #[test]
    fn test_collection_bundle_has_no_request_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        write_bundle(&sample_records(), &path, "collection").unwrap();

        let bundle: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(bundle["entry"][0].get("request").is_none());
    }
}
