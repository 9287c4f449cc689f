use std::collections::HashSet;

use serde_json::{json, Value};

use crate::aggregator::BatchSummary;

pub const ALL_TOKENS_FILE: &str = "all_server_token.json";
pub const LOST_ACCOUNTS_FILE: &str = "lost_account.json";

/// A generated result file, kept in memory until delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    fn json(file_name: String, value: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            file_name,
            bytes: serde_json::to_vec_pretty(value)?,
        })
    }
}

/// The flat `[{"token": ...}]` list, if the run produced any token.
pub fn all_tokens(summary: &BatchSummary) -> Result<Option<Artifact>, serde_json::Error> {
    if summary.successes.is_empty() {
        return Ok(None);
    }
    let tokens: Vec<Value> = summary
        .successes
        .iter()
        .map(|entry| json!({ "token": entry.token }))
        .collect();
    Artifact::json(ALL_TOKENS_FILE.to_string(), &Value::Array(tokens)).map(Some)
}

/// Every output file for a finished run, sorted by file name.
pub fn build_all(summary: &BatchSummary) -> Result<Vec<Artifact>, serde_json::Error> {
    let mut artifacts = Vec::new();

    if let Some(all) = all_tokens(summary)? {
        artifacts.push(all);
    }

    let mut taken = HashSet::new();
    for (region, tokens) in &summary.by_region_tokens {
        let list: Vec<Value> = tokens.iter().map(|t| json!({ "token": t })).collect();
        artifacts.push(Artifact::json(
            unique_name(&mut taken, "token", region),
            &Value::Array(list),
        )?);
    }

    for (region, records) in &summary.by_region_records {
        let list: Vec<Value> = records.iter().cloned().map(Value::Object).collect();
        artifacts.push(Artifact::json(
            unique_name(&mut taken, "account", region),
            &Value::Array(list),
        )?);
    }

    if !summary.failures.is_empty() {
        let lost: Vec<Value> = summary
            .failures
            .iter()
            .map(|failure| {
                let mut record = failure.record.clone();
                record.insert("error_reason".into(), Value::String(failure.reason.clone()));
                Value::Object(record)
            })
            .collect();
        artifacts.push(Artifact::json(LOST_ACCOUNTS_FILE.to_string(), &Value::Array(lost))?);
    }

    artifacts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(artifacts)
}

fn region_stem(region: &str) -> String {
    let replaced: String = region
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<prefix>_<region>.json`, numbered when two regions sanitize alike.
fn unique_name(taken: &mut HashSet<String>, prefix: &str, region: &str) -> String {
    let stem = format!("{}_{}", prefix, region_stem(region));
    let mut name = format!("{}.json", stem);
    let mut n = 2;
    while !taken.insert(name.clone()) {
        name = format!("{}_{}.json", stem, n);
        n += 1;
    }
    name
}

/// Makes `name` safe as a file name that ends in `.json`.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = replaced.trim_matches(|c| matches!(c, ' ' | '_' | '.' | '-'));

    let with_extension = if trimmed.to_lowercase().ends_with(".json") {
        trimmed.to_string()
    } else {
        let stem = match trimmed.rfind('.') {
            Some(i) if i > 0 => &trimmed[..i],
            _ => trimmed,
        };
        format!("{}.json", stem)
    };

    if with_extension == ".json" {
        "Unknown.json".to_string()
    } else {
        with_extension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchOutcome;

    fn summary() -> BatchSummary {
        let mut summary = BatchSummary::new(3);
        let rec = |uid: &str| json!({"uid": uid, "password": "p"}).as_object().cloned().unwrap();
        summary.fold(FetchOutcome::Success {
            token: "T1".into(),
            region: Some("EU".into()),
            record: rec("a"),
        });
        summary.fold(FetchOutcome::Success {
            token: "T2".into(),
            region: Some("North America".into()),
            record: rec("b"),
        });
        summary.fold(FetchOutcome::failure(rec("c"), "Request Timeout"));
        summary
    }

    #[test]
    fn builds_sorted_artifact_set() {
        let names: Vec<String> = build_all(&summary())
            .unwrap()
            .into_iter()
            .map(|a| a.file_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "account_EU.json",
                "account_North_America.json",
                "all_server_token.json",
                "lost_account.json",
                "token_EU.json",
                "token_North_America.json",
            ]
        );
    }

    #[test]
    fn lost_records_keep_fields_and_reason() {
        let artifacts = build_all(&summary()).unwrap();
        let lost = artifacts.iter().find(|a| a.file_name == LOST_ACCOUNTS_FILE).unwrap();
        let parsed: Value = serde_json::from_slice(&lost.bytes).unwrap();
        assert_eq!(
            parsed,
            json!([{"uid": "c", "password": "p", "error_reason": "Request Timeout"}])
        );
    }

    #[test]
    fn colliding_region_names_get_distinct_files() {
        let mut summary = BatchSummary::new(3);
        let rec = |uid: &str| json!({"uid": uid, "password": "p"}).as_object().cloned().unwrap();
        for (token, region) in [("T1", "North America"), ("T2", "North_America"), ("T3", "v1.2")] {
            summary.fold(FetchOutcome::Success {
                token: token.into(),
                region: Some(region.into()),
                record: rec(token),
            });
        }

        let names: Vec<String> = build_all(&summary)
            .unwrap()
            .into_iter()
            .map(|a| a.file_name)
            .filter(|n| n.starts_with("token_"))
            .collect();
        assert_eq!(
            names,
            vec!["token_North_America.json", "token_North_America_2.json", "token_v1_2.json"]
        );
    }

    #[test]
    fn no_tokens_means_no_token_file() {
        assert_eq!(all_tokens(&BatchSummary::new(0)).unwrap(), None);
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_filename("my accounts.json"), "my_accounts.json");
        assert_eq!(sanitize_filename("list.txt"), "list.json");
        assert_eq!(sanitize_filename("EU"), "EU.json");
        assert_eq!(sanitize_filename("__"), "Unknown.json");
        assert_eq!(sanitize_filename(""), "Unknown.json");
    }
}
