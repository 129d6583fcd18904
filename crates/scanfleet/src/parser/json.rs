use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

use super::ParseError;
use crate::models::{MatchRecord, ParsedRecord, PathRecord, PortRecord};

static CVE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^cve-\d{4}-\d{4,}$").expect("cve regex should compile"));

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// First non-empty string found under any of `paths` (dotted for nesting).
fn text(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

fn number(value: &Value, paths: &[&str]) -> Option<u64> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn normalize_cve(raw: &str) -> Option<String> {
    let raw = raw.trim();
    CVE_REGEX.is_match(raw).then(|| raw.to_ascii_uppercase())
}

fn cve_of(value: &Value) -> Option<String> {
    if let Some(Value::Array(ids)) = lookup(value, "info.classification.cve-id") {
        if let Some(cve) = ids.iter().filter_map(Value::as_str).find_map(normalize_cve) {
            return Some(cve);
        }
    }
    ["cve", "cve_id", "cve-id", "template-id", "id", "pocinfo.id"]
        .iter()
        .filter_map(|path| lookup(value, path)?.as_str())
        .find_map(normalize_cve)
}

/// One JSON value per line; anything that is not a JSON object is skipped.
fn json_lines(raw: &str) -> impl Iterator<Item = Value> + '_ {
    raw.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_object)
}

/// A JSON document that is either a bare list or an object wrapping one
/// under `wrapper`.
fn json_items(raw: &str, wrapper: &str) -> Result<Vec<Value>, ParseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(raw)? {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(wrapper) {
            Some(Value::Array(items)) => Ok(items),
            _ => Ok(Vec::new()),
        },
        _ => Ok(Vec::new()),
    }
}

pub fn parse_fscan_jsonl(raw: &str) -> Vec<ParsedRecord> {
    json_lines(raw)
        .filter_map(|v| {
            let address = text(&v, &["ip", "host"])?;
            let port = u16::try_from(number(&v, &["port"])?).ok()?;
            Some(ParsedRecord::OpenPort(PortRecord {
                address,
                hostname: None,
                port,
                protocol: text(&v, &["protocol"]).unwrap_or_else(|| "tcp".to_string()),
                service_name: text(&v, &["service"]),
                product: None,
                version: text(&v, &["version"]),
                banner: text(&v, &["banner"]),
                os: None,
            }))
        })
        .collect()
}

pub fn parse_nuclei_jsonl(raw: &str) -> Vec<ParsedRecord> {
    json_lines(raw)
        .filter_map(|v| {
            let name = text(&v, &["info.name", "name", "template-id"])?;
            Some(ParsedRecord::Match(MatchRecord {
                matched_at: text(&v, &["matched-at", "matched_at", "host", "url"]),
                name,
                severity: text(&v, &["info.severity", "severity"]),
                cve_id: cve_of(&v),
                template_id: text(&v, &["template-id", "id"]),
                description: text(&v, &["info.description", "description"]),
            }))
        })
        .collect()
}

pub fn parse_afrog_json(raw: &str) -> Result<Vec<ParsedRecord>, ParseError> {
    Ok(json_items(raw, "results")?
        .into_iter()
        .map(|v| {
            ParsedRecord::Match(MatchRecord {
                matched_at: text(&v, &["fulltarget", "target"]),
                name: text(&v, &["pocinfo.infoname", "vulnerability", "name"])
                    .unwrap_or_else(|| "Unknown Vulnerability".to_string()),
                severity: text(&v, &["pocinfo.infoseg", "severity"]),
                cve_id: cve_of(&v),
                template_id: text(&v, &["pocinfo.id", "id"]),
                description: text(&v, &["pocinfo.infodescription", "description"]),
            })
        })
        .collect())
}

pub fn parse_dddd_json(raw: &str) -> Result<Vec<ParsedRecord>, ParseError> {
    Ok(json_items(raw, "data")?
        .into_iter()
        .map(|v| {
            ParsedRecord::Match(MatchRecord {
                matched_at: text(&v, &["target", "url", "host"]),
                name: text(&v, &["name", "vulnerability"])
                    .unwrap_or_else(|| "Unknown Vulnerability".to_string()),
                severity: text(&v, &["severity"]),
                cve_id: cve_of(&v),
                template_id: text(&v, &["id"]),
                description: text(&v, &["description"]),
            })
        })
        .collect())
}

fn path_record(v: &Value, base: Option<&str>) -> Option<PathRecord> {
    let url = text(v, &["url"]).or_else(|| {
        let base = Url::parse(base?).ok()?;
        base.join(&text(v, &["path"])?).ok().map(|u| u.to_string())
    });
    let path = text(v, &["path"])
        .or_else(|| Url::parse(url.as_deref()?).ok().map(|u| u.path().to_string()))?;
    Some(PathRecord {
        url,
        path,
        status: number(v, &["status"]).and_then(|s| u16::try_from(s).ok()),
        content_length: number(v, &["content-length", "content_length"]),
    })
}

/// dirsearch JSON reports: `{"results": [...]}`, a bare list, or the older
/// `{"<base url>": [...]}` layout.
pub fn parse_dirsearch_json(raw: &str) -> Result<Vec<ParsedRecord>, ParseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: Value = serde_json::from_str(raw)?;
    let mut records = Vec::new();
    match &doc {
        Value::Array(items) => {
            records.extend(items.iter().filter_map(|v| path_record(v, None)));
        }
        Value::Object(map) if map.contains_key("results") => {
            if let Some(Value::Array(items)) = map.get("results") {
                records.extend(items.iter().filter_map(|v| path_record(v, None)));
            }
        }
        Value::Object(map) => {
            for (base, entries) in map {
                if let Value::Array(items) = entries {
                    records.extend(items.iter().filter_map(|v| path_record(v, Some(base))));
                }
            }
        }
        _ => {}
    }
    Ok(records.into_iter().map(ParsedRecord::Path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(records: &[ParsedRecord]) -> Vec<&MatchRecord> {
        records
            .iter()
            .filter_map(|r| match r {
                ParsedRecord::Match(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fscan_lines_skip_noise_and_portless_entries() {
        let records = parse_fscan_jsonl(include_str!("../../fixtures/fscan_sample.jsonl"));
        assert_eq!(records.len(), 3);
        let ParsedRecord::OpenPort(mysql) = &records[1] else {
            panic!("expected an open port");
        };
        assert_eq!(mysql.port, 3306);
        assert_eq!(mysql.protocol, "tcp");
        assert_eq!(mysql.service_name.as_deref(), Some("mysql"));
    }

    #[test]
    fn nuclei_reads_nested_info_and_classification() {
        let records = parse_nuclei_jsonl(include_str!("../../fixtures/nuclei_sample.jsonl"));
        let found = matches(&records);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].name, "Apache 2.4.49 - Path Traversal");
        assert_eq!(found[0].severity.as_deref(), Some("critical"));
        assert_eq!(found[0].cve_id.as_deref(), Some("CVE-2021-41773"));
        assert_eq!(found[1].cve_id, None);
        assert_eq!(found[2].matched_at.as_deref(), Some("10.0.0.9:443"));
    }

    #[test]
    fn afrog_accepts_poc_info_and_flat_entries() {
        let records = parse_afrog_json(include_str!("../../fixtures/afrog_sample.json")).unwrap();
        let found = matches(&records);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "Spring Boot Actuator env unauthenticated");
        assert_eq!(found[0].severity.as_deref(), Some("high"));
        assert_eq!(found[0].matched_at.as_deref(), Some("http://10.0.0.8/actuator/env"));
        assert_eq!(found[1].name, "Directory listing");
    }

    #[test]
    fn dddd_reads_wrapped_data() {
        let records = parse_dddd_json(include_str!("../../fixtures/dddd_sample.json")).unwrap();
        let found = matches(&records);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].cve_id.as_deref(), Some("CVE-2020-0000"));
        assert_eq!(found[1].severity.as_deref(), Some("weird"));
    }

    #[test]
    fn dirsearch_reports_in_both_layouts() {
        let records =
            parse_dirsearch_json(include_str!("../../fixtures/dirsearch_sample.json")).unwrap();
        assert_eq!(records.len(), 2);
        let ParsedRecord::Path(admin) = &records[0] else {
            panic!("expected a path");
        };
        assert_eq!(admin.path, "/admin/");
        assert_eq!(admin.status, Some(200));
        assert_eq!(admin.content_length, Some(1543));

        let legacy = r#"{"http://10.0.0.3:80/": [{"status": 301, "path": "login", "content-length": 0}]}"#;
        let records = parse_dirsearch_json(legacy).unwrap();
        let ParsedRecord::Path(login) = &records[0] else {
            panic!("expected a path");
        };
        assert_eq!(login.url.as_deref(), Some("http://10.0.0.3/login"));
    }

    #[test]
    fn empty_documents_are_empty() {
        assert!(parse_afrog_json("").unwrap().is_empty());
        assert!(parse_dirsearch_json("  ").unwrap().is_empty());
        assert!(parse_dddd_json("not json").is_err());
    }
}
