//! Zone definitions shared by the configuration file, the management API
//! and the resolver.
//!
//! These types are serialised using [`serde`](https://serde.rs/).  A record
//! carries exactly one matcher, either an exact name or a regular
//! expression, written as `{"name": ..., "ip": ...}` or
//! `{"regexp": ..., "ip": ...}` respectively.

use std::net::Ipv4Addr;

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};

/// A locally-owned DNS domain suffix with its own record set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// Suffix owned by this zone, e.g. `internal.`.
    pub name: String,
    #[serde(default)]
    pub records: Vec<Record>,
    /// Answer used when the zone owns a name but no record matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ip: Option<Ipv4Addr>,
}

/// One name-or-pattern to address mapping within a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RecordDef", into = "RecordDef")]
pub struct Record {
    pub matcher: Matcher,
    pub ip: Ipv4Addr,
}

/// How a record is compared against the query name once the zone suffix
/// has been stripped.
#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Exact(exact) => !exact.is_empty() && exact.eq_ignore_ascii_case(name),
            Matcher::Pattern(re) => re.is_match(name).unwrap_or(false),
        }
    }
}

impl Record {
    pub fn exact(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            matcher: Matcher::Exact(name.into()),
            ip,
        }
    }

    pub fn pattern(re: &str, ip: Ipv4Addr) -> Result<Self, fancy_regex::Error> {
        Ok(Self {
            matcher: Matcher::Pattern(Regex::new(re)?),
            ip,
        })
    }
}

/// Wire shape of a [`Record`].
#[derive(Serialize, Deserialize)]
struct RecordDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regexp: Option<String>,
    ip: Ipv4Addr,
}

impl TryFrom<RecordDef> for Record {
    type Error = String;

    fn try_from(def: RecordDef) -> Result<Self, Self::Error> {
        match (def.name, def.regexp) {
            (Some(name), None) => Ok(Record::exact(name, def.ip)),
            (None, Some(re)) => {
                Record::pattern(&re, def.ip).map_err(|e| format!("invalid regexp {:?}: {}", re, e))
            }
            (Some(_), Some(_)) => Err("record must not set both `name` and `regexp`".into()),
            (None, None) => Err("record must set one of `name` or `regexp`".into()),
        }
    }
}

impl From<Record> for RecordDef {
    fn from(record: Record) -> Self {
        let (name, regexp) = match record.matcher {
            Matcher::Exact(name) => (Some(name), None),
            Matcher::Pattern(re) => (None, Some(re.as_str().to_string())),
        };
        Self {
            name,
            regexp,
            ip: record.ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_both_matcher_forms() {
        let zone: Zone = serde_json::from_str(
            r#"{
                "name": "internal.",
                "records": [
                    {"name": "gateway", "ip": "192.168.127.1"},
                    {"regexp": "^vm-[0-9]+$", "ip": "192.168.127.3"}
                ],
                "default_ip": "192.168.127.254"
            }"#,
        )
        .unwrap();

        assert_eq!(zone.records.len(), 2);
        assert!(matches!(&zone.records[0].matcher, Matcher::Exact(n) if n == "gateway"));
        assert!(zone.records[1].matcher.matches("vm-12"));
        assert!(!zone.records[1].matcher.matches("vm-x"));
        assert_eq!(zone.default_ip, Some(Ipv4Addr::new(192, 168, 127, 254)));
    }

    #[test]
    fn rejects_record_without_matcher() {
        let res = serde_json::from_str::<Record>(r#"{"ip": "10.0.0.1"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn rejects_record_with_both_matchers() {
        let res = serde_json::from_str::<Record>(
            r#"{"name": "a", "regexp": "^a$", "ip": "10.0.0.1"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn rejects_invalid_pattern() {
        let res = serde_json::from_str::<Record>(r#"{"regexp": "(", "ip": "10.0.0.1"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn serializes_pattern_as_source() {
        let record = Record::pattern("^db$", Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"regexp": "^db$", "ip": "10.0.0.2"}));
    }

    #[test]
    fn empty_exact_name_never_matches() {
        assert!(!Matcher::Exact(String::new()).matches(""));
        assert!(Matcher::Exact("Web".into()).matches("web"));
    }
}
