//! Offline hash-chain verification of a decision log.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use super::canonical::{event_hash, EVENT_HASH, GENESIS, PREV_HASH};

/// Outcome class of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Ok,
    MissingLog,
    EmptyLog,
    /// The log exists but could not be read.
    Unreadable,
    InvalidJson,
    MissingHashFields,
    PrevHashMismatch,
    EventHashMismatch,
    LegacyAfterHashed,
    NoHashedEvents,
}

impl VerifyStatus {
    pub fn code(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MissingLog => "missing_log",
            Self::EmptyLog => "empty_log",
            Self::Unreadable => "unreadable_log",
            Self::InvalidJson => "invalid_json",
            Self::MissingHashFields => "missing_hash_fields",
            Self::PrevHashMismatch => "prev_hash_mismatch",
            Self::EventHashMismatch => "event_hash_mismatch",
            Self::LegacyAfterHashed => "legacy_after_hashed",
            Self::NoHashedEvents => "no_hashed_events",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub status: VerifyStatus,
    /// Final `event_hash` of a valid chain.
    pub last_hash: Option<String>,
    /// Hashed entries fully validated (before the failure, if any).
    pub count: usize,
    /// 1-based line of the failing entry.
    pub line: Option<usize>,
}

impl VerifyReport {
    fn fail(status: VerifyStatus, count: usize, line: Option<usize>) -> Self {
        Self {
            ok: false,
            status,
            last_hash: None,
            count,
            line,
        }
    }

    /// The final hash for a valid chain, otherwise the status code.
    pub fn summary(&self) -> &str {
        match (&self.last_hash, self.ok) {
            (Some(hash), true) => hash,
            _ => self.status.code(),
        }
    }

    /// Missing or empty logs are "nothing to verify" rather than tampering.
    pub fn is_absent(&self) -> bool {
        matches!(self.status, VerifyStatus::MissingLog | VerifyStatus::EmptyLog)
    }
}

/// Walk the log in file order and check every link.
///
/// Blank lines are skipped. Un-hashed legacy entries are tolerated only
/// before the first hashed entry.
pub fn verify_log(path: &Path) -> VerifyReport {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return VerifyReport::fail(VerifyStatus::MissingLog, 0, None)
        }
        Err(_) => return VerifyReport::fail(VerifyStatus::Unreadable, 0, None),
    };

    let mut prev = GENESIS.to_string();
    let mut count = 0usize;
    let mut seen_lines = 0usize;
    let mut seen_hashed = false;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let lineno = idx + 1;
        let Ok(line) = line else {
            return VerifyReport::fail(VerifyStatus::Unreadable, count, Some(lineno));
        };
        if line.trim().is_empty() {
            continue;
        }
        seen_lines += 1;

        let entry = match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(map)) => map,
            _ => return VerifyReport::fail(VerifyStatus::InvalidJson, count, Some(lineno)),
        };

        let stored_prev = entry.get(PREV_HASH).and_then(Value::as_str);
        let stored_hash = entry.get(EVENT_HASH).and_then(Value::as_str);

        let (stored_prev, stored_hash) = match (stored_prev, stored_hash) {
            (Some(p), Some(h)) => (p, h),
            (None, None) if !entry.contains_key(PREV_HASH) && !entry.contains_key(EVENT_HASH) => {
                if seen_hashed {
                    return VerifyReport::fail(VerifyStatus::LegacyAfterHashed, count, Some(lineno));
                }
                continue;
            }
            _ => return VerifyReport::fail(VerifyStatus::MissingHashFields, count, Some(lineno)),
        };
        seen_hashed = true;

        if stored_prev != prev {
            return VerifyReport::fail(VerifyStatus::PrevHashMismatch, count, Some(lineno));
        }
        if event_hash(&entry, stored_prev) != stored_hash {
            return VerifyReport::fail(VerifyStatus::EventHashMismatch, count, Some(lineno));
        }

        prev = stored_hash.to_string();
        count += 1;
    }

    if seen_lines == 0 {
        return VerifyReport::fail(VerifyStatus::EmptyLog, 0, None);
    }
    if !seen_hashed {
        return VerifyReport::fail(VerifyStatus::NoHashedEvents, 0, None);
    }

    VerifyReport {
        ok: true,
        status: VerifyStatus::Ok,
        last_hash: Some(prev),
        count,
        line: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::io::Write;

    fn seal(payload: Value, prev: &str) -> (String, String) {
        let mut map: Map<String, Value> = payload.as_object().cloned().unwrap();
        let hash = event_hash(&map, prev);
        map.insert(PREV_HASH.into(), json!(prev));
        map.insert(EVENT_HASH.into(), json!(hash));
        (serde_json::to_string(&map).unwrap(), hash)
    }

    fn write(dir: &Path, lines: &[String]) -> std::path::PathBuf {
        let path = dir.join("decisions.jsonl");
        let mut f = File::create(&path).unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        path
    }

    fn chain(n: usize) -> (Vec<String>, String) {
        let mut prev = GENESIS.to_string();
        let mut lines = Vec::new();
        for i in 0..n {
            let (line, hash) = seal(json!({"id": i, "trace_id": format!("t{i}")}), &prev);
            lines.push(line);
            prev = hash;
        }
        (lines, prev)
    }

    #[test]
    fn missing_and_empty_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let r = verify_log(&dir.path().join("none.jsonl"));
        assert_eq!((r.ok, r.status), (false, VerifyStatus::MissingLog));

        let path = write(dir.path(), &["".into(), "   ".into()]);
        let r = verify_log(&path);
        assert_eq!((r.ok, r.status), (false, VerifyStatus::EmptyLog));
        assert!(r.is_absent());
    }

    #[test]
    fn valid_chain_with_blank_lines_and_leading_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lines, last) = chain(3);
        lines.insert(0, r#"{"legacy": true}"#.to_string());
        lines.insert(2, String::new());
        let r = verify_log(&write(dir.path(), &lines));
        assert!(r.ok, "{r:?}");
        assert_eq!(r.count, 3);
        assert_eq!(r.summary(), last);
    }

    #[test]
    fn failure_statuses_table() {
        let (lines, _) = chain(3);
        let tampered = lines[1].replace("\"t1\"", "\"tX\"");
        let half: Value = serde_json::from_str(&lines[1]).unwrap();
        let mut half = half.as_object().cloned().unwrap();
        half.remove(EVENT_HASH);

        let cases: Vec<(Vec<String>, VerifyStatus, usize)> = vec![
            (
                vec![lines[0].clone(), "{not json".into()],
                VerifyStatus::InvalidJson,
                1,
            ),
            (
                vec![lines[0].clone(), serde_json::to_string(&half).unwrap()],
                VerifyStatus::MissingHashFields,
                1,
            ),
            (
                vec![lines[0].clone(), lines[2].clone()],
                VerifyStatus::PrevHashMismatch,
                1,
            ),
            (
                vec![lines[0].clone(), tampered, lines[2].clone()],
                VerifyStatus::EventHashMismatch,
                1,
            ),
            (
                vec![lines[0].clone(), r#"{"legacy": 1}"#.into()],
                VerifyStatus::LegacyAfterHashed,
                1,
            ),
            (
                vec![r#"{"legacy": 1}"#.into(), r#"{"legacy": 2}"#.into()],
                VerifyStatus::NoHashedEvents,
                0,
            ),
        ];

        for (content, expected, count) in cases {
            let dir = tempfile::tempdir().unwrap();
            let r = verify_log(&write(dir.path(), &content));
            assert!(!r.ok);
            assert_eq!(r.status, expected);
            assert_eq!(r.count, count, "{expected:?}");
            assert_eq!(r.summary(), expected.code());
        }
    }
}
