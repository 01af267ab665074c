use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize, Clone)]
pub struct CaseOutcome {
    pub name: String,
    pub status: CaseStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap_free_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_sha256: Option<String>,
}

impl CaseOutcome {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CaseStatus::Skipped,
            duration_ms: 0,
            message: None,
            heap_free_bytes: None,
            reported_sha256: None,
        }
    }

    pub fn skipped(name: &str) -> Self {
        let mut outcome = Self::new(name);
        outcome.message = Some("skipped after earlier failure".to_string());
        outcome
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ResolvedConfig {
    pub script: PathBuf,
    pub firmware: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Clone)]
pub struct TestResult {
    pub result_schema_version: String,
    pub status: CaseStatus,
    pub firmware_hash: Option<String>,
    pub duration_ms: u64,
    pub cases: Vec<CaseOutcome>,
    pub config: ResolvedConfig,
}

impl TestResult {
    pub fn new(
        cases: Vec<CaseOutcome>,
        firmware_hash: Option<String>,
        duration_ms: u64,
        config: ResolvedConfig,
    ) -> Self {
        let status = if cases.iter().all(|c| c.status == CaseStatus::Pass) {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        };
        Self {
            result_schema_version: "1.0".to_string(),
            status,
            firmware_hash,
            duration_ms,
            cases,
            config,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Pass
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize result")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
    }

    pub fn write_junit(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_junit())
            .with_context(|| format!("Failed to write JUnit report {:?}", path))
    }

    pub fn to_junit(&self) -> String {
        let count = |status: CaseStatus| self.cases.iter().filter(|c| c.status == status).count();

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<testsuite name=\"bootcheck test\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">",
            self.cases.len(),
            count(CaseStatus::Fail),
            count(CaseStatus::Skipped),
            self.duration_ms as f64 / 1000.0
        );
        if let Some(hash) = &self.firmware_hash {
            let _ = writeln!(
                xml,
                "  <properties>\n    <property name=\"firmware_hash\" value=\"{}\"/>\n  </properties>",
                escape_xml(hash)
            );
        }

        for case in &self.cases {
            let _ = write!(
                xml,
                "  <testcase classname=\"bootcheck\" name=\"{}\" time=\"{:.3}\"",
                escape_xml(&case.name),
                case.duration_ms as f64 / 1000.0
            );
            let message = escape_xml(case.message.as_deref().unwrap_or_default());
            match case.status {
                CaseStatus::Pass => xml.push_str("/>\n"),
                CaseStatus::Fail => {
                    let _ = writeln!(
                        xml,
                        ">\n    <failure message=\"{}\"/>\n  </testcase>",
                        message
                    );
                }
                CaseStatus::Skipped => {
                    let _ = writeln!(
                        xml,
                        ">\n    <skipped message=\"{}\"/>\n  </testcase>",
                        message
                    );
                }
            }
        }

        xml.push_str("</testsuite>\n");
        xml
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            script: PathBuf::from("script.yaml"),
            firmware: Some(PathBuf::from("app.elf")),
            log: None,
            timeout_ms: 1000,
        }
    }

    fn outcome(name: &str, status: CaseStatus, message: Option<&str>) -> CaseOutcome {
        let mut o = CaseOutcome::new(name);
        o.status = status;
        o.message = message.map(str::to_string);
        o
    }

    #[test]
    fn test_overall_status() {
        let pass = TestResult::new(
            vec![outcome("hello_world", CaseStatus::Pass, None)],
            None,
            5,
            config(),
        );
        assert!(pass.passed());

        let fail = TestResult::new(
            vec![
                outcome("hello_world_host", CaseStatus::Fail, Some("mismatch")),
                outcome("hello_world", CaseStatus::Skipped, None),
            ],
            None,
            5,
            config(),
        );
        assert!(!fail.passed());
    }

    #[test]
    fn test_json_shape() {
        let result = TestResult::new(
            vec![outcome("hello_world", CaseStatus::Pass, None)],
            Some("2cf24dba".to_string()),
            12,
            config(),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "pass");
        assert_eq!(value["firmware_hash"], "2cf24dba");
        assert_eq!(value["cases"][0]["name"], "hello_world");
        assert!(value["cases"][0].get("message").is_none());
        assert_eq!(value["config"]["timeout_ms"], 1000);
    }

    #[test]
    fn test_junit_escapes_failure_message() {
        let result = TestResult::new(
            vec![outcome(
                "hello_world",
                CaseStatus::Fail,
                Some("Device output closed before pattern '<Hello & bye>'"),
            )],
            None,
            0,
            config(),
        );
        let junit = result.to_junit();
        assert!(junit.contains("<testsuite name=\"bootcheck test\" tests=\"1\" failures=\"1\""));
        assert!(junit.contains("&lt;Hello &amp; bye&gt;"));
        assert!(junit.contains("<failure"));
    }
}
