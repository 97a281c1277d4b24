// SPDX-License-Identifier: AGPL-3.0-or-later

//! Report generation and output formatting for local checks

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde_json::json;
use std::path::Path;

use crate::finding::Finding;
use crate::review::APPROVAL_NOTE;
use crate::rules::canonical_field;

/// Rule ID used for recipes that could not be evaluated
const EVALUATION_RULE: &str = "evaluation";

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format
    Json,
    /// SARIF format (for GitHub Code Scanning)
    Sarif,
}

/// Result of checking one recipe file
#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: String,
    pub findings: Vec<Finding>,
    /// Set when the recipe could not be evaluated
    pub error: Option<String>,
}

impl FileReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.error.is_none()
    }
}

pub struct Reporter {
    format: OutputFormat,
}

impl Reporter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn render(&self, reports: &[FileReport]) -> Result<String> {
        match self.format {
            OutputFormat::Text => Ok(self.format_text(reports)),
            OutputFormat::Json => self.format_json(reports),
            OutputFormat::Sarif => self.format_sarif(reports),
        }
    }

    /// Write to `path`, or stdout when none is given
    pub fn output(&self, reports: &[FileReport], path: Option<&Path>) -> Result<()> {
        let output = self.render(reports)?;
        if let Some(path) = path {
            std::fs::write(path, &output)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        } else {
            print!("{}", output);
        }
        Ok(())
    }

    fn format_text(&self, reports: &[FileReport]) -> String {
        let mut output = String::new();
        for report in reports {
            output.push_str(&format!("{}:\n", report.path));
            if let Some(error) = &report.error {
                output.push_str(&format!("\tError running script: {}\n", error));
                continue;
            }
            if report.findings.is_empty() {
                output.push_str(&format!("\t{}\n", APPROVAL_NOTE));
                continue;
            }
            for finding in &report.findings {
                output.push_str(&format!(
                    "\tLine {}: {}\n",
                    finding.reported_line(),
                    finding.render(false)
                ));
                if let Some(extra) = &finding.extra {
                    output.push_str(&format!("\t\t{}\n", extra));
                }
            }
        }
        output
    }

    fn format_json(&self, reports: &[FileReport]) -> Result<String> {
        let files: Vec<_> = reports
            .iter()
            .map(|report| {
                json!({
                    "path": report.path,
                    "error": report.error,
                    "findings": report.findings.iter().map(|finding| json!({
                        "line": finding.reported_line(),
                        "item": finding.item_ref(false),
                        "message": finding.render(false),
                        "extra": finding.extra,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&json!({ "files": files }))?)
    }

    fn format_sarif(&self, reports: &[FileReport]) -> Result<String> {
        // SARIF 2.1.0 format for GitHub Code Scanning
        let sarif = json!({
            "$schema": "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/master/Schemata/sarif-schema-2.1.0.json",
            "version": "2.1.0",
            "runs": [{
                "tool": {
                    "driver": {
                        "name": "lurebot",
                        "version": env!("CARGO_PKG_VERSION"),
                        "rules": self.extract_rules(reports)
                    }
                },
                "results": self.extract_sarif_results(reports)
            }]
        });

        Ok(serde_json::to_string_pretty(&sarif)?)
    }

    fn extract_rules(&self, reports: &[FileReport]) -> Vec<serde_json::Value> {
        let mut seen = std::collections::BTreeSet::new();
        for report in reports {
            if report.error.is_some() {
                seen.insert(EVALUATION_RULE);
            }
            for finding in &report.findings {
                seen.insert(canonical_field(&finding.name));
            }
        }

        seen.into_iter()
            .map(|id| {
                json!({
                    "id": id,
                    "shortDescription": { "text": format!("Checks the {} field", id) },
                    "defaultConfiguration": { "level": "error" }
                })
            })
            .collect()
    }

    fn extract_sarif_results(&self, reports: &[FileReport]) -> Vec<serde_json::Value> {
        let location = |path: &str, line: u32| {
            json!([{
                "physicalLocation": {
                    "artifactLocation": { "uri": path },
                    "region": { "startLine": line }
                }
            }])
        };

        let mut results = Vec::new();
        for report in reports {
            if let Some(error) = &report.error {
                results.push(json!({
                    "ruleId": EVALUATION_RULE,
                    "level": "error",
                    "message": { "text": format!("Error running script: {}", error) },
                    "locations": location(&report.path, 1)
                }));
            }
            for finding in &report.findings {
                let text = match &finding.extra {
                    Some(extra) => format!("{} {}", finding.render(false), extra),
                    None => finding.render(false),
                };
                results.push(json!({
                    "ruleId": canonical_field(&finding.name),
                    "level": "error",
                    "message": { "text": text },
                    "locations": location(&report.path, finding.reported_line())
                }));
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports() -> Vec<FileReport> {
        let mut license = Finding::variable("license", "The {} contains 'MIT0', which is not a valid SPDX license identifier. Did you mean 'MIT-0'?")
            .with_extra("A list of SPDX license identifiers can be found at https://spdx.org/licenses/.");
        license.line = 5;
        vec![
            FileReport {
                path: "hello/lure.sh".into(),
                findings: Vec::new(),
                error: None,
            },
            FileReport {
                path: "world/lure.sh".into(),
                findings: vec![Finding::variable("name", "The {} is required"), license],
                error: None,
            },
            FileReport {
                path: "bad/lure.sh".into(),
                findings: Vec::new(),
                error: Some("line 2: unterminated quote".into()),
            },
        ]
    }

    #[test]
    fn test_text_format() {
        let text = Reporter::new(OutputFormat::Text).render(&reports()).unwrap();
        assert_eq!(
            text,
            "hello/lure.sh:\n\
             \tNo issues found!\n\
             world/lure.sh:\n\
             \tLine 1: The name variable is required\n\
             \tLine 5: The license variable contains 'MIT0', which is not a valid SPDX license identifier. Did you mean 'MIT-0'?\n\
             \t\tA list of SPDX license identifiers can be found at https://spdx.org/licenses/.\n\
             bad/lure.sh:\n\
             \tError running script: line 2: unterminated quote\n"
        );
    }

    #[test]
    fn test_json_format() {
        let json = Reporter::new(OutputFormat::Json).render(&reports()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let files = value["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[1]["findings"][1]["line"], 5);
        assert_eq!(files[1]["findings"][1]["item"], "license variable");
        assert!(files[2]["error"].is_string());
    }

    #[test]
    fn test_sarif_format() {
        let sarif = Reporter::new(OutputFormat::Sarif).render(&reports()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&sarif).unwrap();
        assert_eq!(value["version"], "2.1.0");

        let rules: Vec<_> = value["runs"][0]["tool"]["driver"]["rules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|rule| rule["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(rules, vec!["evaluation", "license", "name"]);

        let results = value["runs"][0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[1]["locations"][0]["physicalLocation"]["region"]["startLine"],
            5
        );
    }

    #[test]
    fn test_is_clean() {
        let reports = reports();
        assert!(reports[0].is_clean());
        assert!(!reports[1].is_clean());
        assert!(!reports[2].is_clean());
    }
}
