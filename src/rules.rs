// SPDX-License-Identifier: AGPL-3.0-or-later

//! Field rules for recipe metadata

use std::collections::BTreeMap;

use url::Url;

use crate::finding::{Finding, ItemKind};
use crate::licenses::{LicenseRegistry, Snapshot};
use crate::sandbox::{ScriptBindings, Value};

pub const SKIP_CHECKSUM: &str = "SKIP";
pub const SPDX_LIST_NOTE: &str =
    "A list of SPDX license identifiers can be found at https://spdx.org/licenses/.";

const REQUIRED_VARS: &[&str] = &["name", "version", "release"];
const REQUIRED_FUNCS: &[&str] = &["package"];

/// Fields whose own name contains `_`
const COMPOUND_FIELDS: &[&str] = &["build_vars", "build_deps", "opt_deps"];

const GIT_SOURCE_PARAMS: &[&str] = &["tag", "branch", "commit", "depth", "name"];
const ARCHIVE_SOURCE_PARAMS: &[&str] = &["archive"];

type Rule = fn(&Context<'_>, &str, &Value, &mut Vec<Finding>);

/// Registered fields and the rule each one is checked with
const RULES: &[(&str, Rule)] = &[
    ("release", check_release),
    ("epoch", check_epoch),
    ("homepage", check_homepage),
    ("maintainer", check_maintainer),
    ("architectures", check_architectures),
    ("license", check_license),
    ("provides", check_array),
    ("conflicts", check_array),
    ("deps", check_array),
    ("build_deps", check_array),
    ("opt_deps", check_array),
    ("replaces", check_array),
    ("backup", check_array),
    ("sources", check_sources),
    ("checksums", check_checksums),
    ("scripts", check_map),
];

struct Context<'a> {
    vars: &'a BTreeMap<String, Value>,
    licenses: &'a Snapshot,
}

/// Validate evaluated recipe bindings
pub fn validate(bindings: &ScriptBindings, registry: &LicenseRegistry) -> Vec<Finding> {
    let snapshot = registry.snapshot();
    let cx = Context {
        vars: &bindings.vars,
        licenses: &snapshot,
    };

    let mut findings = Vec::new();
    for name in REQUIRED_VARS {
        if bindings.var(name).is_none() {
            findings.push(Finding::variable(*name, "The {} is required"));
        }
    }
    for name in REQUIRED_FUNCS {
        if !bindings.has_function(name) {
            findings.push(Finding::new(ItemKind::Function, *name, "The {} is required"));
        }
    }

    for (name, value) in &bindings.vars {
        let field = canonical_field(name);
        if let Some((_, rule)) = RULES.iter().find(|(key, _)| *key == field) {
            rule(&cx, name, value, &mut findings);
        }
    }

    for finding in &mut findings {
        let lines = match finding.kind {
            ItemKind::Function => &bindings.func_lines,
            _ => &bindings.var_lines,
        };
        if let Some(line) = lines.get(&finding.name) {
            finding.line = *line;
        }
    }

    findings
}

/// Field a variable is validated as, with any override suffix removed
pub fn canonical_field(name: &str) -> &str {
    for field in COMPOUND_FIELDS {
        if name == *field
            || name
                .strip_prefix(field)
                .map_or(false, |rest| rest.starts_with('_'))
        {
            return field;
        }
    }
    name.split('_').next().unwrap_or(name)
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// An absolute URL, or an absolute path as sent in an HTTP request line
fn parse_request_uri(s: &str) -> Option<Url> {
    let url = if s.starts_with('/') {
        Url::parse("file:///").ok()?.join(s).ok()?
    } else {
        Url::parse(s).ok()?
    };
    (!url.cannot_be_a_base()).then_some(url)
}

fn is_url(s: &str) -> bool {
    parse_request_uri(s).is_some()
}

fn as_str<'v>(name: &str, value: &'v Value, findings: &mut Vec<Finding>) -> Option<&'v str> {
    match value {
        Value::Str(s) => Some(s),
        _ => {
            findings.push(Finding::variable(name, "The {} must be a string"));
            None
        }
    }
}

fn as_list<'v>(name: &str, value: &'v Value, findings: &mut Vec<Finding>) -> Option<&'v [String]> {
    match value {
        Value::List(items) => Some(items),
        _ => {
            findings.push(Finding::variable(name, "The {} must be an array"));
            None
        }
    }
}

fn check_release(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(release) = as_str(name, value, findings) else {
        return;
    };
    let digits = release.strip_prefix('-').unwrap_or(release);
    if !is_numeric(digits) {
        findings.push(Finding::variable(name, "The {} must be an integer"));
    }
}

fn check_epoch(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(epoch) = as_str(name, value, findings) else {
        return;
    };
    if !is_numeric(epoch) {
        findings.push(Finding::variable(name, "The {} must be a positive integer"));
    }
}

fn check_homepage(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(homepage) = as_str(name, value, findings) else {
        return;
    };
    if !is_url(homepage) {
        findings.push(Finding::variable(name, "The {} must be a valid URL"));
    }
}

fn check_maintainer(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(maintainer) = as_str(name, value, findings) else {
        return;
    };
    let parsed = mailparse::addrparse(maintainer)
        .ok()
        .and_then(|list| list.extract_single_info())
        .filter(|info| info.addr.contains('@'));
    let Some(info) = parsed else {
        findings.push(Finding::variable(
            name,
            "The {} must be a valid RFC 5322 address",
        ));
        return;
    };
    let has_name = info
        .display_name
        .as_deref()
        .map_or(false, |display| !display.trim().is_empty());
    if !has_name {
        findings.push(Finding::variable(
            name,
            "The {} must contain a name and email (e.g. Jane Doe <jane@example.com>)",
        ));
    }
}

fn check_architectures(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(archs) = as_list(name, value, findings) else {
        return;
    };
    if archs.iter().any(|arch| arch == "noarch" || arch == "any") {
        findings.push(Finding::variable(
            name,
            "The {} must be set to 'all' to represent noarch/any",
        ));
    }
}

fn check_license(cx: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(licenses) = as_list(name, value, findings) else {
        return;
    };
    for license in licenses {
        if license.to_lowercase().contains("custom") || cx.licenses.lookup(license).is_some() {
            continue;
        }
        let mut message = format!(
            "The {{}} contains an invalid SPDX license identifier: '{}'.",
            license
        );
        if let Some(similar) = cx.licenses.suggest(license) {
            message.push_str(&format!(" Did you mean '{}'?", similar));
        }
        findings.push(Finding::variable(name, message).with_extra(SPDX_LIST_NOTE));
    }
}

fn check_array(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    as_list(name, value, findings);
}

fn check_map(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    if !matches!(value, Value::Map(_)) {
        findings.push(Finding::variable(name, "The {} must be a map"));
    }
}

fn check_sources(_: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(sources) = as_list(name, value, findings) else {
        return;
    };
    for (i, source) in sources.iter().enumerate() {
        let Some(url) = parse_request_uri(source) else {
            findings.push(Finding::element(name, i, "The {} must be a valid URL"));
            continue;
        };

        let valid = if url.scheme().starts_with("git+") {
            GIT_SOURCE_PARAMS
        } else {
            ARCHIVE_SOURCE_PARAMS
        };
        let mut reported = Vec::new();
        for (param, _) in url.query_pairs() {
            let Some(param) = param.strip_prefix('~') else {
                continue;
            };
            if valid.contains(&param) || reported.iter().any(|seen: &String| seen == param) {
                continue;
            }
            reported.push(param.to_string());
            findings.push(Finding::element(
                name,
                i,
                format!("The {{}} contains an invalid parameter name '~{}'", param),
            ));
        }
    }
}

fn check_checksums(cx: &Context<'_>, name: &str, value: &Value, findings: &mut Vec<Finding>) {
    let Some(checksums) = as_list(name, value, findings) else {
        return;
    };

    let sources_name = name.replacen("checksums", "sources", 1);
    let sources_len = match cx.vars.get(&sources_name) {
        Some(Value::List(sources)) => sources.len(),
        _ => 0,
    };
    if sources_len != checksums.len() {
        findings.push(Finding::new(
            ItemKind::Array,
            name,
            "The {} is not the same size as its corresponding sources array",
        ));
    }

    for (i, checksum) in checksums.iter().enumerate() {
        if checksum == SKIP_CHECKSUM {
            continue;
        }
        if checksum.len() != 64 {
            findings.push(Finding::element(
                name,
                i,
                "The {} contains an invalid SHA256 checksum. SHA256 hashes must be 64 characters in length.",
            ));
        } else if hex::decode(checksum).is_err() {
            findings.push(Finding::element(
                name,
                i,
                "The {} contains an invalid SHA256 checksum. SHA256 hashes must be valid hexadecimal.",
            ));
        }
    }
}
