//! Declarative reversible-HTTP rules.
//!
//! A rule matches a commit-time POST (host, method, path, optional header
//! and body matchers) and describes how to derive the compensating request:
//! where the created resource's id comes from (`idFrom`) and the method and
//! path template of the reversal. Rules are evaluated in file order; the
//! first match wins.
//!
//! The registry is loaded from a sibling file under the policy directory
//! (`http-rollback.yaml`, `.yml`, or `.json` - YAML parsing accepts both
//! syntaxes). A missing file yields an empty registry.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors loading a rule registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The rule file exists but cannot be read.
    #[error("failed to read rollback rules: {0}")]
    Io(#[from] std::io::Error),

    /// The rule file is not valid YAML/JSON or violates the rule schema.
    #[error("malformed rollback rules: {0}")]
    Malformed(#[from] serde_yaml::Error),
}

/// Compensating request method. Only these two are accepted; anything else
/// is a configuration error at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackMethod {
    /// `DELETE` the created resource.
    #[serde(rename = "DELETE")]
    Delete,
    /// `POST` a compensating action.
    #[serde(rename = "POST")]
    Post,
}

impl RollbackMethod {
    /// The wire method name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Post => "POST",
        }
    }
}

/// How a commit-time request is recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMatch {
    /// HTTP method the rule applies to.
    #[serde(default = "default_method")]
    pub method: String,

    /// Wildcard pattern over the request path.
    #[serde(rename = "pathPattern", alias = "path")]
    pub path_pattern: String,

    /// Ordered id extraction sources: `header:<name>` or `json:<path>`.
    #[serde(rename = "idFrom", default)]
    pub id_from: Vec<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// How the compensating request is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSpec {
    /// Compensating method.
    pub method: RollbackMethod,

    /// Path template; `{id}` and other `{name}` placeholders are substituted
    /// from the resolved id and the response body.
    #[serde(rename = "pathTemplate")]
    pub path_template: String,

    /// Extra headers stamped on the compensating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// A JSON condition evaluated against the commit request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonMatcher {
    /// Dotted path expression, optionally prefixed `$.`.
    pub path: String,

    /// When set, the path must (or must not) resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,

    /// When set, the resolved value must equal this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
}

/// Additional conditions beyond host/method/path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Matchers {
    /// Header equality, case-insensitive names and values.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Body conditions.
    #[serde(default)]
    pub json: Vec<JsonMatcher>,
}

/// One reversible-HTTP rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRollbackRule {
    /// Rule name, recorded in receipts for audit.
    pub name: String,

    /// Wildcard pattern over the request host.
    #[serde(rename = "hostPattern", alias = "host")]
    pub host_pattern: String,

    /// Commit-time match.
    pub commit: CommitMatch,

    /// Compensation derivation.
    pub rollback: RollbackSpec,

    /// Extra conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matchers: Option<Matchers>,
}

/// The commit-time request a rule is matched against.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    /// Request host (no port).
    pub host: &'a str,
    /// Request method.
    pub method: &'a str,
    /// Request path.
    pub path: &'a str,
    /// Request headers.
    pub headers: &'a BTreeMap<String, String>,
    /// Parsed JSON body, when the body parsed.
    pub body: Option<&'a Value>,
}

/// A resolved compensation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRollback {
    /// The extracted resource id, when the template needed one.
    pub id: Option<String>,
    /// The concrete compensation path.
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<HttpRollbackRule>,
}

/// An ordered set of reversible-HTTP rules.
#[derive(Debug, Clone, Default)]
pub struct RollbackRuleRegistry {
    rules: Vec<HttpRollbackRule>,
}

impl RollbackRuleRegistry {
    /// An empty registry; every intent is treated as non-reversible by rule.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a registry from in-memory rules.
    #[must_use]
    pub fn from_rules(rules: Vec<HttpRollbackRule>) -> Self {
        Self { rules }
    }

    /// Loads rules from a YAML or JSON file.
    ///
    /// The file may be a bare list of rules or `{rules: [...]}`. A missing
    /// file yields an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on unreadable or malformed files.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::empty());
        }
        let raw = std::fs::read_to_string(path)?;
        let rules = match serde_yaml::from_str::<Vec<HttpRollbackRule>>(&raw) {
            Ok(rules) => rules,
            Err(_) => serde_yaml::from_str::<RuleFile>(&raw)?.rules,
        };
        Ok(Self { rules })
    }

    /// Looks for the registry file next to a policy path.
    ///
    /// `policy` may be the policy file itself or its directory; the sibling
    /// names tried are `http-rollback.yaml`, `http-rollback.yml`, and
    /// `http-rollback.json`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when a present file fails to parse.
    pub fn load_sibling(policy: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let policy = policy.as_ref();
        let dir = if policy.is_dir() {
            policy
        } else {
            policy.parent().unwrap_or_else(|| Path::new("."))
        };
        for name in ["http-rollback.yaml", "http-rollback.yml", "http-rollback.json"] {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Self::load(candidate);
            }
        }
        Ok(Self::empty())
    }

    /// The loaded rules in match order.
    #[must_use]
    pub fn rules(&self) -> &[HttpRollbackRule] {
        &self.rules
    }

    /// Finds the first rule matching a commit request.
    #[must_use]
    pub fn find_rule(&self, req: &CommitRequest<'_>) -> Option<&HttpRollbackRule> {
        self.rules.iter().find(|rule| rule_matches(rule, req))
    }

    /// Finds a rule by name.
    #[must_use]
    pub fn rule_named(&self, name: &str) -> Option<&HttpRollbackRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }
}

fn rule_matches(rule: &HttpRollbackRule, req: &CommitRequest<'_>) -> bool {
    if !wildcard_match(&rule.host_pattern, req.host) {
        return false;
    }
    if !rule.commit.method.eq_ignore_ascii_case(req.method) {
        return false;
    }
    if !wildcard_match(&rule.commit.path_pattern, req.path) {
        return false;
    }
    let Some(matchers) = &rule.matchers else {
        return true;
    };
    for (name, want) in &matchers.headers {
        let found = req
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v);
        match found {
            Some(got) if got.eq_ignore_ascii_case(want) => {},
            _ => return false,
        }
    }
    for matcher in &matchers.json {
        let resolved = req.body.and_then(|body| json_path(body, &matcher.path));
        if let Some(want_exists) = matcher.exists {
            if resolved.is_some() != want_exists {
                return false;
            }
        }
        if let Some(want) = &matcher.equals {
            if resolved != Some(want) {
                return false;
            }
        }
    }
    true
}

/// Resolves a rule's compensation against the commit response.
///
/// `idFrom` entries are consulted in order; the first yielding a scalar
/// wins. Returns `None` when the template needs a placeholder that cannot
/// be resolved - the rollback then falls to manual review.
#[must_use]
pub fn resolve(
    rule: &HttpRollbackRule,
    response_headers: &[(String, String)],
    response_body: Option<&Value>,
) -> Option<ResolvedRollback> {
    let id = rule.commit.id_from.iter().find_map(|source| {
        let (kind, locator) = source.split_once(':')?;
        match kind {
            "header" => response_headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(locator))
                .map(|(_, value)| value.clone()),
            "json" => response_body
                .and_then(|body| json_path(body, locator))
                .and_then(scalar_to_string),
            _ => None,
        }
    });

    let path = substitute_template(&rule.rollback.path_template, id.as_deref(), response_body)?;
    Some(ResolvedRollback { id, path })
}

/// Substitutes `{name}` placeholders. `{id}` takes the resolved id; other
/// names are looked up as top-level response body fields. Any unresolved
/// placeholder aborts the substitution.
fn substitute_template(template: &str, id: Option<&str>, body: Option<&Value>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}')?;
        let name = &after[..end];
        let value = if name == "id" {
            id.map(ToString::to_string)
        } else {
            body.and_then(|b| b.get(name)).and_then(scalar_to_string)
        };
        out.push_str(&value?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Matches `value` against a pattern where `*` spans any substring.
///
/// Supports the enumerated forms: literal, `prefix*`, bare `*`, and by
/// extension any single-or-multi `*` pattern.
#[must_use]
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut remainder = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            remainder = match remainder.strip_prefix(part) {
                Some(rest) => rest,
                None => return false,
            };
        } else if i == parts.len() - 1 {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(pos) => remainder = &remainder[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*' (or all segments consumed).
    parts.last().is_some_and(|p| p.is_empty()) || remainder.is_empty()
}

/// Resolves a dotted path expression against a JSON value.
///
/// Accepts an optional `$.` prefix, dotted object keys, and `[n]` array
/// indices, e.g. `$.items[0].id`.
#[must_use]
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = split_indices(segment)?;
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// Splits `items[0][1]` into `("items", [0, 1])`.
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let key = &segment[..bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let end = stripped.find(']')?;
        indices.push(stripped[..end].parse().ok()?);
        rest = &stripped[end + 1..];
    }
    if !rest.is_empty() {
        return None;
    }
    Some((key, indices))
}
