use std::{collections::BTreeMap, fmt};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use super::Labels;

/// The structured selector carried by workload specs and metric specs.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabelSelector {
    /// Map of `{key: value}` pairs, equivalent to an `In` requirement
    /// with a single value each.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements, ANDed together.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One parsed selector requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Requirement::Equals(key, value) => labels.get(key) == Some(value),
            Requirement::NotEquals(key, value) => labels.get(key) != Some(value),
            Requirement::In(key, values) => labels
                .get(key)
                .map_or(false, |v| values.iter().any(|c| c == v)),
            Requirement::NotIn(key, values) => labels
                .get(key)
                .map_or(true, |v| !values.iter().any(|c| c == v)),
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(key, value) => write!(f, "{}={}", key, value),
            Requirement::NotEquals(key, value) => write!(f, "{}!={}", key, value),
            Requirement::In(key, values) => write!(f, "{} in ({})", key, sorted(values)),
            Requirement::NotIn(key, values) => {
                write!(f, "{} notin ({})", key, sorted(values))
            },
            Requirement::Exists(key) => write!(f, "{}", key),
            Requirement::DoesNotExist(key) => write!(f, "!{}", key),
        }
    }
}

fn sorted(values: &[String]) -> String {
    let mut values = values.to_vec();
    values.sort();
    values.join(",")
}

/// A parsed label selector: the conjunction of its requirements.
///
/// Built either from the string grammar used by the scale subresource
/// status (`app=foo,env!=prod,tier in (web,cache)`) or from the
/// structured [`LabelSelector`] form. An empty selector matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(pub Vec<Requirement>);

impl Selector {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Selector::default());
        }
        let requirements = split_requirements(input)
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>>>()?;
        Ok(Selector(requirements))
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|requirement| requirement.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|requirement| requirement.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", joined)
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = anyhow::Error;

    fn try_from(selector: &LabelSelector) -> Result<Self> {
        let mut requirements = selector
            .match_labels
            .iter()
            .map(|(k, v)| Requirement::Equals(k.to_owned(), v.to_owned()))
            .collect::<Vec<_>>();
        for expression in &selector.match_expressions {
            let key = expression.key.to_owned();
            let requirement = match expression.operator {
                SelectorOperator::In | SelectorOperator::NotIn
                    if expression.values.is_empty() =>
                {
                    bail!("selector requirement on {} has no values", key)
                },
                SelectorOperator::In => Requirement::In(key, expression.values.to_owned()),
                SelectorOperator::NotIn => {
                    Requirement::NotIn(key, expression.values.to_owned())
                },
                SelectorOperator::Exists => Requirement::Exists(key),
                SelectorOperator::DoesNotExist => Requirement::DoesNotExist(key),
            };
            requirements.push(requirement);
        }
        Ok(Selector(requirements))
    }
}

impl From<&BTreeMap<String, String>> for Selector {
    fn from(labels: &BTreeMap<String, String>) -> Self {
        Selector(
            labels
                .iter()
                .map(|(k, v)| Requirement::Equals(k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

/// Split on commas that are not inside a value set's parentheses.
fn split_requirements(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth: u32 = 0;
    let mut start = 0;
    for (index, character) in input.char_indices() {
        match character {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..index]);
                start = index + 1;
            },
            _ => {},
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_requirement(input: &str) -> Result<Requirement> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty selector requirement");
    }
    if let Some(key) = input.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(validate_key(key.trim())?));
    }
    if let Some((key, value)) = split_operator(input, "!=") {
        return Ok(Requirement::NotEquals(validate_key(key)?, value.to_owned()));
    }
    if let Some((key, value)) = split_operator(input, "==") {
        return Ok(Requirement::Equals(validate_key(key)?, value.to_owned()));
    }
    if let Some((key, values)) = split_set_operator(input, "notin")? {
        return Ok(Requirement::NotIn(validate_key(&key)?, values));
    }
    if let Some((key, values)) = split_set_operator(input, "in")? {
        return Ok(Requirement::In(validate_key(&key)?, values));
    }
    if let Some((key, value)) = split_operator(input, "=") {
        return Ok(Requirement::Equals(validate_key(key)?, value.to_owned()));
    }
    Ok(Requirement::Exists(validate_key(input)?))
}

fn split_operator<'a>(input: &'a str, operator: &str) -> Option<(&'a str, &'a str)> {
    let index = input.find(operator)?;
    let key = input[..index].trim();
    let value = input[index + operator.len()..].trim();
    Some((key, value))
}

/// Match `key in (a,b)` / `key notin (a,b)`; the keyword must be
/// whitespace-separated from the key and followed by a value set.
fn split_set_operator(input: &str, keyword: &str) -> Result<Option<(String, Vec<String>)>> {
    let pattern = format!(" {}", keyword);
    let index = match input.find(&pattern) {
        Some(index) => index,
        None => return Ok(None),
    };
    let rest = input[index + pattern.len()..].trim_start();
    let rest = match rest.strip_prefix('(') {
        Some(rest) => rest,
        None => return Ok(None),
    };
    let values = rest
        .strip_suffix(')')
        .ok_or_else(|| anyhow!("unclosed value set in selector requirement {:?}", input))?;
    let values = values
        .split(',')
        .map(|value| value.trim().to_owned())
        .collect::<Vec<_>>();
    if values.is_empty() || values.iter().all(|value| value.is_empty()) {
        bail!("selector requirement {:?} has no values", input);
    }
    Ok(Some((input[..index].trim().to_owned(), values)))
}

fn validate_key(key: &str) -> Result<String> {
    if key.is_empty() {
        bail!("empty key in selector requirement");
    }
    if key.chars().any(char::is_whitespace) {
        bail!("invalid key {:?} in selector requirement", key);
    }
    Ok(key.to_owned())
}
