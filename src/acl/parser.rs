use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::acl::network::{NetworkRange, RangeError};

/// One item of the YAML ACL document, before compilation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    pub from: Vec<String>,
    pub to: Vec<String>,
    /// Omitted or empty means any port.
    #[serde(default)]
    pub port: Vec<i64>,
}

/// A compiled allow rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEntry {
    pub sources: Vec<NetworkRange>,
    pub destinations: Vec<NetworkRange>,
    /// Kept verbatim; values outside 0..=65535 simply never match.
    pub ports: Vec<i64>,
}

/// Compiled ACL, evaluated first-match-wins in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    entries: Vec<RuleEntry>,
}

impl RuleSet {
    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("ACL entry #{entry}: no source ranges")]
    NoSources { entry: usize },
    #[error("ACL entry #{entry}: no destination ranges")]
    NoDestinations { entry: usize },
    #[error("ACL entry #{entry}: invalid source: {source}")]
    InvalidSource { entry: usize, source: RangeError },
    #[error("ACL entry #{entry}: invalid destination: {source}")]
    InvalidDestination { entry: usize, source: RangeError },
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("Malformed ACL document: {0}")]
    Syntax(#[from] serde_yaml::Error),
    #[error("Invalid ACL rule: {0}")]
    Rule(#[from] RuleError),
}

fn compile_ranges(
    values: &[String],
    entry: usize,
    wrap: fn(usize, RangeError) -> RuleError,
) -> Result<Vec<NetworkRange>, RuleError> {
    values
        .iter()
        .map(|value| NetworkRange::parse(value).map_err(|e| wrap(entry, e)))
        .collect()
}

/// Compiles every entry or fails on the first bad one; nothing is skipped.
pub fn compile(definitions: &[RuleDefinition]) -> Result<RuleSet, RuleError> {
    let mut entries = Vec::with_capacity(definitions.len());

    for (entry, definition) in definitions.iter().enumerate() {
        if definition.from.is_empty() {
            return Err(RuleError::NoSources { entry });
        }
        if definition.to.is_empty() {
            return Err(RuleError::NoDestinations { entry });
        }

        let sources = compile_ranges(&definition.from, entry, |entry, source| {
            RuleError::InvalidSource { entry, source }
        })?;
        let destinations = compile_ranges(&definition.to, entry, |entry, source| {
            RuleError::InvalidDestination { entry, source }
        })?;

        entries.push(RuleEntry {
            sources,
            destinations,
            ports: definition.port.clone(),
        });
    }

    Ok(RuleSet { entries })
}

pub fn parse_acl_document(input: &str) -> Result<Vec<RuleDefinition>, serde_yaml::Error> {
    // An empty document is an empty list, not a type error.
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(input)
}

pub fn parse_rules(input: &str) -> Result<RuleSet, AclError> {
    let definitions = parse_acl_document(input)?;
    Ok(compile(&definitions)?)
}

pub fn load_rules_from_file(path: &Path) -> anyhow::Result<RuleSet> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("while reading ACL file {}", path.display()))?;
    let rules = parse_rules(&contents).context("while parsing ACL rules")?;
    info!("Parsed {} ACL rules from {}", rules.len(), path.display());
    Ok(rules)
}
