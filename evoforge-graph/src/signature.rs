//! # Node Signatures
//!
//! A signature is the named input/output contract of a node, written as
//! `"a, b -> c, d"`. Whitespace around `,` and `->` is ignored. Field names
//! are identifiers (`[A-Za-z_][A-Za-z0-9_]*`), unique within each side, and
//! each side has at least one field.

use crate::error::{self, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parsed input/output contract of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl Signature {
    /// Parse a signature string
    pub fn parse(source: &str) -> Result<Self> {
        let (lhs, rhs) = source
            .split_once("->")
            .ok_or_else(|| error::invalid_signature(source, "signature must contain '->'"))?;

        if rhs.contains("->") {
            return Err(error::invalid_signature(source, "signature contains more than one '->'"));
        }

        let inputs = parse_side(source, lhs, "input")?;
        let outputs = parse_side(source, rhs, "output")?;

        Ok(Self { inputs, outputs })
    }

    /// Declared input fields, in order
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Declared output fields, in order
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn has_input(&self, field: &str) -> bool {
        self.inputs.iter().any(|f| f == field)
    }

    pub fn has_output(&self, field: &str) -> bool {
        self.outputs.iter().any(|f| f == field)
    }
}

fn parse_side(source: &str, side: &str, label: &str) -> Result<Vec<String>> {
    let mut fields: Vec<String> = Vec::new();

    for raw in side.split(',') {
        let name = raw.trim();
        if name.is_empty() {
            return Err(error::invalid_signature(
                source,
                format!("empty {} field name", label),
            ));
        }
        if !is_ident(name) {
            return Err(error::invalid_signature(
                source,
                format!("'{}' is not a valid {} field name", name, label),
            )
            .with_context("field", name));
        }
        if fields.iter().any(|f| f == name) {
            return Err(error::invalid_signature(
                source,
                format!("duplicate {} field '{}'", label, name),
            )
            .with_context("field", name));
        }
        fields.push(name.to_string());
    }

    Ok(fields)
}

fn is_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.to_string()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.inputs.join(", "), self.outputs.join(", "))
    }
}
