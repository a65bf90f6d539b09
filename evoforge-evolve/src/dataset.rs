//! # Dataset
//!
//! A finite sequence of examples: named input fields plus optional expected
//! fields the scorer may compare against.
//!
//! On disk a dataset is JSON, either a bare array of examples or an object
//! with an `id`:
//!
//! ```json
//! {"id": "arith", "examples": [
//!   {"inputs": {"question": "3 + 2 - 1?"}, "expected": {"answer": "4"}}
//! ]}
//! ```

use crate::error::{Error, Result};
use evoforge_graph::Fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// One evaluation example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub inputs: Fields,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub expected: Fields,
}

impl Example {
    pub fn new(inputs: Fields) -> Self {
        Self {
            inputs,
            expected: Fields::new(),
        }
    }

    pub fn with_expected(mut self, expected: Fields) -> Self {
        self.expected = expected;
        self
    }

    /// Expected field as text, if present
    pub fn expected_str(&self, field: &str) -> Option<String> {
        self.expected.get(field).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub examples: Vec<Example>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Named { id: String, examples: Vec<Example> },
    Bare(Vec<Example>),
}

impl Dataset {
    pub fn new(id: impl Into<String>, examples: Vec<Example>) -> Self {
        Self {
            id: id.into(),
            examples,
        }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Load a dataset; a bare array takes its id from the file stem
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).with_context("path", path.display().to_string()))?;
        let parsed: DatasetFile = serde_json::from_str(&text).map_err(|e| {
            Error::parse_failed(format!("invalid dataset {}: {}", path.display(), e)).set_source(e)
        })?;

        Ok(match parsed {
            DatasetFile::Named { id, examples } => Self { id, examples },
            DatasetFile::Bare(examples) => Self {
                id: path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("dataset")
                    .to_string(),
                examples,
            },
        })
    }
}
