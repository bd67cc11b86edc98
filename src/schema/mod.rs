//! Collection schemas.
//!
//! A [`CollectionConfig`] is compiled once, at definition time, into a
//! [`CollectionSchema`]: field lookups by name, resolved index comparators
//! and validated compute rules.

mod config;

pub use config::{
    CollectionConfig, CompareFn, ComputeFn, ComputeRule, EqualsFn, FieldConfig, FieldKind,
    ForeignComputeFn, ForeignComputeRule, IndexDirection, NormalizeFn, DEFAULT_STORAGE_DEBOUNCE,
};

use crate::error::{DbError, Result};
use crate::index::{default_comparator, directed, Comparator};
use crate::types::{Document, Fields, Patch, ID_FIELD};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Compiled configuration of one collection.
pub struct CollectionSchema {
    name: String,
    fields: Vec<(String, FieldConfig)>,
    positions: HashMap<String, usize>,
    comparators: Vec<(String, Comparator)>,
    computes: Vec<ComputeRule>,
    foreign_computes: Vec<ForeignComputeRule>,
    storage_key: Option<String>,
    storage_debounce: Duration,
}

impl CollectionSchema {
    /// Validate a configuration and resolve its lookup tables.
    pub fn compile(name: &str, config: CollectionConfig) -> Result<Self> {
        let mut fields = config.fields;
        if !fields.iter().any(|(n, _)| n == ID_FIELD) {
            fields.insert(0, (ID_FIELD.to_string(), FieldConfig::string()));
        }

        let positions: HashMap<String, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, (n, _))| (n.clone(), i))
            .collect();

        for rule in &config.computes {
            for field in rule.deps.iter().chain(&rule.mutates) {
                if !positions.contains_key(field) {
                    return Err(DbError::InvalidConfig(format!(
                        "compute rule of {} names undeclared field {}",
                        name, field
                    )));
                }
            }
        }

        let mut comparators = Vec::new();
        for (field, field_config) in &fields {
            let Some(direction) = field_config.index else {
                continue;
            };
            let comparator = match &field_config.compare {
                Some(compare) => Some(directed(compare.clone(), direction)),
                None => default_comparator(field_config.kind, direction),
            };
            match comparator {
                Some(comparator) => comparators.push((field.clone(), comparator)),
                None => {
                    return Err(DbError::InvalidConfig(format!(
                        "comparator must be set to index {}/{}",
                        name, field
                    )))
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            fields,
            positions,
            comparators,
            computes: config.computes,
            foreign_computes: config.foreign_computes,
            storage_key: config.storage_key,
            storage_debounce: config.storage_debounce,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldConfig)> {
        self.fields.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn field(&self, name: &str) -> Option<&FieldConfig> {
        self.positions.get(name).map(|&i| &self.fields[i].1)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Indexed fields and their resolved comparators.
    pub fn indexed_fields(&self) -> impl Iterator<Item = (&str, &Comparator)> {
        self.comparators.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn computes(&self) -> &[ComputeRule] {
        &self.computes
    }

    pub fn foreign_computes(&self) -> &[ForeignComputeRule] {
        &self.foreign_computes
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    pub fn storage_debounce(&self) -> Duration {
        self.storage_debounce
    }

    /// Keep only the declared fields of a document.
    pub fn project(&self, doc: &Document) -> Document {
        let fields: Fields = self
            .fields
            .iter()
            .filter_map(|(name, _)| doc.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        Document::new(fields)
    }

    /// Project `doc` and reject `null` in fields not declared nullable.
    pub fn admit(&self, doc: &Document) -> Result<Document> {
        let doc = self.project(doc);
        for (name, config) in &self.fields {
            if !config.nullable && doc.get(name).is_some_and(Value::is_null) {
                return Err(DbError::InvalidDocument(format!(
                    "{}.{} is not nullable",
                    self.name, name
                )));
            }
        }
        Ok(doc)
    }

    /// A patch turning any stored document into `doc`: every declared field
    /// is set, or removed when `doc` lacks it.
    pub fn overwrite_patch(&self, doc: &Document) -> Patch {
        self.fields
            .iter()
            .map(|(name, _)| (name.clone(), doc.get(name).cloned()))
            .collect()
    }
}

impl fmt::Debug for CollectionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionSchema")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("computes", &self.computes.len())
            .field("foreign_computes", &self.foreign_computes.len())
            .field("storage_key", &self.storage_key)
            .finish()
    }
}
