//! User-facing collection configuration.

use crate::db::Db;
use crate::error::Result;
use crate::types::{DocChange, Fields, Patch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Default delay between the last change of a collection and its write.
pub const DEFAULT_STORAGE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Declared kind of a field value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Boolean,
    Number,
    String,
    Array,
    Object,
    BooleanArray,
    NumberArray,
    StringArray,
    ArrayArray,
    ObjectArray,
}

/// Sort direction of a field index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexDirection {
    Asc,
    Desc,
}

pub type NormalizeFn = Rc<dyn Fn(Value, &Fields) -> Value>;
pub type EqualsFn = Rc<dyn Fn(&Value, &Value) -> bool>;
pub type CompareFn = Rc<dyn Fn(Option<&Value>, Option<&Value>) -> Ordering>;
pub type ComputeFn = Rc<dyn Fn(&Fields, &Fields) -> Option<Patch>>;
pub type ForeignComputeFn = Rc<dyn Fn(&Db, &[DocChange]) -> Result<()>>;

/// Declaration of one field.
#[derive(Clone)]
pub struct FieldConfig {
    pub kind: FieldKind,
    pub nullable: bool,
    /// Rewrites an incoming value given the document built so far.
    pub normalize: Option<NormalizeFn>,
    /// Replaces structural equality when deciding whether a value changed.
    pub equals: Option<EqualsFn>,
    /// Replaces the default index ordering.
    pub compare: Option<CompareFn>,
    pub index: Option<IndexDirection>,
}

impl FieldConfig {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            nullable: false,
            normalize: None,
            equals: None,
            compare: None,
            index: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldKind::String)
    }

    pub fn number() -> Self {
        Self::new(FieldKind::Number)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn index(mut self, direction: IndexDirection) -> Self {
        self.index = Some(direction);
        self
    }

    pub fn normalize(mut self, f: impl Fn(Value, &Fields) -> Value + 'static) -> Self {
        self.normalize = Some(Rc::new(f));
        self
    }

    pub fn equals(mut self, f: impl Fn(&Value, &Value) -> bool + 'static) -> Self {
        self.equals = Some(Rc::new(f));
        self
    }

    pub fn compare(
        mut self,
        f: impl Fn(Option<&Value>, Option<&Value>) -> Ordering + 'static,
    ) -> Self {
        self.compare = Some(Rc::new(f));
        self
    }
}

impl fmt::Debug for FieldConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldConfig")
            .field("kind", &self.kind)
            .field("nullable", &self.nullable)
            .field("normalize", &self.normalize.is_some())
            .field("equals", &self.equals.is_some())
            .field("compare", &self.compare.is_some())
            .field("index", &self.index)
            .finish()
    }
}

/// A local compute rule: recomputes `mutates` whenever one of `deps` changed.
///
/// The function receives the proposed document and the document as it stood
/// before the previous round, and returns the fields to overwrite.
#[derive(Clone)]
pub struct ComputeRule {
    pub deps: Vec<String>,
    pub mutates: Vec<String>,
    pub compute: ComputeFn,
}

impl ComputeRule {
    pub fn new(
        deps: &[&str],
        mutates: &[&str],
        compute: impl Fn(&Fields, &Fields) -> Option<Patch> + 'static,
    ) -> Self {
        Self {
            deps: deps.iter().map(|s| s.to_string()).collect(),
            mutates: mutates.iter().map(|s| s.to_string()).collect(),
            compute: Rc::new(compute),
        }
    }
}

impl fmt::Debug for ComputeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeRule")
            .field("deps", &self.deps)
            .field("mutates", &self.mutates)
            .finish()
    }
}

/// A rule reacting to changes of one collection by mutating others.
#[derive(Clone)]
pub struct ForeignComputeRule {
    /// Collections the rule writes to.
    pub mutates: Vec<String>,
    pub compute: ForeignComputeFn,
}

impl ForeignComputeRule {
    pub fn new(
        mutates: &[&str],
        compute: impl Fn(&Db, &[DocChange]) -> Result<()> + 'static,
    ) -> Self {
        Self {
            mutates: mutates.iter().map(|s| s.to_string()).collect(),
            compute: Rc::new(compute),
        }
    }
}

impl fmt::Debug for ForeignComputeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignComputeRule")
            .field("mutates", &self.mutates)
            .finish()
    }
}

/// Configuration of a collection.
#[derive(Clone, Debug)]
pub struct CollectionConfig {
    pub(crate) fields: Vec<(String, FieldConfig)>,
    pub(crate) computes: Vec<ComputeRule>,
    pub(crate) foreign_computes: Vec<ForeignComputeRule>,
    pub(crate) storage_key: Option<String>,
    pub(crate) storage_debounce: Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            computes: Vec::new(),
            foreign_computes: Vec::new(),
            storage_key: None,
            storage_debounce: DEFAULT_STORAGE_DEBOUNCE,
        }
    }
}

impl CollectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field. Redeclaring a name replaces the earlier entry in place.
    pub fn field(mut self, name: impl Into<String>, config: FieldConfig) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = config,
            None => self.fields.push((name, config)),
        }
        self
    }

    pub fn compute(mut self, rule: ComputeRule) -> Self {
        self.computes.push(rule);
        self
    }

    pub fn foreign_compute(mut self, rule: ForeignComputeRule) -> Self {
        self.foreign_computes.push(rule);
        self
    }

    /// Persist the collection under `key` through the blob store.
    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    pub fn storage_debounce(mut self, delay: Duration) -> Self {
        self.storage_debounce = delay;
        self
    }
}
