//! Field normalization and the computed-field resolver.
//!
//! An update is first normalized field by field; fields whose value does not
//! change are dropped. Compute rules then run in rounds: a rule fires when one
//! of its dependencies changed in the previous round, and rounds continue
//! until no rule changes anything. Compute graphs may be cyclic by value, so
//! convergence is the stopping criterion and [`MAX_COMPUTE_ROUNDS`] bounds it.

use crate::error::{DbError, Result};
use crate::schema::{CollectionSchema, FieldConfig};
use crate::types::{Document, Fields, Patch, ID_FIELD};
use serde_json::Value;

/// Maximum number of changing compute rounds for one document update.
pub const MAX_COMPUTE_ROUNDS: usize = 100;

/// Outcome of resolving an update against a stored document.
#[derive(Debug)]
pub(crate) struct Resolved {
    pub next: Document,
    /// Fields whose final value differs from the stored document, in
    /// declaration order.
    pub changed: Vec<String>,
}

impl Resolved {
    /// Patches restoring the previous values and reapplying the new ones.
    pub fn patches(&self, prev: &Document) -> (Patch, Patch) {
        let undo = self
            .changed
            .iter()
            .map(|f| (f.clone(), prev.get(f).cloned()))
            .collect();
        let redo = self
            .changed
            .iter()
            .map(|f| (f.clone(), self.next.get(f).cloned()))
            .collect();
        (undo, redo)
    }
}

fn normalize(config: &FieldConfig, value: Option<Value>, doc: &Fields) -> Option<Value> {
    match (value, &config.normalize) {
        (Some(value), Some(normalize)) => Some(normalize(value, doc)),
        (value, _) => value,
    }
}

fn field_equals(config: &FieldConfig, a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b, &config.equals) {
        (Some(a), Some(b), Some(equals)) => equals(a, b),
        _ => a == b,
    }
}

fn write(doc: &mut Fields, field: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            doc.insert(field.to_string(), value);
        }
        None => {
            doc.remove(field);
        }
    }
}

/// Apply `patch` on top of `target`, skipping fields equal to `baseline`.
///
/// Only declared fields are considered. Returns the effective changes.
fn merge_patch(
    schema: &CollectionSchema,
    patch: &Patch,
    baseline: &Fields,
    target: &mut Fields,
) -> Result<Patch> {
    let mut effective = Patch::new();
    for (name, config) in schema.fields() {
        let Some(value) = patch.get(name) else {
            continue;
        };
        let value = normalize(config, value.clone(), target);
        if value.as_ref().is_some_and(Value::is_null) && !config.nullable {
            return Err(DbError::InvalidDocument(format!(
                "{}.{} is not nullable",
                schema.name(),
                name
            )));
        }
        if field_equals(config, value.as_ref(), baseline.get(name)) {
            continue;
        }
        write(target, name, value.clone());
        effective.insert(name, value);
    }
    Ok(effective)
}

fn run_computes(
    schema: &CollectionSchema,
    prev: &Document,
    next: Fields,
    applied: Patch,
) -> Result<Fields> {
    let mut before_update = prev.fields().clone();
    let mut round_changes = applied;
    let mut before_round = next;
    let mut rounds = 0;

    loop {
        let mut after_round = before_round.clone();
        let mut produced = Patch::new();

        for rule in schema.computes() {
            if !rule.deps.iter().any(|d| round_changes.contains(d)) {
                continue;
            }
            let Some(computed) = (rule.compute)(&before_round, &before_update) else {
                continue;
            };
            // A rule only writes the fields it declares.
            let computed: Patch = computed
                .iter()
                .filter(|(field, _)| rule.mutates.iter().any(|m| m == *field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            let effective = merge_patch(schema, &computed, &before_round, &mut after_round)?;
            produced.merge(effective);
        }

        if produced.is_empty() {
            return Ok(after_round);
        }

        rounds += 1;
        if rounds > MAX_COMPUTE_ROUNDS {
            return Err(DbError::ComputeDiverged {
                collection: schema.name().to_string(),
                id: prev.id().unwrap_or_default().to_string(),
                rounds,
            });
        }

        before_update = std::mem::replace(&mut before_round, after_round);
        round_changes = produced;
    }
}

/// Resolve an update of `prev`.
///
/// Returns `None` when nothing changes.
pub(crate) fn resolve(
    schema: &CollectionSchema,
    prev: &Document,
    update: &Patch,
) -> Result<Option<Resolved>> {
    let mut next = prev.fields().clone();
    let applied = merge_patch(schema, update, prev.fields(), &mut next)?;
    if applied.is_empty() {
        return Ok(None);
    }

    let next = if schema.computes().is_empty() {
        next
    } else {
        run_computes(schema, prev, next, applied)?
    };

    if next.get(ID_FIELD) != prev.get(ID_FIELD) {
        return Err(DbError::InvalidDocument(format!(
            "cannot change the id of {}/{}",
            schema.name(),
            prev.id().unwrap_or_default()
        )));
    }

    let changed: Vec<String> = schema
        .fields()
        .filter(|(name, _)| next.get(*name) != prev.get(name))
        .map(|(name, _)| name.to_string())
        .collect();
    if changed.is_empty() {
        return Ok(None);
    }

    Ok(Some(Resolved {
        next: Document::new(next),
        changed,
    }))
}
