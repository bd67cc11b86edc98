//! Default field comparators.
//!
//! Present values sort first, then `null`, then unset fields. The direction
//! only reverses the order among present values.

use crate::schema::{FieldKind, IndexDirection};
use serde_json::Value;
use std::cmp::Ordering;
use std::rc::Rc;

/// Orders two field values. `None` is an unset field.
pub type Comparator = Rc<dyn Fn(Option<&Value>, Option<&Value>) -> Ordering>;

/// Order unset and `null` values after everything else.
///
/// Returns `None` when both values are present and non-null.
pub fn compare_nil(a: Option<&Value>, b: Option<&Value>) -> Option<Ordering> {
    match (a, b) {
        (None, None) => Some(Ordering::Equal),
        (None, _) => Some(Ordering::Greater),
        (_, None) => Some(Ordering::Less),
        (Some(Value::Null), Some(Value::Null)) => Some(Ordering::Equal),
        (Some(Value::Null), _) => Some(Ordering::Greater),
        (_, Some(Value::Null)) => Some(Ordering::Less),
        _ => None,
    }
}

fn compare_booleans(a: &Value, b: &Value) -> Ordering {
    match (a.as_bool(), b.as_bool()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => Ordering::Equal,
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

fn compare_strings(a: &Value, b: &Value) -> Ordering {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

/// The default comparator for a field kind, if it has one.
///
/// Arrays and objects have no natural order and need a custom comparator.
pub fn default_comparator(kind: FieldKind, direction: IndexDirection) -> Option<Comparator> {
    let present: fn(&Value, &Value) -> Ordering = match kind {
        FieldKind::Boolean => compare_booleans,
        FieldKind::Number => compare_numbers,
        FieldKind::String => compare_strings,
        _ => return None,
    };

    Some(Rc::new(move |a: Option<&Value>, b: Option<&Value>| {
        if let Some(ordering) = compare_nil(a, b) {
            return ordering;
        }
        match (a, b) {
            (Some(a), Some(b)) => match direction {
                IndexDirection::Asc => present(a, b),
                IndexDirection::Desc => present(b, a),
            },
            _ => Ordering::Equal,
        }
    }))
}

/// Wrap a custom comparator for an index direction.
pub fn directed(compare: Comparator, direction: IndexDirection) -> Comparator {
    match direction {
        IndexDirection::Asc => compare,
        IndexDirection::Desc => Rc::new(move |a: Option<&Value>, b: Option<&Value>| compare(b, a)),
    }
}
