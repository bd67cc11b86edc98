//! Bounded range reads over one field index.

use serde_json::Value;
use std::ops::Bound;

/// A range read over the index of `order_by`.
///
/// Bounds are positions in index order: for a descending index `start_at`
/// takes the larger value.
#[derive(Clone, Debug)]
pub struct Query {
    pub collection: String,
    pub order_by: String,
    pub limit: Option<usize>,
    pub start: Bound<Value>,
    pub end: Bound<Value>,
}

impl Query {
    pub fn new(collection: impl Into<String>, order_by: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            limit: None,
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Start at `value`, inclusive.
    pub fn start_at(mut self, value: impl Into<Value>) -> Self {
        self.start = Bound::Included(value.into());
        self
    }

    /// Start after `value`.
    pub fn start_after(mut self, value: impl Into<Value>) -> Self {
        self.start = Bound::Excluded(value.into());
        self
    }

    /// End at `value`, inclusive.
    pub fn end_at(mut self, value: impl Into<Value>) -> Self {
        self.end = Bound::Included(value.into());
        self
    }

    /// End before reaching `value`.
    pub fn end_after(mut self, value: impl Into<Value>) -> Self {
        self.end = Bound::Excluded(value.into());
        self
    }

    pub(crate) fn bounds(&self) -> (Bound<&Value>, Bound<&Value>) {
        (self.start.as_ref(), self.end.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unbounded_by_default() {
        let query = Query::new("person", "age");
        assert_eq!(query.bounds(), (Bound::Unbounded, Bound::Unbounded));
        assert_eq!(query.limit, None);
    }

    #[test]
    fn test_later_bound_replaces_earlier() {
        let query = Query::new("person", "age")
            .start_at(1)
            .start_after(2)
            .end_after(9)
            .end_at(8)
            .limit(5);

        let two = json!(2);
        let eight = json!(8);
        assert_eq!(
            query.bounds(),
            (Bound::Excluded(&two), Bound::Included(&eight))
        );
        assert_eq!(query.limit, Some(5));
    }
}
