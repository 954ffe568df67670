//! Fluent construction of path queries.

use crate::expr::Expr;
use crate::graph::EdgePredicate;
use crate::planner::{PathQuery, PathSegment, QueryTail};
use crate::plan::SortOrder;

/// Builder for [`PathQuery`] values.
///
/// ```
/// use plasma::builder::PathQueryBuilder;
/// use plasma::expr::Expr;
///
/// let query = PathQueryBuilder::new()
///     .segment("synth", &["music", "synths", "synth"])
///     .filter(Expr::ge(Expr::prop("synth", "score"), Expr::lit(0.6)))
///     .project("synth", &["label"])
///     .build();
/// assert_eq!(query.segments.len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct PathQueryBuilder {
    query: PathQuery,
}

impl PathQueryBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a path segment walking the given edge labels.
    pub fn segment(mut self, var: impl Into<String>, labels: &[&str]) -> Self {
        self.query.segments.push(PathSegment {
            var: var.into(),
            preds: labels
                .iter()
                .map(|l| EdgePredicate::Label((*l).to_owned()))
                .collect(),
        });
        self
    }

    /// Appends a path segment with explicit edge predicates.
    pub fn segment_with(mut self, var: impl Into<String>, preds: Vec<EdgePredicate>) -> Self {
        self.query.segments.push(PathSegment {
            var: var.into(),
            preds,
        });
        self
    }

    /// Sets the filter expression.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.query.filter = Some(expr);
        self
    }

    /// Adds a projected variable with the properties to publish; an empty
    /// list projects the bare node id.
    pub fn project(mut self, var: impl Into<String>, props: &[&str]) -> Self {
        self.query
            .projection
            .get_or_insert_with(Vec::new)
            .push((var.into(), props.iter().map(|p| (*p).to_owned()).collect()));
        self
    }

    /// Orders results by a property, ascending.
    pub fn sort(self, var: impl Into<String>, prop: impl Into<String>) -> Self {
        self.sorted(var, prop, SortOrder::Asc)
    }

    /// Orders results by a property with an explicit direction.
    pub fn sorted(
        mut self,
        var: impl Into<String>,
        prop: impl Into<String>,
        order: SortOrder,
    ) -> Self {
        self.query.tail.push(QueryTail::Sort {
            var: var.into(),
            prop: prop.into(),
            order,
        });
        self
    }

    /// Keeps the tuple with the smallest property value.
    pub fn min(mut self, var: impl Into<String>, prop: impl Into<String>) -> Self {
        self.query.tail.push(QueryTail::Min {
            var: var.into(),
            prop: prop.into(),
        });
        self
    }

    /// Keeps the tuple with the largest property value.
    pub fn max(mut self, var: impl Into<String>, prop: impl Into<String>) -> Self {
        self.query.tail.push(QueryTail::Max {
            var: var.into(),
            prop: prop.into(),
        });
        self
    }

    /// Emits the numeric mean of a property.
    pub fn average(mut self, var: impl Into<String>, prop: impl Into<String>) -> Self {
        self.query.tail.push(QueryTail::Average {
            var: var.into(),
            prop: prop.into(),
        });
        self
    }

    /// Emits the number of results.
    pub fn count(mut self) -> Self {
        self.query.tail.push(QueryTail::Count);
        self
    }

    /// Emits a random sample of `n` results.
    pub fn choose(mut self, n: usize) -> Self {
        self.query.tail.push(QueryTail::Choose(n));
        self
    }

    /// Passes the first `n` results, then shuts the stream down.
    pub fn limit(mut self, n: usize) -> Self {
        self.query.tail.push(QueryTail::Limit(n));
        self
    }

    /// Finishes the query.
    pub fn build(self) -> PathQuery {
        self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_segments_filter_and_tail() {
        let query = PathQueryBuilder::new()
            .segment("net", &["net"])
            .segment("synth", &["music", "synths", "synth"])
            .filter(Expr::ge(Expr::prop("synth", "score"), Expr::lit(0.6)))
            .project("synth", &["label"])
            .limit(2)
            .build();

        assert_eq!(query.segments.len(), 2);
        assert_eq!(query.segments[1].preds.len(), 3);
        assert!(query.filter.is_some());
        assert_eq!(query.tail, vec![QueryTail::Limit(2)]);
    }

    #[test]
    fn project_accumulates_fields_in_order() {
        let query = PathQueryBuilder::new()
            .segment("a", &["x"])
            .project("a", &[])
            .project("a", &["label", "score"])
            .build();
        let projection = query.projection.unwrap();
        assert_eq!(projection.len(), 2);
        assert!(projection[0].1.is_empty());
        assert_eq!(projection[1].1, vec!["label", "score"]);
    }
}
