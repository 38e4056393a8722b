//! Queries: filters, ordering, limits and cursor bounds.

use crate::document::Document;
use crate::key::DocumentKey;
use crate::path::{FieldPath, ResourcePath};
use crate::target::Target;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Comparison operator of a [`FieldFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// Array field contains the value.
    ArrayContains,
    /// Array field contains any of the values.
    ArrayContainsAny,
    /// Field equals one of the values.
    In,
    /// Field equals none of the values.
    NotIn,
}

impl Operator {
    fn symbol(self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    /// Returns true for operators that restrict a range of values.
    #[must_use]
    pub fn is_inequality(self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn matches_comparison(self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

/// A predicate on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Field being tested.
    pub field: FieldPath,
    /// Operator.
    pub op: Operator,
    /// Right-hand operand.
    pub value: Value,
}

impl FieldFilter {
    /// Creates a field filter.
    pub fn new(field: impl Into<FieldPath>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Returns true if `doc` satisfies the filter.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        let key_value;
        let field_value = if self.field.is_key_field() {
            key_value = Value::Reference(doc.key().clone());
            Some(&key_value)
        } else {
            doc.field(&self.field)
        };

        match self.op {
            Operator::ArrayContains => field_value.is_some_and(|v| v.array_contains(&self.value)),
            Operator::ArrayContainsAny => match (field_value.and_then(Value::as_array), self.value.as_array()) {
                (Some(values), Some(candidates)) => values.iter().any(|v| candidates.contains(v)),
                _ => false,
            },
            Operator::In => field_value.is_some_and(|v| self.value.array_contains(v)),
            Operator::NotIn => {
                if self.value.array_contains(&Value::Null) {
                    return false;
                }
                field_value.is_some_and(|v| !v.is_null() && !self.value.array_contains(v))
            }
            Operator::NotEqual => {
                field_value.is_some_and(|v| self.op.matches_comparison(v.compare(&self.value)))
            }
            _ => field_value.is_some_and(|v| {
                v.type_order() == self.value.type_order()
                    && self.op.matches_comparison(v.compare(&self.value))
            }),
        }
    }

    fn canonical_id(&self) -> String {
        format!("{}{}{}", self.field, self.op.symbol(), self.value.canonical_id())
    }
}

/// How a [`CompositeFilter`] combines its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeOperator {
    /// All members must match.
    And,
    /// At least one member must match.
    Or,
}

/// A conjunction or disjunction of filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeFilter {
    /// Combinator.
    pub op: CompositeOperator,
    /// Members.
    pub filters: Vec<Filter>,
}

/// A query predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Single field comparison.
    Field(FieldFilter),
    /// Nested AND/OR.
    Composite(CompositeFilter),
}

impl Filter {
    /// Shorthand for a field filter.
    pub fn field(field: impl Into<FieldPath>, op: Operator, value: impl Into<Value>) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    /// Conjunction of `filters`.
    #[must_use]
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::And,
            filters,
        })
    }

    /// Disjunction of `filters`.
    #[must_use]
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::Or,
            filters,
        })
    }

    /// Returns true if `doc` satisfies the filter.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Field(f) => f.matches(doc),
            Filter::Composite(c) => match c.op {
                CompositeOperator::And => c.filters.iter().all(|f| f.matches(doc)),
                CompositeOperator::Or => c.filters.iter().any(|f| f.matches(doc)),
            },
        }
    }

    /// Returns every field filter nested in this filter.
    #[must_use]
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(f) => vec![f],
            Filter::Composite(c) => c.filters.iter().flat_map(Filter::flattened).collect(),
        }
    }

    /// Returns true if this filter contains an OR anywhere.
    #[must_use]
    pub fn contains_disjunction(&self) -> bool {
        match self {
            Filter::Field(_) => false,
            Filter::Composite(c) => {
                c.op == CompositeOperator::Or || c.filters.iter().any(Filter::contains_disjunction)
            }
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        match self {
            Filter::Field(f) => f.canonical_id(),
            Filter::Composite(c) => {
                let members: Vec<String> = c.filters.iter().map(Filter::canonical_id).collect();
                let op = match c.op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                format!("{op}({})", members.join(","))
            }
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

impl Direction {
    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

/// One ordering component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to order by.
    pub field: FieldPath,
    /// Direction.
    pub direction: Direction,
}

impl OrderBy {
    /// Creates an ordering component.
    pub fn new(field: impl Into<FieldPath>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Compares two documents on this component only.
    #[must_use]
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            a.key().cmp(b.key())
        } else {
            match (a.field(&self.field), b.field(&self.field)) {
                (Some(x), Some(y)) => x.compare(y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let dir = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{dir}", self.field)
    }
}

/// A cursor position matching the query's ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    /// One value per ordering component (prefix allowed).
    pub position: Vec<Value>,
    /// Whether documents exactly at the position are included.
    pub inclusive: bool,
}

impl Bound {
    /// Creates a bound.
    #[must_use]
    pub fn new(position: Vec<Value>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], doc: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match component {
                    Value::Reference(key) => key.cmp(doc.key()),
                    other => other.compare(&Value::Reference(doc.key().clone())),
                }
            } else {
                match doc.field(&order.field) {
                    Some(value) => component.compare(value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Returns true if the bound, used as a start, admits `doc`.
    #[must_use]
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Returns true if the bound, used as an end, admits `doc`.
    #[must_use]
    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(Value::canonical_id).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }
}

/// Whether a limit keeps the first or the last results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    /// Keep the first N results.
    First,
    /// Keep the last N results, still returned in query order.
    Last,
}

/// A query against a collection, a collection group, or one document.
///
/// Equality and hashing go through [`Query::canonical_id`], so two queries
/// that normalize to the same form share a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Creates a query for the documents at `path`.
    ///
    /// An even-length path is a single-document query; otherwise the query
    /// returns the collection's immediate children.
    #[must_use]
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Creates a query over the collection at `path`.
    #[must_use]
    pub fn collection(path: &str) -> Self {
        Self::at_path(ResourcePath::new(path))
    }

    /// Creates a query over every collection named `collection_id`.
    #[must_use]
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::empty());
        query.collection_group = Some(collection_id.into());
        query
    }

    /// Creates a query for exactly one document.
    #[must_use]
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    /// Adds a filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a field filter.
    #[must_use]
    pub fn where_field(self, field: &str, op: Operator, value: impl Into<Value>) -> Self {
        self.filter(Filter::field(FieldPath::new(field), op, value))
    }

    /// Adds an ordering component.
    #[must_use]
    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(FieldPath::new(field), direction));
        self
    }

    /// Keeps only the first `limit` results.
    #[must_use]
    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    /// Keeps only the last `limit` results.
    #[must_use]
    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    /// Starts results at `bound`.
    #[must_use]
    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    /// Ends results at `bound`.
    #[must_use]
    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Returns a copy with a different limit.
    #[must_use]
    pub fn with_limit(&self, limit: Option<u32>, limit_type: LimitType) -> Self {
        let mut query = self.clone();
        query.limit = limit;
        query.limit_type = limit_type;
        query
    }

    /// The base path.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The collection group id, for collection group queries.
    #[must_use]
    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    /// Top-level filters (combined with AND).
    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Orderings exactly as added.
    #[must_use]
    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    /// The limit, if any.
    #[must_use]
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Whether the limit keeps the head or the tail.
    #[must_use]
    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    /// Returns true if a limit keeping the head is set.
    #[must_use]
    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    /// Returns true if a limit keeping the tail is set.
    #[must_use]
    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    /// The start bound.
    #[must_use]
    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    /// The end bound.
    #[must_use]
    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    /// Returns true if this query targets exactly one document.
    #[must_use]
    pub fn is_document_query(&self) -> bool {
        self.collection_group.is_none()
            && DocumentKey::is_document_key(&self.path)
            && self.filters.is_empty()
    }

    /// Returns true for collection group queries.
    #[must_use]
    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Returns true if the query returns its whole collection unfiltered.
    #[must_use]
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Fields constrained by inequality filters, sorted.
    #[must_use]
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|f| f.op.is_inequality())
            .map(|f| f.field.clone())
            .collect()
    }

    /// The full ordering: explicit orders, then inequality fields, then
    /// the document key, the implicit ones in the last explicit direction.
    #[must_use]
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field.clone()).collect();
        let last_direction = result
            .last()
            .map_or(Direction::Ascending, |o| o.direction);

        for field in self.inequality_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_field()) {
            result.push(OrderBy::new(FieldPath::key_field(), last_direction));
        }
        result
    }

    /// Returns true if `doc` belongs in this query's (unlimited) results.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        doc.is_found_document()
            && self.matches_path(doc)
            && self.matches_order_by(doc)
            && self.filters.iter().all(|f| f.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if let Some(group) = &self.collection_group {
            doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        // Ordering on a field implies the field must exist.
        self.explicit_order_by
            .iter()
            .all(|o| o.field.is_key_field() || doc.field(&o.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Returns a total order over documents consistent with this query.
    #[must_use]
    pub fn comparator(&self) -> impl Fn(&Document, &Document) -> Ordering + Send + Sync + 'static {
        let order_by = self.normalized_order_by();
        move |a, b| {
            for order in &order_by {
                let ordering = order.compare(a, b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        }
    }

    /// Converts the query into the target sent to the server.
    ///
    /// Limit-to-last queries are sent with every ordering flipped and the
    /// bounds swapped; results are flipped back locally.
    #[must_use]
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|o| OrderBy::new(o.field, o.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    /// A string that is equal for equivalent queries.
    #[must_use]
    pub fn canonical_id(&self) -> String {
        let lt = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{lt}", self.to_target().canonical_id())
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Query {}

impl Hash for Query {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_id().hash(state);
    }
}
