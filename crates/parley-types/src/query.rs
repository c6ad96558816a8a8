use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::document::Document;

/// Upper bound appended to a prefix for range-based prefix search.
pub const PREFIX_SENTINEL: char = '\u{f8ff}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Channels,
    ChannelMembers,
    Messages,
    Users,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Channels,
        Collection::ChannelMembers,
        Collection::Messages,
        Collection::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channels => "channels",
            Self::ChannelMembers => "channelMembers",
            Self::Messages => "messages",
            Self::Users => "users",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gte(String, Value),
    Lte(String, Value),
    IsNull(String),
    NotNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Serialize) -> Self {
        Self::Eq(field.into(), to_value(value))
    }

    pub fn gte(field: &str, value: impl Serialize) -> Self {
        Self::Gte(field.into(), to_value(value))
    }

    pub fn lte(field: &str, value: impl Serialize) -> Self {
        Self::Lte(field.into(), to_value(value))
    }

    pub fn is_null(field: &str) -> Self {
        Self::IsNull(field.into())
    }

    pub fn not_null(field: &str) -> Self {
        Self::NotNull(field.into())
    }

    /// `field >= prefix && field <= prefix + U+F8FF`
    pub fn prefix(field: &str, prefix: &str) -> Self {
        Self::And(vec![
            Self::gte(field, prefix),
            Self::lte(field, format!("{prefix}{PREFIX_SENTINEL}")),
        ])
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Eq(field, value) => doc.field(field) == *value,
            Self::Gte(field, bound) => matches!(
                compare_values(&doc.field(field), bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lte(field, bound) => matches!(
                compare_values(&doc.field(field), bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::IsNull(field) => doc.field(field).is_null(),
            Self::NotNull(field) => !doc.field(field).is_null(),
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

/// Compare two scalars of the same JSON type. Mixed types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order used for sorting: null < bool < number < string < others.
fn order_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    compare_values(a, b).unwrap_or_else(|| rank(a).cmp(&rank(b)))
}

/// A collection read: filter, ascending ordering and optional limit.
/// Results sharing every ordering field are ordered by document id.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: Collection,
    pub filter: Option<Filter>,
    pub order_by: Vec<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Add a filter; repeated calls are combined with AND.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            None => filter,
            Some(Filter::And(mut all)) => {
                all.push(filter);
                Filter::And(all)
            }
            Some(existing) => Filter::And(vec![existing, filter]),
        });
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by.push(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filter.as_ref().is_none_or(|f| f.matches(doc))
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        self.order_by
            .iter()
            .map(|field| order_values(&a.field(field), &b.field(field)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Filter, sort and truncate a candidate set.
    pub fn evaluate(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
        out.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// The store assigns the new document's id.
    Insert {
        collection: Collection,
        data: Map<String, Value>,
    },
    /// Merge top-level fields into an existing document.
    Update {
        collection: Collection,
        id: Uuid,
        fields: Map<String, Value>,
    },
    Delete { collection: Collection, id: Uuid },
}

impl Mutation {
    pub fn insert<T: Serialize>(collection: Collection, model: &T) -> serde_json::Result<Self> {
        Ok(Self::Insert {
            collection,
            data: crate::document::to_object(model)?,
        })
    }

    pub fn update(collection: Collection, id: Uuid, fields: Map<String, Value>) -> Self {
        Self::Update {
            collection,
            id,
            fields,
        }
    }

    pub fn delete(collection: Collection, id: Uuid) -> Self {
        Self::Delete { collection, id }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. } => *collection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(data: Value) -> Document {
        match data {
            Value::Object(map) => Document::new(Uuid::new_v4(), map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn prefix_filter_bounds_the_range() {
        let filter = Filter::prefix("username", "Ja");
        assert!(filter.matches(&doc(json!({ "username": "Jane Doe" }))));
        assert!(filter.matches(&doc(json!({ "username": "Ja" }))));
        assert!(!filter.matches(&doc(json!({ "username": "Jb" }))));
        assert!(!filter.matches(&doc(json!({ "username": "J" }))));
        assert!(!filter.matches(&doc(json!({}))));
    }

    #[test]
    fn or_filter_and_null_checks() {
        let filter = Filter::Or(vec![Filter::eq("a", 1), Filter::is_null("b")]);
        assert!(filter.matches(&doc(json!({ "a": 1, "b": 2 }))));
        assert!(filter.matches(&doc(json!({ "a": 2 }))));
        assert!(!filter.matches(&doc(json!({ "a": 2, "b": 3 }))));
        assert!(Filter::not_null("b").matches(&doc(json!({ "b": false }))));
    }

    #[test]
    fn evaluate_sorts_with_id_tiebreak() {
        let query = Query::new(Collection::Messages)
            .filter(Filter::eq("channelId", "c"))
            .order_by("timestamp");

        let mut a = doc(json!({ "channelId": "c", "timestamp": 5 }));
        let mut b = doc(json!({ "channelId": "c", "timestamp": 5 }));
        a.id = Uuid::from_u128(2);
        b.id = Uuid::from_u128(1);
        let c = doc(json!({ "channelId": "c", "timestamp": 1 }));
        let other = doc(json!({ "channelId": "d", "timestamp": 0 }));

        let out = query.evaluate(vec![a.clone(), b.clone(), c.clone(), other]);
        let ids: Vec<Uuid> = out.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![c.id, b.id, a.id]);
    }

    #[test]
    fn chained_filters_are_conjunctive() {
        let query = Query::new(Collection::Users)
            .filter(Filter::eq("a", 1))
            .filter(Filter::eq("b", 2))
            .filter(Filter::eq("c", 3));
        assert!(matches!(&query.filter, Some(Filter::And(all)) if all.len() == 3));
        assert!(query.matches(&doc(json!({ "a": 1, "b": 2, "c": 3 }))));
        assert!(!query.matches(&doc(json!({ "a": 1, "b": 2 }))));
    }

    #[test]
    fn collection_names_round_trip() {
        for c in Collection::ALL {
            assert_eq!(Collection::parse(c.as_str()), Some(c));
        }
        assert_eq!(Collection::parse("nope"), None);
    }
}
