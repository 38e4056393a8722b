//! Property-based test generators using proptest.
//!
//! Keys are drawn from a small id space so generated writes collide often
//! enough to exercise overlays and batch ordering.

use docsync_model::{DocumentKey, Mutation, ObjectValue, Value};
use proptest::prelude::*;

/// Strategy for document ids out of a pool of `pool` names.
pub fn document_id_strategy(pool: usize) -> impl Strategy<Value = String> {
    (0..pool.max(1)).prop_map(|i| format!("doc{i}"))
}

/// Strategy for keys in `collection`.
pub fn document_key_strategy(collection: &'static str, pool: usize) -> impl Strategy<Value = DocumentKey> {
    document_id_strategy(pool).prop_map(move |id| {
        DocumentKey::parse(&format!("{collection}/{id}")).expect("Invalid generated key")
    })
}

/// Strategy for scalar field values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Boolean),
        (-1000i64..1000).prop_map(Value::Integer),
        (-1000.0f64..1000.0).prop_map(Value::Double),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

/// Strategy for flat document data over a few field names.
pub fn object_value_strategy() -> impl Strategy<Value = ObjectValue> {
    prop::collection::btree_map("[a-c]", scalar_value_strategy(), 0..4)
        .prop_map(|fields| fields.into_iter().collect())
}

/// Strategy for a set, update or delete of a key in `collection`.
pub fn mutation_strategy(collection: &'static str, pool: usize) -> impl Strategy<Value = Mutation> {
    (
        document_key_strategy(collection, pool),
        object_value_strategy(),
        0u8..3,
    )
        .prop_map(|(key, data, kind)| match kind {
            0 => Mutation::set(key, data),
            1 => Mutation::update(key, data),
            _ => Mutation::delete(key),
        })
}

/// Strategy for a sequence of batches, each holding one to three
/// mutations.
pub fn batches_strategy(
    collection: &'static str,
    pool: usize,
    max_batches: usize,
) -> impl Strategy<Value = Vec<Vec<Mutation>>> {
    prop::collection::vec(
        prop::collection::vec(mutation_strategy(collection, pool), 1..4),
        1..max_batches.max(2),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_keys_stay_in_collection(key in document_key_strategy("items", 5)) {
            prop_assert_eq!(key.collection_group(), "items");
        }

        #[test]
        fn generated_batches_are_not_empty(batches in batches_strategy("items", 3, 6)) {
            prop_assert!(!batches.is_empty());
            prop_assert!(batches.iter().all(|batch| !batch.is_empty()));
        }
    }
}
