//! Mutations, field transforms and overlays.
//!
//! A [`Mutation`] can be applied two ways:
//!
//! - to a **local view**, resolving transforms with the local clock so the
//!   application sees its write immediately
//! - to a **remote document**, using the [`MutationResult`] the server
//!   returned when it acknowledged the write

use crate::batch::BatchId;
use crate::document::Document;
use crate::key::DocumentKey;
use crate::path::FieldPath;
use crate::value::{ObjectValue, Value};
use crate::version::{SnapshotVersion, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A set of field paths touched by a write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    /// Creates a mask from field paths.
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// Returns true if `path` is one of the fields or nested inside one.
    #[must_use]
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|f| f.is_prefix_of(path))
    }

    /// Adds a field.
    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    /// Adds every field of `other`.
    pub fn extend(&mut self, other: &FieldMask) {
        self.fields.extend(other.fields.iter().cloned());
    }

    /// Iterates the fields in order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the mask has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A condition that must hold on the server for a mutation to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// Always applies.
    None,
    /// Applies only if the document does (`true`) or does not (`false`) exist.
    Exists(bool),
    /// Applies only if the document was last updated at this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    /// Returns true if `doc` satisfies this precondition.
    #[must_use]
    pub fn is_valid_for(&self, doc: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == doc.is_found_document(),
            Precondition::UpdateTime(version) => {
                doc.is_found_document() && doc.version() == *version
            }
        }
    }

    /// Returns true for [`Precondition::None`].
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }
}

/// A server-evaluated change to one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformOperation {
    /// Replace the field with the server's commit time.
    ServerTimestamp,
    /// Add the operand to the field's numeric value.
    Increment(Value),
    /// Append elements not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of the elements.
    ArrayRemove(Vec<Value>),
}

impl TransformOperation {
    /// Computes the field's value for a local, not yet acknowledged view.
    #[must_use]
    pub fn apply_to_local_view(&self, previous: Option<&Value>, local_write_time: Timestamp) -> Value {
        match self {
            TransformOperation::ServerTimestamp => {
                let previous = match previous {
                    // Keep the original pre-write value through repeated placeholders.
                    Some(Value::ServerTimestamp { previous, .. }) => previous.clone(),
                    Some(value) => Some(Box::new(value.clone())),
                    None => None,
                };
                Value::ServerTimestamp {
                    local_write_time,
                    previous,
                }
            }
            TransformOperation::Increment(operand) => increment(previous, operand),
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerce_array(previous);
                for element in elements {
                    if !values.contains(element) {
                        values.push(element.clone());
                    }
                }
                Value::Array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let mut values = coerce_array(previous);
                values.retain(|v| !elements.contains(v));
                Value::Array(values)
            }
        }
    }

    /// Computes the field's value once the server has acknowledged the write.
    ///
    /// Array transforms are recomputed locally since the server does not
    /// echo their result.
    #[must_use]
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&Value>,
        server_result: Option<&Value>,
        commit_time: Timestamp,
    ) -> Value {
        match (self, server_result) {
            (TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_), _) => {
                self.apply_to_local_view(previous, commit_time)
            }
            (TransformOperation::ServerTimestamp, None) => Value::Timestamp(commit_time),
            (_, Some(result)) => result.clone(),
            (TransformOperation::Increment(operand), None) => increment(previous, operand),
        }
    }
}

fn increment(previous: Option<&Value>, operand: &Value) -> Value {
    match (previous, operand) {
        (Some(Value::Integer(a)), Value::Integer(b)) => Value::Integer(a.saturating_add(*b)),
        (Some(Value::Integer(a)), Value::Double(b)) => Value::Double(*a as f64 + b),
        (Some(Value::Double(a)), Value::Integer(b)) => Value::Double(a + *b as f64),
        (Some(Value::Double(a)), Value::Double(b)) => Value::Double(a + b),
        _ => operand.clone(),
    }
}

fn coerce_array(previous: Option<&Value>) -> Vec<Value> {
    match previous {
        Some(Value::Array(values)) => values.clone(),
        _ => Vec::new(),
    }
}

/// A transform bound to a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTransform {
    /// Field the transform applies to.
    pub field: FieldPath,
    /// The operation.
    pub operation: TransformOperation,
}

/// The shape of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replace the whole document.
    Set {
        /// New contents.
        value: ObjectValue,
    },
    /// Update only the fields in `mask`; masked fields missing from `value`
    /// are deleted.
    Patch {
        /// New field values.
        value: ObjectValue,
        /// Fields the patch writes.
        mask: FieldMask,
    },
    /// Delete the document.
    Delete,
    /// Only check the precondition.
    Verify,
}

/// A single write to one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Document being written.
    pub key: DocumentKey,
    /// What the write does.
    pub kind: MutationKind,
    /// Server-side condition for the write.
    pub precondition: Precondition,
    /// Transforms applied after `kind`.
    pub field_transforms: Vec<FieldTransform>,
}

/// The server's answer for one mutation of an acknowledged batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Version of the document after the write.
    pub version: SnapshotVersion,
    /// One value per field transform, in order.
    pub transform_results: Vec<Value>,
}

impl MutationResult {
    /// Creates a result without transform values.
    #[must_use]
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

impl Mutation {
    /// Replaces the document with `value`.
    #[must_use]
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Self::with_kind(key, MutationKind::Set { value }, Precondition::None)
    }

    /// Merges the fields of `value` into an existing document.
    ///
    /// Every leaf field of `value` is written; the document must exist.
    #[must_use]
    pub fn update(key: DocumentKey, value: ObjectValue) -> Self {
        let mask = value.field_mask();
        Self::patch(key, value, mask, Precondition::Exists(true))
    }

    /// Writes exactly the fields in `mask`.
    #[must_use]
    pub fn patch(
        key: DocumentKey,
        value: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
    ) -> Self {
        Self::with_kind(key, MutationKind::Patch { value, mask }, precondition)
    }

    /// Deletes the document.
    #[must_use]
    pub fn delete(key: DocumentKey) -> Self {
        Self::with_kind(key, MutationKind::Delete, Precondition::None)
    }

    /// Checks `precondition` without writing.
    #[must_use]
    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::with_kind(key, MutationKind::Verify, precondition)
    }

    fn with_kind(key: DocumentKey, kind: MutationKind, precondition: Precondition) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    /// Replaces the precondition.
    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    /// Adds a field transform.
    #[must_use]
    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform { field, operation });
        self
    }

    /// Returns true for set and delete mutations without preconditions or
    /// transforms, which fully determine the document regardless of what
    /// came before.
    #[must_use]
    pub fn is_unconditional_overwrite(&self) -> bool {
        matches!(self.kind, MutationKind::Set { .. } | MutationKind::Delete)
            && self.precondition.is_none()
            && self.field_transforms.is_empty()
    }

    /// Applies this mutation to `doc` as the server acknowledged it.
    pub fn apply_to_remote_document(&self, doc: &mut Document, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.server_transform_results(doc, result);
                let mut data = value.clone();
                data.set_all(transforms);
                doc.convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(doc) {
                    // The server applied a patch we cannot reproduce; the
                    // contents arrive later on the watch stream.
                    doc.convert_to_unknown(result.version);
                    return;
                }
                let transforms = self.server_transform_results(doc, result);
                let mut data = doc.data().clone();
                data.set_all(patch_updates(value, mask));
                data.set_all(transforms);
                doc.convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                doc.convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies this mutation to `doc` for the local view.
    ///
    /// `previous_mask` is the set of fields changed so far by earlier
    /// mutations, where `None` means the whole document was overwritten.
    /// Returns the updated mask.
    pub fn apply_to_local_view(
        &self,
        doc: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(doc) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.local_transform_results(doc, local_write_time);
                let mut data = value.clone();
                data.set_all(transforms);
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transforms = self.local_transform_results(doc, local_write_time);
                let mut data = doc.data().clone();
                data.set_all(patch_updates(value, mask));
                data.set_all(transforms);
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();
                previous_mask.map(|mut fields| {
                    fields.extend(mask);
                    for transform in &self.field_transforms {
                        fields.insert(transform.field.clone());
                    }
                    fields
                })
            }
            MutationKind::Delete => {
                let version = doc.version();
                doc.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    fn local_transform_results(
        &self,
        doc: &Document,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<Value>> {
        self.field_transforms
            .iter()
            .map(|t| {
                let value = t
                    .operation
                    .apply_to_local_view(doc.field(&t.field), local_write_time);
                (t.field.clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        doc: &Document,
        result: &MutationResult,
    ) -> BTreeMap<FieldPath, Option<Value>> {
        let commit_time = result.version.timestamp();
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let value = t.operation.apply_to_remote_document(
                    doc.field(&t.field),
                    result.transform_results.get(i),
                    commit_time,
                );
                (t.field.clone(), Some(value))
            })
            .collect()
    }
}

fn patch_updates(value: &ObjectValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<Value>> {
    mask.iter()
        .filter(|path| !path.is_empty())
        .map(|path| (path.clone(), value.field(path).cloned()))
        .collect()
}

/// Builds the mutation that turns the remote version of `doc` into its
/// current local view.
///
/// `mask` is the result of folding pending mutations with
/// [`Mutation::apply_to_local_view`]. Returns `None` when nothing is pending.
#[must_use]
pub fn calculate_overlay_mutation(doc: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !doc.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        return Some(if doc.is_no_document() {
            Mutation::delete(doc.key().clone())
        } else {
            Mutation::set(doc.key().clone(), doc.data().clone())
        });
    };
    if mask.is_empty() {
        return None;
    }

    let mut patch = ObjectValue::new();
    let mut written = FieldMask::default();
    for path in mask.iter() {
        if written.covers(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = doc.field(&path).cloned();
        // A deleted nested field is expressed by rewriting its parent.
        if value.is_none() && path.len() > 1 {
            path = path.pop_last();
            value = doc.field(&path).cloned();
        }
        match value {
            Some(value) => patch.set(&path, value),
            None => patch.delete(&path),
        }
        written.insert(path);
    }
    Some(Mutation::patch(
        doc.key().clone(),
        patch,
        written,
        Precondition::None,
    ))
}

/// The net effect of pending writes on one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    /// Highest batch id folded into `mutation`.
    pub largest_batch_id: BatchId,
    /// Mutation that produces the local view from the remote document.
    pub mutation: Mutation,
}

impl Overlay {
    /// The document the overlay applies to.
    #[must_use]
    pub fn key(&self) -> &DocumentKey {
        &self.mutation.key
    }
}
