//! Merge-update: the transactional read-modify-write every mutable entity goes through.
//!
//! A caller proposes a whole record. Inside one write transaction the stored
//! record is decoded and each field is taken from the proposal only when the
//! field's transition rule allows it. The merged record is written back and
//! returned, so callers see which transitions actually took effect.
//!
//! The rules make concurrent updates from stale copies converge: ratchets and
//! maxima are idempotent and commutative.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::codec::Record;
use crate::engine::WriteTxn;
use crate::error::{StateError, StateResult};
use crate::filter::{RecordFilter, matches_all};
use crate::store::{Store, get_record, put_record, scan_records};

/// Field-transition policy of an entity.
pub trait MergePolicy {
    /// Fold the permitted parts of `proposed` into `self` (the stored record).
    fn merge_from(&mut self, proposed: &Self);
}

// ── Transition rules ───────────────────────────────────────────────

/// Written once: only while the current value is zero/empty and the proposal is not.
pub fn ratchet<T: Default + PartialEq + Clone>(current: &mut T, proposed: &T) {
    let zero = T::default();
    if *current == zero && *proposed != zero {
        *current = proposed.clone();
    }
}

/// Only ever increases.
pub fn monotonic_max<T: PartialOrd + Clone>(current: &mut T, proposed: &T) {
    if *proposed > *current {
        *current = proposed.clone();
    }
}

/// false -> true only.
pub fn one_way_flag(current: &mut bool, proposed: bool) {
    if !*current && proposed {
        *current = true;
    }
}

/// Replaced whenever current and proposed disagree on emptiness, so the
/// value may be filled, cleared and filled again.
pub fn emptiness_toggle<T: Emptiness + Clone>(current: &mut T, proposed: &T) {
    if current.is_empty_value() != proposed.is_empty_value() {
        *current = proposed.clone();
    }
}

/// Latest non-default proposal wins.
pub fn replace_if_non_default<T: Default + PartialEq + Clone>(current: &mut T, proposed: &T) {
    if *proposed != T::default() {
        *current = proposed.clone();
    }
}

/// Volatile fields: the proposal always wins.
pub fn always_set<T: Clone>(current: &mut T, proposed: &T) {
    *current = proposed.clone();
}

/// Replaced when the lengths differ.
pub fn replace_if_len_differs<T: Clone>(current: &mut Vec<T>, proposed: &[T]) {
    if current.len() != proposed.len() {
        *current = proposed.to_vec();
    }
}

/// Values with a notion of being empty.
pub trait Emptiness {
    fn is_empty_value(&self) -> bool;
}

impl Emptiness for String {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Emptiness for Vec<T> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<K, V> Emptiness for BTreeMap<K, V> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<K, V, S> Emptiness for HashMap<K, V, S> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Emptiness for serde_json::Map<String, serde_json::Value> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

// ── Transactional protocol ─────────────────────────────────────────

/// Merge `proposed` into the record stored at `key`. Fails with `NotFound`
/// when nothing is stored there.
pub(crate) fn merge_in_txn<T, W>(txn: &mut W, bucket: &str, key: &str, proposed: &T) -> StateResult<T>
where
    T: Record + MergePolicy,
    W: WriteTxn + ?Sized,
{
    let mut merged: T = get_record(&*txn, bucket, key)?
        .ok_or_else(|| StateError::NotFound(format!("no record {key} in {bucket}")))?;
    merged.merge_from(proposed);
    put_record(txn, bucket, key, &merged)?;
    Ok(merged)
}

/// Find the single record matching `filters`, apply `mutate` to a copy and
/// merge the copy back, all in the caller's transaction.
///
/// No match is `NotFound`; more than one match is an invariant violation.
pub(crate) fn update_unique_in_txn<T, F, W>(
    txn: &mut W,
    bucket: &str,
    filters: &[F],
    what: &str,
    mutate: impl FnOnce(&mut T),
) -> StateResult<T>
where
    T: Record + MergePolicy + Clone,
    F: RecordFilter<T>,
    W: WriteTxn + ?Sized,
{
    let mut matching: Vec<(String, T)> = scan_records(&*txn, bucket)?
        .into_iter()
        .filter(|(_, record)| matches_all(record, filters))
        .collect();
    if matching.len() > 1 {
        return Err(StateError::InvariantViolation(format!(
            "expected one record for {what} in {bucket}, found {}",
            matching.len()
        )));
    }
    let (key, current) = matching
        .pop()
        .ok_or_else(|| StateError::NotFound(format!("no record for {what} in {bucket}")))?;
    let mut proposed = current;
    mutate(&mut proposed);
    merge_in_txn(txn, bucket, &key, &proposed)
}

/// Apply `mutate` to a copy of the record at `key` and merge the copy back.
pub(crate) fn update_by_key_in_txn<T, W>(
    txn: &mut W,
    bucket: &str,
    key: &str,
    mutate: impl FnOnce(&mut T),
) -> StateResult<T>
where
    T: Record + MergePolicy,
    W: WriteTxn + ?Sized,
{
    let mut proposed: T = get_record(&*txn, bucket, key)?
        .ok_or_else(|| StateError::NotFound(format!("no record {key} in {bucket}")))?;
    mutate(&mut proposed);
    merge_in_txn(txn, bucket, key, &proposed)
}

impl Store {
    /// Read, mutate and merge the record at `bucket`/`key` in one write transaction.
    pub(crate) fn update_by_key<T: Record + MergePolicy>(
        &self,
        bucket: &str,
        key: &str,
        mutate: impl FnOnce(&mut T),
    ) -> StateResult<T> {
        self.with_write(|txn| update_by_key_in_txn(txn, bucket, key, mutate))
    }

    /// Transactional merge-update of the record at `bucket`/`key`.
    pub fn merge_update<T: Record + MergePolicy>(
        &self,
        bucket: &str,
        key: &str,
        proposed: &T,
    ) -> StateResult<T> {
        let merged = self.with_write(|txn| merge_in_txn(txn, bucket, key, proposed))?;
        debug!(bucket, %key, "record merged");
        Ok(merged)
    }
}
