//! Environment and metadata synchronization.
//!
//! Both produce a patch where `None` clears a key, which is how the platform
//! unsets environment variables, labels and annotations.

use std::collections::BTreeMap;

use crate::cloudfoundry::MetadataPatch;

/// Computes the environment update turning `current` into `desired`.
///
/// Keys present on the platform but absent from `desired` map to `None`;
/// added or changed keys map to their desired value. An empty value is a
/// value like any other and is kept.
#[must_use]
pub fn stale_environment(
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut changes: BTreeMap<String, Option<String>> = current
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .map(|k| (k.clone(), None))
        .collect();

    for (key, value) in desired {
        if current.get(key) != Some(value) {
            changes.insert(key.clone(), Some(value.clone()));
        }
    }

    changes
}

/// Environment update undoing `changes` against the `previous` values.
#[must_use]
pub fn inverse_environment(
    previous: &BTreeMap<String, String>,
    changes: &BTreeMap<String, Option<String>>,
) -> BTreeMap<String, Option<String>> {
    changes
        .keys()
        .map(|k| (k.clone(), previous.get(k).cloned()))
        .collect()
}

/// Metadata patch turning the current labels and annotations into the
/// desired ones; removed keys are cleared with `None`.
#[must_use]
pub fn metadata_patch(
    current_labels: &BTreeMap<String, String>,
    current_annotations: &BTreeMap<String, String>,
    desired_labels: &BTreeMap<String, String>,
    desired_annotations: &BTreeMap<String, String>,
) -> MetadataPatch {
    MetadataPatch {
        labels: stale_environment(current_labels, desired_labels),
        annotations: stale_environment(current_annotations, desired_annotations),
    }
}
