//! ABI merging and emission.
//!
//! Every input object may carry an ABI JSON blob; the link folds them into
//! one document written next to the output binary. The merger unions the
//! ABI's keyed arrays, keeping the first occurrence of each key, which makes
//! the fold idempotent: re-merging the seed document is harmless.

use crate::error::Result;
use anyhow::bail;
use serde_json::Value;

/// Key field used to identify entries of each known ABI array.
fn key_field(array: &str) -> &'static str {
    match array {
        "types" => "new_type_name",
        "ricardian_clauses" => "id",
        "abi_extensions" => "tag",
        // structs, actions, tables, variants, action_results, kv_tables
        _ => "name",
    }
}

const MERGED_ARRAYS: &[&str] = &[
    "types",
    "structs",
    "actions",
    "tables",
    "ricardian_clauses",
    "variants",
    "action_results",
    "kv_tables",
    "abi_extensions",
];

pub struct AbiMerger {
    abi: Value,
}

impl AbiMerger {
    pub fn new(seed: Value) -> AbiMerger {
        AbiMerger { abi: seed }
    }

    pub fn set_abi(&mut self, abi: Value) {
        self.abi = abi;
    }

    /// Returns the union of the current ABI and `other`. Scalar fields keep
    /// the current value unless it is absent or empty; keyed arrays are
    /// unioned with first-occurrence-wins semantics.
    pub fn merge(&self, other: Value) -> Result<Value> {
        let mut merged = self.abi.clone();
        let (Some(target), Some(source)) = (merged.as_object_mut(), other.as_object()) else {
            bail!("ABI documents must be JSON objects");
        };

        for (field, value) in source {
            match target.get_mut(field) {
                None => {
                    target.insert(field.clone(), value.clone());
                }
                Some(existing) => {
                    if MERGED_ARRAYS.contains(&field.as_str()) {
                        merge_keyed_array(existing, value, key_field(field))?;
                    } else if existing.is_null()
                        || existing.as_str().is_some_and(str::is_empty)
                    {
                        *existing = value.clone();
                    }
                }
            }
        }
        Ok(merged)
    }

    pub fn abi_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.abi)?)
    }
}

fn merge_keyed_array(existing: &mut Value, incoming: &Value, key: &str) -> Result<()> {
    let (Some(target), Some(source)) = (existing.as_array_mut(), incoming.as_array()) else {
        bail!("ABI field has mismatched types across inputs");
    };
    for entry in source {
        let id = entry.get(key);
        let present = target
            .iter()
            .any(|existing| id.is_some() && existing.get(key) == id);
        if !present {
            target.push(entry.clone());
        }
    }
    Ok(())
}
