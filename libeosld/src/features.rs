//! Target-feature reconciliation.
//!
//! Each object declares features it uses, requires, or disallows. The link
//! either validates an explicit feature set from the command line or infers
//! one from the inputs, and rejects combinations the output configuration
//! cannot honor.

use crate::args::Args;
use crate::diagnostics::Diagnostics;
use crate::input_data::FeaturePolicy;
use crate::input_data::ObjectFile;
use hashbrown::HashSet;
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// Computes the feature set for the output's `target_features` section and
/// reports every constraint violation. Values of the tracking maps are the
/// first object file observed declaring the feature, for the error messages.
#[tracing::instrument(skip_all, name = "Reconcile target features")]
pub fn reconcile_features(
    args: &Args,
    diagnostics: &Diagnostics,
    objects: &[ObjectFile],
) -> BTreeSet<String> {
    let mut used: IndexMap<&str, &str> = IndexMap::new();
    let mut required: IndexMap<&str, &str> = IndexMap::new();
    let mut disallowed: IndexMap<&str, &str> = IndexMap::new();
    let mut tls_used = false;

    // Only infer used features if the user did not specify any.
    let infer_features = args.features.is_none();

    let mut allowed: BTreeSet<String> = BTreeSet::new();
    if let Some(features) = &args.features {
        allowed.extend(features.iter().cloned());
        // No need to read or check features.
        if !args.check_features {
            return allowed;
        }
    }

    for obj in objects {
        for feature in &obj.target_features {
            match feature.policy {
                FeaturePolicy::Used => {
                    used.entry(&feature.name).or_insert(&obj.name);
                }
                FeaturePolicy::Required => {
                    used.entry(&feature.name).or_insert(&obj.name);
                    required.entry(&feature.name).or_insert(&obj.name);
                }
                FeaturePolicy::Disallowed => {
                    disallowed.entry(&feature.name).or_insert(&obj.name);
                }
            }
        }

        for segment in &obj.segments {
            if !segment.live {
                continue;
            }
            if segment.name.starts_with(".tdata") || segment.name.starts_with(".tbss") {
                tls_used = true;
            }
        }
    }

    if infer_features {
        allowed.extend(used.keys().map(|k| (*k).to_owned()));
    }

    if allowed.contains("atomics") && !args.shared_memory {
        if infer_features {
            diagnostics.error(format!(
                "'atomics' feature is used by {}, so --shared-memory must be used",
                used["atomics"]
            ));
        } else {
            diagnostics.error("'atomics' feature is used, so --shared-memory must be used");
        }
    }

    if !args.check_features {
        return allowed;
    }

    if disallowed.contains_key("atomics") && args.shared_memory {
        diagnostics.error(format!(
            "'atomics' feature is disallowed by {}, so --shared-memory must not be used",
            disallowed["atomics"]
        ));
    }

    if !used.contains_key("bulk-memory") && args.passive_segments {
        diagnostics.error("'bulk-memory' feature must be used in order to emit passive segments");
    }

    if !used.contains_key("bulk-memory") && tls_used {
        diagnostics
            .error("'bulk-memory' feature must be used in order to use thread-local storage");
    }

    // Validate that used features are allowed in the output.
    if !infer_features {
        for (feature, file) in &used {
            if !allowed.contains(*feature) {
                diagnostics.error(format!(
                    "Target feature '{feature}' used by {file} is not allowed."
                ));
            }
        }
    }

    // Validate the required and disallowed constraints for each file.
    for obj in objects {
        let mut object_features: HashSet<&str> = HashSet::new();
        for feature in &obj.target_features {
            if feature.policy == FeaturePolicy::Disallowed {
                continue;
            }
            object_features.insert(&feature.name);
            if let Some(disallower) = disallowed.get(feature.name.as_str()) {
                diagnostics.error(format!(
                    "Target feature '{}' used in {} is disallowed by {}. \
                     Use --no-check-features to suppress.",
                    feature.name, obj.name, disallower
                ));
            }
        }
        for (feature, requirer) in &required {
            if !object_features.contains(*feature) {
                diagnostics.error(format!(
                    "Missing target feature '{feature}' in {}, required by {requirer}. \
                     Use --no-check-features to suppress.",
                    obj.name
                ));
            }
        }
    }

    allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_data::FeatureEntry;

    fn object(name: &str, features: &[(FeaturePolicy, &str)]) -> ObjectFile {
        let mut obj = ObjectFile::new(name);
        obj.target_features = features
            .iter()
            .map(|(policy, name)| FeatureEntry {
                policy: *policy,
                name: (*name).to_owned(),
            })
            .collect();
        obj
    }

    #[test]
    fn infers_used_features() {
        let args = Args::default();
        let diagnostics = Diagnostics::new();
        let objects = vec![
            object("a.o", &[(FeaturePolicy::Used, "bulk-memory")]),
            object("b.o", &[(FeaturePolicy::Used, "sign-ext")]),
        ];
        let features = reconcile_features(&args, &diagnostics, &objects);
        assert!(!diagnostics.has_errors());
        assert_eq!(
            features.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            ["bulk-memory", "sign-ext"]
        );
    }

    #[test]
    fn atomics_requires_shared_memory() {
        let args = Args::default();
        let diagnostics = Diagnostics::new();
        let objects = vec![object("a.o", &[(FeaturePolicy::Used, "atomics")])];
        reconcile_features(&args, &diagnostics, &objects);
        let messages = diagnostics.messages();
        assert!(messages[0].contains("'atomics' feature is used by a.o"));
        assert!(messages[0].contains("--shared-memory must be used"));
    }

    #[test]
    fn conflicting_objects_name_both_files() {
        let args = Args {
            shared_memory: true,
            max_memory: 65536,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let objects = vec![
            object("a.o", &[(FeaturePolicy::Used, "atomics")]),
            object("b.o", &[(FeaturePolicy::Disallowed, "atomics")]),
        ];
        reconcile_features(&args, &diagnostics, &objects);
        assert!(diagnostics
            .messages()
            .iter()
            .any(|m| m.contains("used in a.o") && m.contains("disallowed by b.o")));
    }

    #[test]
    fn passive_segments_require_bulk_memory() {
        let args = Args {
            passive_segments: true,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        reconcile_features(&args, &diagnostics, &[]);
        assert!(diagnostics.messages()[0].contains("'bulk-memory' feature must be used"));
    }

    #[test]
    fn tls_requires_bulk_memory() {
        let args = Args::default();
        let diagnostics = Diagnostics::new();
        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(crate::input_data::InputSegment::new(
            ".tdata",
            crate::alignment::MIN,
            vec![0; 4],
        ));
        reconcile_features(&args, &diagnostics, &[obj]);
        assert!(diagnostics.messages()[0].contains("thread-local storage"));
    }

    #[test]
    fn explicit_features_reject_unlisted_used_features() {
        let args = Args {
            features: Some(vec!["sign-ext".to_owned()]),
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let objects = vec![object("a.o", &[(FeaturePolicy::Used, "simd128")])];
        let features = reconcile_features(&args, &diagnostics, &objects);
        assert_eq!(
            features.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            ["sign-ext"]
        );
        assert!(diagnostics.messages()[0].contains("Target feature 'simd128' used by a.o"));
    }

    #[test]
    fn required_features_must_appear_in_every_object() {
        let args = Args::default();
        let diagnostics = Diagnostics::new();
        let objects = vec![
            object("a.o", &[(FeaturePolicy::Required, "mutable-globals")]),
            object("b.o", &[]),
        ];
        reconcile_features(&args, &diagnostics, &objects);
        assert!(diagnostics
            .messages()
            .iter()
            .any(|m| m.contains("Missing target feature 'mutable-globals' in b.o")));
    }

    #[test]
    fn no_check_features_skips_object_validation() {
        let args = Args {
            check_features: false,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let objects = vec![
            object("a.o", &[(FeaturePolicy::Used, "sign-ext")]),
            object("b.o", &[(FeaturePolicy::Disallowed, "sign-ext")]),
        ];
        let features = reconcile_features(&args, &diagnostics, &objects);
        assert!(!diagnostics.has_errors());
        assert!(features.contains("sign-ext"));
    }
}
