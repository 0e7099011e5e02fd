//! Property tests over dispatch and hashing.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{json, Value};

use runespine::kernel::dispatcher::CallerContext;
use runespine::kernel::governance::Decision;
use runespine::kernel::handlers::{HandlerError, HandlerRequest, ECHO, PLAN};
use runespine::kernel::hashing::{canonical_bytes, canonical_hash};
use runespine::kernel::policy::PolicyDocument;
use runespine::kernel::registry::{EvidenceMode, RuneDescriptor};
use runespine::kernel::schema::{validate, Direction, FieldType, SchemaSpec};
use runespine::kernel::stabilization::StabilizationStore;
use runespine::kernel::KernelError;

use crate::support::{apply_payload, permissive_policy, HarnessBuilder, ACTUATOR};

const TYPED: &str = "prop.typed";

/// A JSON object that serializes its entries in the order given.
struct Ordered<'a>(Vec<(&'a String, &'a Value)>);

impl Serialize for Ordered<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

fn accept(_request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
    Ok(json!({"accepted": true}))
}

fn typed_spec(allow_extra: bool) -> SchemaSpec {
    SchemaSpec::new(
        [
            ("name".to_owned(), FieldType::String),
            ("count".to_owned(), FieldType::Integer),
        ]
        .into(),
        [
            ("ratio".to_owned(), FieldType::Float),
            ("tags".to_owned(), FieldType::List),
        ]
        .into(),
        allow_extra,
    )
    .expect("spec")
}

fn any_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        scalar(),
        (-1.0e6f64..1.0e6).prop_map(Value::from),
        Just(json!([])),
        Just(json!(["a", 1])),
        Just(json!({})),
    ]
}

fn typed_payload() -> impl Strategy<Value = Value> {
    let keys = prop::sample::select(vec!["name", "count", "ratio", "tags", "extra"]);
    prop_oneof![
        8 => prop::collection::btree_map(keys, any_value(), 0..5).prop_map(|m| {
            Value::Object(m.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
        }),
        1 => Just(json!(["not", "an", "object"])),
    ]
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ]
}

fn payload() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", scalar(), 0..6)
        .prop_map(|m| Value::Object(m.into_iter().collect()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn denied_rune_fails_for_any_payload(payload in payload()) {
        let mut policy = PolicyDocument::default();
        policy.deny_runes.push(ECHO.to_owned());
        let h = HarnessBuilder::new().policy(policy).build();
        let err = h
            .dispatcher
            .dispatch(ECHO, payload, CallerContext::new("prop"))
            .expect_err("denied");
        prop_assert!(matches!(err, KernelError::PolicyDenied { .. }), "got {err:?}");
    }

    #[test]
    fn hash_ignores_serialization_order(
        entries in prop::collection::btree_map("[a-z]{1,6}", scalar(), 0..8)
    ) {
        let forward = Ordered(entries.iter().collect());
        let backward = Ordered(entries.iter().rev().collect());
        if entries.len() > 1 {
            prop_assert_ne!(
                serde_json::to_vec(&forward).expect("plain forward"),
                serde_json::to_vec(&backward).expect("plain backward")
            );
        }
        prop_assert_eq!(
            canonical_hash(&forward).expect("hash"),
            canonical_hash(&backward).expect("hash")
        );
        let sorted: &BTreeMap<String, Value> = &entries;
        prop_assert_eq!(
            canonical_bytes(&backward).expect("bytes"),
            serde_json::to_vec(sorted).expect("sorted bytes")
        );
    }

    #[test]
    fn hash_changes_with_any_value(
        entries in prop::collection::btree_map("[a-z]{1,6}", scalar(), 1..8),
        pick in any::<prop::sample::Index>(),
        replacement in scalar(),
    ) {
        let key = pick.get(entries.keys().collect::<Vec<_>>().as_slice()).to_string();
        prop_assume!(entries.get(&key) != Some(&replacement));
        let mut changed = entries.clone();
        changed.insert(key, replacement);
        prop_assert_ne!(
            canonical_hash(&entries).expect("hash"),
            canonical_hash(&changed).expect("hash")
        );
    }

    #[test]
    fn inbound_rejection_matches_validator(
        payload in typed_payload(),
        allow_extra in any::<bool>(),
    ) {
        let spec = typed_spec(allow_extra);
        let expected = validate(&payload, &spec);
        let h = HarnessBuilder::new()
            .rune(RuneDescriptor::new(TYPED, EvidenceMode::Plain))
            .table(|t| t.bind(TYPED, accept))
            .schemas(|s| s.insert(TYPED, Direction::Input, spec))
            .build();
        let result = h.dispatcher.dispatch(TYPED, payload, CallerContext::new("prop"));
        match result {
            Ok(_) => {
                prop_assert!(expected.is_ok(), "accepted despite {:?}", expected.errors);
            }
            Err(KernelError::ValidationFailed { errors, .. }) => {
                prop_assert_eq!(errors, expected.errors);
            }
            Err(other) => {
                prop_assert!(false, "unexpected {:?}", other);
            }
        }
    }

    #[test]
    fn actuator_waits_for_threshold(
        (threshold, cycles) in (0u64..5).prop_flat_map(|t| (Just(t), 0..=t.saturating_add(1)))
    ) {
        let mut policy = permissive_policy();
        policy.stabilization.required_advisory_cycles = threshold;
        let h = HarnessBuilder::new().policy(policy).build();
        for _ in 0..cycles {
            h.dispatcher
                .dispatch(
                    PLAN,
                    json!({"action": "restart", "service": "web", "target": "host-1"}),
                    CallerContext::new("prop"),
                )
                .expect("advisory run");
        }
        prop_assert_eq!(h.stabilization.cycles(PLAN).expect("cycles"), cycles);

        let receipt = h.receipt(ACTUATOR, Decision::Approve);
        let result = h
            .dispatcher
            .dispatch(ACTUATOR, apply_payload(&receipt), CallerContext::new("prop"));
        if cycles < threshold {
            let err = result.expect_err("below threshold");
            prop_assert!(
                matches!(
                    err,
                    KernelError::StabilizationNotReady { observed, required, .. }
                        if observed == cycles && required == threshold
                ),
                "got {err:?}"
            );
        } else {
            prop_assert!(result.is_ok(), "got {:?}", result.err());
        }
    }

    #[test]
    fn advisory_counter_only_grows(outcomes in prop::collection::vec(any::<bool>(), 1..8)) {
        let h = HarnessBuilder::new().build();
        let mut last = 0;
        for succeed in outcomes {
            let payload = if succeed {
                json!({"action": "restart", "service": "web", "target": "host-1"})
            } else {
                json!({"action": "restart"})
            };
            let result = h.dispatcher.dispatch(PLAN, payload, CallerContext::new("prop"));
            prop_assert_eq!(result.is_ok(), succeed);
            let now = h.stabilization.cycles(PLAN).expect("cycles");
            prop_assert!(now >= last);
            prop_assert_eq!(now, if succeed { last.saturating_add(1) } else { last });
            last = now;
        }
    }
}
