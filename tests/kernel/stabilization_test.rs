//! File-backed advisory counters.

use runespine::kernel::stabilization::{FileStabilizationStore, StabilizationStore};

#[test]
fn counters_start_at_zero_and_persist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state").join("stabilization.json");
    let store = FileStabilizationStore::new(&path);
    assert_eq!(store.cycles("ops.plan").expect("read"), 0);
    assert_eq!(store.record_cycle("ops.plan").expect("inc"), 1);
    assert_eq!(store.record_cycle("ops.plan").expect("inc"), 2);

    let reopened = FileStabilizationStore::new(&path);
    assert_eq!(reopened.cycles("ops.plan").expect("read"), 2);
    assert_eq!(reopened.cycles("ops.other").expect("read"), 0);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn counters_are_independent_per_rune() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStabilizationStore::new(dir.path().join("stabilization.json"));
    store.record_cycle("a.one").expect("inc");
    store.record_cycle("b.two").expect("inc");
    store.record_cycle("b.two").expect("inc");
    let state = store.read_state().expect("state");
    assert_eq!(state.advisory_cycles.get("a.one"), Some(&1));
    assert_eq!(state.advisory_cycles.get("b.two"), Some(&2));
}

#[test]
fn corrupt_state_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stabilization.json");
    std::fs::write(&path, "not json").expect("write");
    let store = FileStabilizationStore::new(&path);
    assert!(store.cycles("ops.plan").is_err());
    assert!(store.record_cycle("ops.plan").is_err());
}
