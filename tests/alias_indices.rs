//! Alias indexing invariants: the five constraint failures (self, cycle,
//! external, missing target, chain), the one-level and subtree scope
//! tuples, and alias maintenance through modify and delete.

use ditstore::{Attribute, DitStore, Entry, IndexConfig, ModOp, StoreConfig, StoreError, Value};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> DitStore {
    let config = StoreConfig::new(dir.path(), "ou=system")
        .with_name("alias-tests")
        .with_sync_on_write(false)
        .with_indexed_attribute(IndexConfig::new("cn"));
    let mut store = DitStore::new(config);
    store.init().unwrap();
    store
}

fn person(cn: &str, sn: &str) -> Entry {
    Entry::with_attrs([
        ("objectClass", ["top", "person"].as_slice()),
        ("cn", [cn].as_slice()),
        ("sn", [sn].as_slice()),
    ])
}

fn org_unit(ou: &str) -> Entry {
    Entry::with_attrs([
        ("objectClass", ["top", "organizationalUnit"].as_slice()),
        ("ou", [ou].as_slice()),
    ])
}

fn alias_entry(cn: &str, target: &str) -> Entry {
    Entry::with_attrs([
        ("objectClass", ["top", "alias", "extensibleObject"].as_slice()),
        ("cn", [cn].as_slice()),
        ("aliasedObjectName", [target].as_slice()),
    ])
}

fn kind(err: &eyre::Report) -> &StoreError {
    err.downcast_ref::<StoreError>().expect("a StoreError kind")
}

#[test]
fn alias_to_itself_is_rejected_and_harmless() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    let before = store.count().unwrap();

    let err = store
        .add(
            "cn=x,ou=system",
            alias_entry("x", "cn=x,ou=system"),
        )
        .unwrap_err();
    assert!(matches!(kind(&err), StoreError::AliasToSelf { .. }));

    // Nothing changed: master, names, alias tables.
    assert_eq!(store.count().unwrap(), before);
    assert_eq!(store.entry_id("cn=x,ou=system").unwrap(), None);
    assert_eq!(store.alias_index().unwrap().count().unwrap(), 0);

    // And the store is still usable.
    store.add("cn=later,ou=system", person("later", "L")).unwrap();
}

#[test]
fn alias_to_own_ancestor_is_a_cycle() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add("ou=t,ou=system", org_unit("t")).unwrap();
    let err = store
        .add(
            "cn=al,ou=t,ou=system",
            alias_entry("al", "ou=t,ou=system"),
        )
        .unwrap_err();
    assert!(matches!(kind(&err), StoreError::AliasCycle { .. }));
}

#[test]
fn alias_outside_the_suffix_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let err = store
        .add(
            "cn=al,ou=system",
            alias_entry("al", "cn=someone,dc=elsewhere"),
        )
        .unwrap_err();
    assert!(matches!(kind(&err), StoreError::AliasExternal { .. }));
}

#[test]
fn alias_to_missing_target_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let err = store
        .add(
            "cn=al,ou=system",
            alias_entry("al", "cn=ghost,ou=system"),
        )
        .unwrap_err();
    assert!(matches!(kind(&err), StoreError::AliasTargetMissing { .. }));
}

#[test]
fn alias_chains_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add("cn=a,ou=system", person("a", "A")).unwrap();
    store
        .add("cn=b,ou=system", alias_entry("b", "cn=a,ou=system"))
        .unwrap();

    let err = store
        .add("cn=c,ou=system", alias_entry("c", "cn=b,ou=system"))
        .unwrap_err();
    assert!(matches!(kind(&err), StoreError::AliasChain { .. }));
    assert_eq!(store.entry_id("cn=c,ou=system").unwrap(), None);
}

#[test]
fn scope_tuples_for_alias_directly_under_the_suffix() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add("ou=t,ou=system", org_unit("t")).unwrap();
    let target = store
        .add("cn=u,ou=t,ou=system", person("u", "U"))
        .unwrap();
    let alias_id = store
        .add(
            "cn=al,ou=system",
            alias_entry("al", "cn=u,ou=t,ou=system"),
        )
        .unwrap();

    let root = store.entry_id("ou=system").unwrap().unwrap();
    let target_dn = store.entry_dn(target).unwrap().unwrap();

    // The forward alias tuple records the normalized target.
    assert_eq!(
        store.alias_index().unwrap().reverse_lookup(alias_id).unwrap(),
        Some(target_dn)
    );

    // Target is no sibling of the alias, so the parent gets a one-level
    // jump tuple.
    assert!(store.one_alias_index().unwrap().has_value(&root, target).unwrap());

    // The subtree walk covers strict ancestors below the suffix; for an
    // alias hanging directly off the suffix there are none.
    assert_eq!(store.sub_alias_index().unwrap().count().unwrap(), 0);
}

#[test]
fn scope_tuples_for_alias_deeper_in_the_tree() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add("ou=t,ou=system", org_unit("t")).unwrap();
    let target = store.add("cn=a,ou=system", person("a", "A")).unwrap();
    let _alias_id = store
        .add(
            "cn=al,ou=t,ou=system",
            alias_entry("al", "cn=a,ou=system"),
        )
        .unwrap();

    let ou_t = store.entry_id("ou=t,ou=system").unwrap().unwrap();
    let root = store.entry_id("ou=system").unwrap().unwrap();

    // The target sits outside ou=t, so both scope tables carry the jump
    // at ou=t; the suffix itself is never indexed.
    assert!(store.one_alias_index().unwrap().has_value(&ou_t, target).unwrap());
    assert!(store.sub_alias_index().unwrap().has_value(&ou_t, target).unwrap());
    assert!(!store.sub_alias_index().unwrap().has_value(&root, target).unwrap());
}

#[test]
fn sibling_target_gets_no_one_level_tuple() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let target = store.add("cn=a,ou=system", person("a", "A")).unwrap();
    store
        .add("cn=al,ou=system", alias_entry("al", "cn=a,ou=system"))
        .unwrap();

    let root = store.entry_id("ou=system").unwrap().unwrap();
    assert!(!store.one_alias_index().unwrap().has_value(&root, target).unwrap());
    assert_eq!(store.one_alias_index().unwrap().count().unwrap(), 0);
}

#[test]
fn deleting_an_alias_clears_only_its_tuples() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add("ou=t,ou=system", org_unit("t")).unwrap();
    let target = store
        .add("cn=u,ou=t,ou=system", person("u", "U"))
        .unwrap();
    let first = store
        .add("cn=al1,ou=system", alias_entry("al1", "cn=u,ou=t,ou=system"))
        .unwrap();
    let second = store
        .add(
            "cn=al2,ou=t,ou=system",
            alias_entry("al2", "cn=u,ou=t,ou=system"),
        )
        .unwrap();

    let root = store.entry_id("ou=system").unwrap().unwrap();

    store.delete(first).unwrap();

    // The second alias to the same target keeps its own tuples.
    assert_eq!(store.alias_index().unwrap().reverse_lookup(first).unwrap(), None);
    assert!(store
        .alias_index()
        .unwrap()
        .reverse_lookup(second)
        .unwrap()
        .is_some());
    assert!(!store.one_alias_index().unwrap().has_value(&root, target).unwrap());

    store.delete(second).unwrap();
    assert_eq!(store.alias_index().unwrap().count().unwrap(), 0);
    assert_eq!(store.one_alias_index().unwrap().count().unwrap(), 0);
    assert_eq!(store.sub_alias_index().unwrap().count().unwrap(), 0);
}

#[test]
fn modify_can_turn_an_entry_into_an_alias() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add("ou=t,ou=system", org_unit("t")).unwrap();
    let target = store
        .add("cn=u,ou=t,ou=system", person("u", "U"))
        .unwrap();
    let id = store.add("cn=al,ou=system", person("al", "L")).unwrap();

    store
        .modify(
            "cn=al,ou=system",
            ModOp::Add,
            &[Attribute::new(
                "aliasedObjectName",
                [Value::from("cn=u,ou=t,ou=system")],
            )],
        )
        .unwrap();

    let root = store.entry_id("ou=system").unwrap().unwrap();
    assert!(store
        .alias_index()
        .unwrap()
        .reverse_lookup(id)
        .unwrap()
        .is_some());
    assert!(store.one_alias_index().unwrap().has_value(&root, target).unwrap());
}

#[test]
fn modify_remove_of_the_alias_attribute_drops_tuples() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let target = store.add("cn=a,ou=system", person("a", "A")).unwrap();
    store.add("ou=t,ou=system", org_unit("t")).unwrap();
    let alias_id = store
        .add(
            "cn=al,ou=t,ou=system",
            alias_entry("al", "cn=a,ou=system"),
        )
        .unwrap();
    let ou_t = store.entry_id("ou=t,ou=system").unwrap().unwrap();
    assert!(store.sub_alias_index().unwrap().has_value(&ou_t, target).unwrap());

    store
        .modify(
            "cn=al,ou=t,ou=system",
            ModOp::Remove,
            &[Attribute::new("aliasedObjectName", [])],
        )
        .unwrap();

    assert_eq!(
        store.alias_index().unwrap().reverse_lookup(alias_id).unwrap(),
        None
    );
    assert!(!store.sub_alias_index().unwrap().has_value(&ou_t, target).unwrap());
    assert!(!store.one_alias_index().unwrap().has_value(&ou_t, target).unwrap());
}

#[test]
fn modify_replace_retargets_an_alias() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let old_target = store.add("cn=a,ou=system", person("a", "A")).unwrap();
    let new_target = store.add("cn=b,ou=system", person("b", "B")).unwrap();
    store.add("ou=t,ou=system", org_unit("t")).unwrap();
    let alias_id = store
        .add(
            "cn=al,ou=t,ou=system",
            alias_entry("al", "cn=a,ou=system"),
        )
        .unwrap();
    let ou_t = store.entry_id("ou=t,ou=system").unwrap().unwrap();

    store
        .modify(
            "cn=al,ou=t,ou=system",
            ModOp::Replace,
            &[Attribute::new(
                "aliasedObjectName",
                [Value::from("cn=b,ou=system")],
            )],
        )
        .unwrap();

    let stored_target = store
        .alias_index()
        .unwrap()
        .reverse_lookup(alias_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored_target, store.entry_dn(new_target).unwrap().unwrap());
    assert!(!store.sub_alias_index().unwrap().has_value(&ou_t, old_target).unwrap());
    assert!(store.sub_alias_index().unwrap().has_value(&ou_t, new_target).unwrap());
}

#[test]
fn alias_validation_failures_do_not_burn_ids() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.add("cn=a,ou=system", person("a", "A")).unwrap();
    store
        .add("cn=b,ou=system", alias_entry("b", "cn=a,ou=system"))
        .unwrap();
    let _ = store
        .add("cn=c,ou=system", alias_entry("c", "cn=b,ou=system"))
        .unwrap_err();

    let next = store.add("cn=d,ou=system", person("d", "D")).unwrap();
    let prev = store.entry_id("cn=b,ou=system").unwrap().unwrap();
    assert_eq!(next, prev + 1, "a rejected add must not consume an id");
}
