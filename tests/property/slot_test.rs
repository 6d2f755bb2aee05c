// tests/property/slot_test.rs

//! Property-based tests for key hash slots
//! Tests known slot values and hash tag invariants

use proptest::prelude::*;
use spinel_client::core::cluster::slot::slot_of_keys;
use spinel_client::core::cluster::{NUM_SLOTS, command_slot, get_slot, hash_tag};
use spinel_client::{ClientError, cmd};

#[test]
fn test_known_slots() {
    assert_eq!(get_slot(b"foo"), 12182);
    assert_eq!(get_slot(b"bar"), 5061);
    assert_eq!(get_slot(b"hello"), 866);
    assert_eq!(get_slot(b""), 0);
}

#[test]
fn test_hash_tag_rules() {
    assert_eq!(hash_tag(b"{user1000}.following"), b"user1000");
    assert_eq!(hash_tag(b"foo{bar}{zap}"), b"bar");
    assert_eq!(hash_tag(b"a{}b"), b"a{}b");
    assert_eq!(hash_tag(b"{}{a}"), b"{}{a}");
    assert_eq!(hash_tag(b"no-braces"), b"no-braces");
    assert_eq!(hash_tag(b"open{only"), b"open{only");
    assert_eq!(
        get_slot(b"{user1000}.following"),
        get_slot(b"{user1000}.followers")
    );
}

#[test]
fn test_command_slot() {
    assert_eq!(command_slot(&cmd("PING")).unwrap(), None);
    assert_eq!(
        command_slot(&cmd("GET").arg("foo")).unwrap(),
        Some(12182)
    );
    assert_eq!(
        command_slot(&cmd("MSET").arg("{t}a").arg(1).arg("{t}b").arg(2)).unwrap(),
        Some(get_slot(b"t"))
    );
    assert!(matches!(
        command_slot(&cmd("MGET").arg("foo").arg("bar")),
        Err(ClientError::CrossSlot)
    ));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 500,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_slot_is_in_range(key in prop::collection::vec(any::<u8>(), 0..128)) {
        prop_assert!((get_slot(&key) as usize) < NUM_SLOTS);
    }

    #[test]
    fn test_tagged_keys_hash_like_their_tag(
        prefix in "[a-z:]{0,8}",
        tag in "[a-z0-9]{1,12}",
        suffix in "[a-z{}:]{0,8}"
    ) {
        let key = format!("{prefix}{{{tag}}}{suffix}");
        prop_assert_eq!(hash_tag(key.as_bytes()), tag.as_bytes());
        prop_assert_eq!(get_slot(key.as_bytes()), get_slot(tag.as_bytes()));
    }

    #[test]
    fn test_keys_sharing_a_tag_share_a_slot(
        tag in "[a-z0-9]{1,12}",
        names in prop::collection::vec("[a-z]{1,8}", 1..10)
    ) {
        let keys: Vec<String> = names.iter().map(|n| format!("{{{tag}}}:{n}")).collect();
        let slot = slot_of_keys(keys.iter().map(|k| k.as_bytes())).unwrap();
        prop_assert_eq!(slot, Some(get_slot(tag.as_bytes())));
    }
}
