//! Tests for validator-set construction, proposer election, and updates.
//!
//! The proposer sequences in here are observable consensus behavior: every
//! correct node must reproduce them bit-for-bit, so the expected vectors
//! are spelled out rather than computed.

use tessera_crypto::{Address, PrivateKey};
use tessera_types::{
    Validator, ValidatorSet, ValidatorSetError, MAX_TOTAL_VOTING_POWER,
    PRIORITY_WINDOW_SIZE_FACTOR,
};

fn addr(name: &str) -> Address {
    let mut bytes = [0u8; 20];
    let name = name.as_bytes();
    bytes[..name.len()].copy_from_slice(name);
    Address(bytes)
}

fn val(name: &str, power: i64) -> Validator {
    Validator::with_address(addr(name), power)
}

fn proposer_name(set: &ValidatorSet, names: &[&str]) -> String {
    let address = set.proposer().unwrap().address;
    names
        .iter()
        .find(|n| addr(n) == address)
        .unwrap_or_else(|| panic!("unknown proposer {address}"))
        .to_string()
}

/// Centering and scaling invariants that must hold after every update.
fn verify_set_invariants(set: &ValidatorSet) {
    let n = set.len() as i64;
    let priorities: Vec<i64> = set
        .validators()
        .iter()
        .map(|v| v.proposer_priority)
        .collect();

    let sum: i64 = priorities.iter().sum();
    assert!(
        sum > -n && sum < n,
        "priorities not centered: sum {sum}, n {n}"
    );

    let max = priorities.iter().max().unwrap();
    let min = priorities.iter().min().unwrap();
    assert!(
        max - min <= PRIORITY_WINDOW_SIZE_FACTOR * set.total_voting_power(),
        "priority spread {} exceeds window {}",
        max - min,
        PRIORITY_WINDOW_SIZE_FACTOR * set.total_voting_power()
    );
}

#[test]
fn equal_powers_rotate_in_address_order() {
    // Three validators with equal power must rotate v0, v1, v2 forever.
    let mut set = ValidatorSet::new(vec![val("v0", 100), val("v1", 100), val("v2", 100)]).unwrap();

    let expected = ["v0", "v1", "v2"];
    for i in 0..15 {
        assert_eq!(
            proposer_name(&set, &["v0", "v1", "v2"]),
            expected[i % 3],
            "iteration {i}"
        );
        set.increment_proposer_priority(1);
    }
}

#[test]
fn mixed_powers_follow_reference_sequence() {
    // Powers 1000/300/330; the full 99-election sequence is the reference
    // vector for the priority algebra, including its tie-breaks.
    let mut set = ValidatorSet::new(vec![
        val("foo", 1000),
        val("bar", 300),
        val("baz", 330),
    ])
    .unwrap();

    let mut proposers = Vec::with_capacity(99);
    for _ in 0..99 {
        proposers.push(proposer_name(&set, &["foo", "bar", "baz"]));
        set.increment_proposer_priority(1);
    }

    let expected = "foo baz foo bar foo foo baz foo bar foo foo baz foo foo bar foo baz foo foo bar \
foo foo baz foo bar foo foo baz foo bar foo foo baz foo foo bar foo baz foo foo bar \
foo baz foo foo bar foo baz foo foo bar foo baz foo foo foo baz bar foo foo foo baz \
foo bar foo foo baz foo bar foo foo baz foo bar foo foo baz foo bar foo foo baz foo \
foo bar foo baz foo foo bar foo baz foo foo bar foo baz foo foo";
    assert_eq!(proposers.join(" "), expected);
}

#[test]
fn proposer_election_is_proportional() {
    // Powers 4/5/3 out of 12: over 120 elections each validator proposes
    // exactly its proportional share.
    let mut set = ValidatorSet::new(vec![val("a4", 4), val("b5", 5), val("c3", 3)]).unwrap();

    let mut counts = std::collections::HashMap::new();
    for _ in 0..120 {
        let name = proposer_name(&set, &["a4", "b5", "c3"]);
        *counts.entry(name).or_insert(0) += 1;
        set.increment_proposer_priority(1);
    }
    assert_eq!(counts["a4"], 40);
    assert_eq!(counts["b5"], 50);
    assert_eq!(counts["c3"], 30);
}

#[test]
fn single_heavy_validator_proposes_twice_in_a_row() {
    // 400 out of (100+100+400): not enough to propose twice in a row.
    let set = ValidatorSet::new(vec![val("a", 100), val("b", 100), val("c", 400)]).unwrap();
    let mut set = set;
    assert_eq!(proposer_name(&set, &["a", "b", "c"]), "c");
    set.increment_proposer_priority(1);
    assert_eq!(proposer_name(&set, &["a", "b", "c"]), "a");

    // 401: just enough to take the first two slots.
    let mut set = ValidatorSet::new(vec![val("a", 100), val("b", 100), val("c", 401)]).unwrap();
    assert_eq!(proposer_name(&set, &["a", "b", "c"]), "c");
    set.increment_proposer_priority(1);
    assert_eq!(proposer_name(&set, &["a", "b", "c"]), "c");
    set.increment_proposer_priority(1);
    assert_eq!(proposer_name(&set, &["a", "b", "c"]), "a");
}

#[test]
fn increment_with_times_matches_repeated_single_increments() {
    // Electing k rounds ahead in one call must land on the same proposer as
    // k single increments.
    let base = ValidatorSet::new(vec![
        val("foo", 1000),
        val("bar", 300),
        val("baz", 330),
    ])
    .unwrap();

    for times in 1..=12 {
        let bulk = base.copy_increment_proposer_priority(times);
        let mut stepped = base.clone();
        for _ in 0..times {
            stepped.increment_proposer_priority(1);
        }
        assert_eq!(
            bulk.proposer().unwrap().address,
            stepped.proposer().unwrap().address,
            "times {times}"
        );
    }
}

#[test]
fn hash_is_stable_under_increment_and_copy() {
    let set = ValidatorSet::new(vec![val("v1", 10), val("v2", 20), val("v3", 30)]).unwrap();
    let copy = set.clone();
    assert_eq!(set.hash(), copy.hash());
    assert_eq!(set.proposer_priority_hash(), copy.proposer_priority_hash());

    // Incrementing changes the priority hash but never the set hash.
    let incremented = set.copy_increment_proposer_priority(1);
    assert_eq!(set.hash(), incremented.hash());
    assert_ne!(
        set.proposer_priority_hash(),
        incremented.proposer_priority_hash()
    );
}

#[test]
fn empty_set_has_empty_merkle_hash() {
    // SHA-256 of the empty string, the root of a zero-leaf Merkle tree.
    assert_eq!(
        hex::encode(ValidatorSet::empty().hash()),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(ValidatorSet::empty().proposer_priority_hash(), None);
}

#[test]
fn serde_roundtrip_preserves_everything() {
    let mut set = ValidatorSet::new(vec![
        Validator::new(PrivateKey::from_seed_ed25519([1u8; 32]).public_key(), 50),
        Validator::new(PrivateKey::from_seed_ed25519([2u8; 32]).public_key(), 30),
        Validator::new(PrivateKey::from_seed_ed25519([3u8; 32]).public_key(), 20),
    ])
    .unwrap();
    set.increment_proposer_priority(7);

    let json = serde_json::to_string(&set).unwrap();
    let restored: ValidatorSet = serde_json::from_str(&json).unwrap();

    assert_eq!(set, restored);
    assert_eq!(set.hash(), restored.hash());
    assert_eq!(set.proposer_priority_hash(), restored.proposer_priority_hash());
    assert_eq!(
        set.proposer().unwrap().address,
        restored.proposer().unwrap().address
    );

    // The restored set must continue the election identically.
    let mut a = set;
    let mut b = restored;
    for _ in 0..50 {
        a.increment_proposer_priority(1);
        b.increment_proposer_priority(1);
        assert_eq!(a.proposer().unwrap().address, b.proposer().unwrap().address);
    }
}

#[test]
fn updates_apply_and_merge() {
    // Voting power changes.
    let mut set = ValidatorSet::new(vec![val("v1", 10), val("v2", 10)]).unwrap();
    set.update_with_change_set(&[val("v2", 22), val("v1", 11)])
        .unwrap();
    let powers: Vec<(Address, i64)> = set
        .validators()
        .iter()
        .map(|v| (v.address, v.voting_power))
        .collect();
    assert_eq!(powers, vec![(addr("v2"), 22), (addr("v1"), 11)]);
    verify_set_invariants(&set);

    // Additions land in canonical position.
    let mut set = ValidatorSet::new(vec![val("v3", 20), val("v1", 10)]).unwrap();
    set.update_with_change_set(&[val("v2", 30)]).unwrap();
    let names: Vec<Address> = set.validators().iter().map(|v| v.address).collect();
    assert_eq!(names, vec![addr("v2"), addr("v3"), addr("v1")]);
    verify_set_invariants(&set);

    // Deletions.
    let mut set =
        ValidatorSet::new(vec![val("v3", 30), val("v2", 20), val("v1", 10)]).unwrap();
    set.update_with_change_set(&[val("v2", 0)]).unwrap();
    let names: Vec<Address> = set.validators().iter().map(|v| v.address).collect();
    assert_eq!(names, vec![addr("v3"), addr("v1")]);
    verify_set_invariants(&set);
}

#[test]
fn update_is_permutation_invariant() {
    // Any permutation of the same change set must produce the identical
    // set, priorities included.
    let base = {
        let mut set = ValidatorSet::new(vec![
            val("v1", 10),
            val("v2", 10),
            val("v3", 10),
            val("v4", 10),
        ])
        .unwrap();
        set.increment_proposer_priority(5);
        set
    };

    let updates = [val("v4", 44), val("v3", 33), val("v2", 22), val("v1", 11)];

    let expected = {
        let mut set = base.clone();
        set.update_with_change_set(&updates).unwrap();
        set
    };

    // All 24 permutations of 4 elements.
    let perms: Vec<Vec<usize>> = permutations(4);
    for perm in perms {
        let permuted: Vec<Validator> = perm.iter().map(|&i| updates[i].clone()).collect();
        let mut set = base.clone();
        set.update_with_change_set(&permuted).unwrap();
        assert_eq!(set, expected, "permutation {perm:?}");
        verify_set_invariants(&set);
    }

    let powers: Vec<(Address, i64)> = expected
        .validators()
        .iter()
        .map(|v| (v.address, v.voting_power))
        .collect();
    assert_eq!(
        powers,
        vec![
            (addr("v4"), 44),
            (addr("v3"), 33),
            (addr("v2"), 22),
            (addr("v1"), 11),
        ]
    );
}

#[test]
fn mixed_update_is_permutation_invariant() {
    let base = ValidatorSet::new(vec![
        val("v1", 10),
        val("v2", 20),
        val("v3", 30),
        val("v4", 40),
    ])
    .unwrap();

    let changes = [
        val("v1", 0),
        val("v3", 0),
        val("v2", 22),
        val("v5", 50),
        val("v4", 44),
    ];

    let expected = {
        let mut set = base.clone();
        set.update_with_change_set(&changes).unwrap();
        set
    };

    for perm in permutations(5) {
        let permuted: Vec<Validator> = perm.iter().map(|&i| changes[i].clone()).collect();
        let mut set = base.clone();
        set.update_with_change_set(&permuted).unwrap();
        assert_eq!(set, expected, "permutation {perm:?}");
    }
}

#[test]
fn update_errors_are_atomic() {
    let make_set = || {
        let mut set = ValidatorSet::new(vec![val("v1", 10), val("v2", 10)]).unwrap();
        set.increment_proposer_priority(3);
        set
    };

    let error_cases: Vec<Vec<Validator>> = vec![
        // Duplicate entries.
        vec![val("v1", 11), val("v1", 22)],
        // Duplicates separated by a valid change.
        vec![val("v1", 11), val("v2", 22), val("v1", 12)],
        // Duplicate removals.
        vec![val("v1", 0), val("v1", 0)],
        // Remove and update the same validator.
        vec![val("v1", 0), val("v2", 20), val("v1", 30)],
        // Negative power.
        vec![val("v1", -123)],
        // Remove a non-existent validator.
        vec![val("v3", 0)],
        // Delete everyone.
        vec![val("v1", 0), val("v2", 0)],
        // Single update overflowing the cap.
        vec![val("v1", i64::MAX)],
    ];

    for (i, changes) in error_cases.iter().enumerate() {
        let mut set = make_set();
        let before = set.clone();
        let err = set.update_with_change_set(changes);
        assert!(err.is_err(), "case {i} should fail");
        assert_eq!(set, before, "case {i} mutated the set on error");
    }
}

#[test]
fn overflow_is_rejected_with_typed_error() {
    // A large-but-legal update is fine.
    let mut set = ValidatorSet::new(vec![val("v1", 1)]).unwrap();
    set.update_with_change_set(&[val("v1", MAX_TOTAL_VOTING_POWER / 2)])
        .unwrap();

    // Pushing the total over the cap fails atomically with the typed error.
    let before = set.clone();
    let err = set
        .update_with_change_set(&[val("v2", i64::MAX)])
        .unwrap_err();
    assert!(matches!(err, ValidatorSetError::TotalVotingPowerOverflow(_)));
    assert_eq!(set, before);

    // Two legal powers whose sum overflows are also caught.
    let before = set.clone();
    let err = set
        .update_with_change_set(&[val("v2", MAX_TOTAL_VOTING_POWER - 1)])
        .unwrap_err();
    assert!(matches!(err, ValidatorSetError::TotalVotingPowerOverflow(_)));
    assert_eq!(set, before);
}

#[test]
fn deleting_from_empty_set_fails() {
    let mut set = ValidatorSet::empty();
    assert!(set
        .update_with_change_set(&[val("v1", 0), val("v2", 0)])
        .is_err());

    // Adding to the empty set works.
    set.update_with_change_set(&[val("v1", 100), val("v2", 100)])
        .unwrap();
    verify_set_invariants(&set);
}

#[test]
fn canonical_order_is_independent_of_input_order() {
    let sorted = [
        ("validator10", 20i64),
        ("validator12", 20),
        ("validator13", 15),
        ("validator44", 12),
        ("validator32", 10),
        ("validator16", 5),
        ("validator17", 5),
    ];

    for perm in permutations(sorted.len()) {
        let input: Vec<Validator> = perm.iter().map(|&i| val(sorted[i].0, sorted[i].1)).collect();
        let set = ValidatorSet::new(input).unwrap();
        for (i, v) in set.validators().iter().enumerate() {
            assert_eq!(v.address, addr(sorted[i].0), "permutation {perm:?} slot {i}");
            assert_eq!(v.voting_power, sorted[i].1);
        }
    }
}

#[test]
fn removed_heavy_validator_leaves_clean_rotation() {
    // After removing a dominant validator, the survivors rotate fairly.
    let mut set = ValidatorSet::new(vec![val("v3", 1000), val("v1", 1), val("v2", 1)]).unwrap();
    set.increment_proposer_priority(13);
    set.update_with_change_set(&[val("v3", 0)]).unwrap();
    verify_set_invariants(&set);

    let mut counts = std::collections::HashMap::new();
    for _ in 0..10 {
        *counts
            .entry(proposer_name(&set, &["v1", "v2"]))
            .or_insert(0) += 1;
        set.increment_proposer_priority(1);
    }
    assert_eq!(counts["v1"], 5);
    assert_eq!(counts["v2"], 5);
}

/// All permutations of `0..n` (n small).
fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn recurse(current: &mut Vec<usize>, remaining: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if remaining.is_empty() {
            out.push(current.clone());
            return;
        }
        for i in 0..remaining.len() {
            let item = remaining.remove(i);
            current.push(item);
            recurse(current, remaining, out);
            current.pop();
            remaining.insert(i, item);
        }
    }
    let mut out = Vec::new();
    recurse(&mut Vec::new(), &mut (0..n).collect(), &mut out);
    out
}
