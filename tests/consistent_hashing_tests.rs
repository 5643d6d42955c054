//! Distribution and rebalancing properties of the hash ring
use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use wren::consistent_hashing::HashRing;
use wren::error::WrenError;

const KEYS: usize = 10_000;

fn keys() -> Vec<String> {
    (0..KEYS).map(|i| format!("key_{}", i)).collect()
}

fn owners(ring: &HashRing, keys: &[String]) -> Vec<String> {
    keys.iter()
        .map(|key| ring.lookup(key).unwrap().to_string())
        .collect()
}

#[test]
fn test_three_nodes_share_keys_evenly() {
    let ring = HashRing::with_nodes(160, ["A", "B", "C"]);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for owner in owners(&ring, &keys()) {
        *counts.entry(owner).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    for (node, count) in counts {
        let share = count as f64 / KEYS as f64;
        assert!(
            (0.25..=0.42).contains(&share),
            "node {} holds {:.1}% of keys",
            node,
            share * 100.0
        );
    }
}

#[test]
fn test_random_keys_spread_over_every_node() {
    let ring = HashRing::with_nodes(160, ["A", "B", "C"]);
    let mut rng = rand::thread_rng();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..KEYS {
        let key: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        *counts.entry(ring.lookup(&key).unwrap().to_string()).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|count| *count > KEYS / 4));
}

#[test]
fn test_adding_a_node_relocates_under_thirty_percent() {
    let keys = keys();
    let mut ring = HashRing::with_nodes(160, ["A", "B", "C"]);
    let before = owners(&ring, &keys);
    assert!(ring.add_node("D"));
    let after = owners(&ring, &keys);

    let moved: Vec<usize> = (0..KEYS).filter(|i| before[*i] != after[*i]).collect();
    assert!(
        moved.len() < KEYS * 30 / 100,
        "{} of {} keys moved",
        moved.len(),
        KEYS
    );
    assert!(!moved.is_empty());
    // every relocated key moved to the new node
    assert!(moved.iter().all(|i| after[*i] == "D"));
}

#[test]
fn test_removing_a_node_relocates_only_its_keys() {
    let keys = keys();
    let mut ring = HashRing::with_nodes(160, ["A", "B", "C"]);
    let before = owners(&ring, &keys);
    assert!(ring.remove_node("B"));
    let after = owners(&ring, &keys);

    for i in 0..KEYS {
        if before[i] == "B" {
            assert_ne!(after[i], "B");
        } else {
            assert_eq!(before[i], after[i], "key {} moved off {}", keys[i], before[i]);
        }
    }
}

#[test]
fn test_ring_introspection() {
    let mut ring = HashRing::new(50);
    assert!(ring.is_empty());
    assert_eq!(ring.lookup("key"), Err(WrenError::EmptyRing));

    ring.add_node("A");
    ring.add_node("B");
    assert_eq!(ring.node_count(), 2);
    assert_eq!(ring.nodes(), vec!["A".to_string(), "B".to_string()]);
    assert!(ring.len() <= 100);
    assert!(ring.len() > 90);
    assert_eq!(ring.virtual_nodes(), 50);
    assert!(ring.contains_node("A"));

    ring.remove_node("A");
    ring.remove_node("B");
    assert!(ring.is_empty());
    assert_eq!(ring.lookup("key"), Err(WrenError::EmptyRing));
}
