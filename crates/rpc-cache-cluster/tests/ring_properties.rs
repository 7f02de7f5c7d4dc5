//! Ring placement properties
//!
//! - Lookups are a pure function of the alive set
//! - Adding a node only moves keys onto that node
//! - Removing a node only moves the keys it owned

use std::collections::HashSet;

use proptest::prelude::*;
use rpc_cache_cluster::{ClusterNode, Ring};
use rpc_cache_protocol::ArtifactKey;

fn node(i: usize) -> ClusterNode {
    let addr = format!("10.0.0.{}:7946", i);
    ClusterNode::new(format!("cache-{}", i), addr.clone(), addr)
}

fn key(i: u32) -> ArtifactKey {
    ArtifactKey::parse(format!("src/core/lib/{:08x}", i)).unwrap()
}

proptest! {
    #[test]
    fn prop_lookups_are_stable(n in 1usize..8, replication in 1usize..4, keys in prop::collection::vec(any::<u32>(), 1..50)) {
        let nodes: Vec<_> = (0..n).map(node).collect();
        let first = Ring::build(nodes.clone(), replication);
        let second = Ring::build(nodes.into_iter().rev(), replication);
        for k in keys {
            let k = key(k);
            prop_assert_eq!(first.owners(&k), first.owners(&k));
            prop_assert_eq!(first.owners(&k), second.owners(&k));
        }
    }

    #[test]
    fn prop_owners_are_distinct(n in 1usize..8, replication in 1usize..5, k in any::<u32>()) {
        let ring = Ring::build((0..n).map(node), replication);
        let owners = ring.owners(&key(k));
        prop_assert_eq!(owners.len(), replication.min(n));
        let names: HashSet<_> = owners.iter().map(|o| o.name.clone()).collect();
        prop_assert_eq!(names.len(), owners.len());
    }

    #[test]
    fn prop_adding_node_only_moves_keys_to_it(n in 1usize..8, keys in prop::collection::vec(any::<u32>(), 1..200)) {
        let before = Ring::build((0..n).map(node), 1);
        let after = Ring::build((0..=n).map(node), 1);
        let added = node(n);
        for k in keys {
            let k = key(k);
            let old = before.primary(&k).unwrap();
            let new = after.primary(&k).unwrap();
            if old != new {
                prop_assert_eq!(new, &added);
            }
        }
    }

    #[test]
    fn prop_removing_node_only_moves_its_keys(n in 2usize..8, keys in prop::collection::vec(any::<u32>(), 1..200)) {
        let before = Ring::build((0..n).map(node), 1);
        let removed = node(n - 1);
        let after = Ring::build((0..n - 1).map(node), 1);
        for k in keys {
            let k = key(k);
            let old = before.primary(&k).unwrap();
            if old != &removed {
                prop_assert_eq!(after.primary(&k).unwrap(), old);
            }
        }
    }
}

#[test]
fn test_adding_fifth_node_moves_about_a_fifth_of_keys() {
    let before = Ring::build((0..4).map(node), 1);
    let after = Ring::build((0..5).map(node), 1);
    let total = 10_000;
    let moved = (0..total)
        .filter(|&i| before.primary(&key(i)) != after.primary(&key(i)))
        .count();
    // Ideal share is 1/5; allow for vnode imbalance but never "most keys".
    assert!(moved > total as usize / 10, "moved {}", moved);
    assert!(moved < total as usize * 3 / 10, "moved {}", moved);
}
