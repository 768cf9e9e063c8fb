//! Adjacency reconciliation and route derivation.
//!
//! Every node gossips its own neighbor list; the union of those claims is
//! the `network` map. Claims can disagree while the mesh converges (one
//! side of a new link announces before the other), so routing never reads
//! `network` directly. Instead it reads the *effective network*: the
//! subset of edges both endpoints agree on, which is symmetric by
//! construction. Routes are first hops on shortest paths over that graph.

use std::collections::{BTreeSet, HashMap, VecDeque};

use weft_proto::Mesh;

/// Reduce self-declared adjacencies to the mutually agreed edges.
///
/// Edge `(a, b)` survives iff `b` is in `a`'s list and `a` is in `b`'s.
/// Neighbor lists in the result are sorted and deduplicated.
pub fn effective_network(network: &Mesh) -> Mesh {
    let mut effective: HashMap<String, BTreeSet<String>> = HashMap::new();

    for (a, neighbors) in network {
        for b in neighbors {
            let mutual = network
                .get(b)
                .map(|back| back.iter().any(|n| n == a))
                .unwrap_or(false);
            if mutual {
                effective.entry(a.clone()).or_default().insert(b.clone());
                effective.entry(b.clone()).or_default().insert(a.clone());
            }
        }
    }

    effective
        .into_iter()
        .map(|(name, set)| (name, set.into_iter().collect()))
        .collect()
}

/// First-hop routes from `origin` over `effective`.
///
/// Breadth-first search visiting neighbors in sorted order, so when several
/// shortest paths exist the first hop is the lexicographically smallest.
/// `origin` routes to itself; unreachable nodes have no entry.
pub fn routes_from(origin: &str, effective: &Mesh) -> HashMap<String, String> {
    let mut routes: HashMap<String, String> = HashMap::new();
    routes.insert(origin.to_string(), origin.to_string());

    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(origin.to_string());

    while let Some(current) = queue.pop_front() {
        let Some(neighbors) = effective.get(&current) else {
            continue;
        };
        for next in neighbors {
            if routes.contains_key(next) {
                continue;
            }
            let first_hop = if current == origin {
                next.clone()
            } else {
                routes[&current].clone()
            };
            routes.insert(next.clone(), first_hop);
            queue.push_back(next.clone());
        }
    }

    routes
}
