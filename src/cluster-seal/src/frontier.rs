// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Frontier utilities.

use differential_dataflow::lattice::antichain_join;
use timely::progress::Antichain;
use timely::PartialOrder;

/// The logical timestamp of the cluster's collections.
pub type Timestamp = u64;

/// Reports the meet of `frontiers`: the greatest frontier that is less than or
/// equal to each of them.
///
/// The meet of no frontiers is the empty frontier, which is greater than
/// every other frontier.
pub fn meet<'a, I>(frontiers: I) -> Antichain<Timestamp>
where
    I: IntoIterator<Item = &'a Antichain<Timestamp>>,
{
    let mut result = Antichain::new();
    for frontier in frontiers {
        // Inserting every element retains exactly the minimal ones.
        result.extend(frontier.iter().cloned());
    }
    result
}

/// Reports the join of two frontiers: the least frontier that is greater than
/// or equal to both.
pub fn join(a: &Antichain<Timestamp>, b: &Antichain<Timestamp>) -> Antichain<Timestamp> {
    antichain_join(a, b)
}

/// Reports whether moving from `from` to `to` would go backwards.
pub fn regresses(from: &Antichain<Timestamp>, to: &Antichain<Timestamp>) -> bool {
    !PartialOrder::less_equal(from, to)
}

/// Renders a frontier for logs.
pub fn display(frontier: &Antichain<Timestamp>) -> String {
    let elements: Vec<_> = frontier.iter().map(|t| t.to_string()).collect();
    format!("[{}]", elements.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meet_is_least() {
        let a = Antichain::from_elem(5);
        let b = Antichain::from_elem(3);
        let c = Antichain::new();
        assert_eq!(meet([&a, &b, &c]), Antichain::from_elem(3));
        assert_eq!(meet([&c]), Antichain::new());
        assert_eq!(meet(std::iter::empty()), Antichain::new());
    }

    #[test]
    fn test_join_is_greatest() {
        let a = Antichain::from_elem(5);
        let b = Antichain::from_elem(3);
        assert_eq!(join(&a, &b), Antichain::from_elem(5));
        assert_eq!(join(&a, &Antichain::new()), Antichain::new());
    }

    #[test]
    fn test_regresses() {
        let early = Antichain::from_elem(1);
        let late = Antichain::from_elem(2);
        assert!(regresses(&late, &early));
        assert!(!regresses(&early, &late));
        assert!(!regresses(&early, &early));
        assert!(!regresses(&late, &Antichain::new()));
        assert!(regresses(&Antichain::new(), &late));
        assert_eq!(display(&late), "[2]");
    }
}
