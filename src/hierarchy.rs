//! Tag forest reconstruction and creation ordering.
//!
//! The closure table has already been folded into each tag's `parent_id` by
//! the snapshot loader; this module turns the flat map into a parent-before-
//! child creation order and holds the policy for matching against tags that
//! already exist remotely.

use std::collections::{BTreeMap, VecDeque};

use crate::checkpoint::LegacyTag;

/// Whether an existing remote tag satisfies a legacy tag, so no duplicate is
/// created. This is deliberately a containment check, not equality: the
/// remote name only has to appear inside the legacy name. Looser than it
/// probably should be, but it is the observed matching rule; tighten it here
/// if that ever changes.
pub fn remote_tag_satisfies(legacy_name: &str, remote_name: &str) -> bool {
    legacy_name.contains(remote_name)
}

/// Breadth-first creation order over the tag forest: all roots, then their
/// children, then grandchildren, to any depth. A tag whose parent is unknown
/// to the map (another user's tag, or one dropped from the export) is
/// treated as a root.
pub fn creation_order(tags: &BTreeMap<String, LegacyTag>) -> Vec<String> {
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut roots: Vec<&str> = Vec::new();

    for (id, tag) in tags {
        match tag
            .parent_id
            .as_deref()
            .filter(|parent| tags.contains_key(*parent))
        {
            Some(parent) => children.entry(parent).or_default().push(id),
            None => roots.push(id),
        }
    }

    let mut order = Vec::with_capacity(tags.len());
    let mut queue: VecDeque<&str> = roots.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(kids) = children.get(id) {
            queue.extend(kids.iter().copied());
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, parent: Option<&str>) -> LegacyTag {
        LegacyTag {
            name: name.into(),
            parent_id: parent.map(String::from),
            assets: Vec::new(),
        }
    }

    fn forest(entries: &[(&str, LegacyTag)]) -> BTreeMap<String, LegacyTag> {
        entries
            .iter()
            .map(|(id, tag)| (id.to_string(), tag.clone()))
            .collect()
    }

    #[test]
    fn parents_come_before_children() {
        let tags = forest(&[
            ("tagB", tag("2021/Holidays", Some("tagA"))),
            ("tagA", tag("2021", None)),
        ]);
        assert_eq!(creation_order(&tags), vec!["tagA", "tagB"]);
    }

    #[test]
    fn order_is_breadth_first_at_arbitrary_depth() {
        let tags = forest(&[
            ("r", tag("root", None)),
            ("c1", tag("child one", Some("r"))),
            ("c2", tag("child two", Some("r"))),
            ("g1", tag("grandchild", Some("c1"))),
            ("gg1", tag("great-grandchild", Some("g1"))),
        ]);
        assert_eq!(creation_order(&tags), vec!["r", "c1", "c2", "g1", "gg1"]);
    }

    #[test]
    fn unknown_parent_makes_a_tag_a_root() {
        let tags = forest(&[("orphan", tag("People/Sam", Some("someone-elses-tag")))]);
        assert_eq!(creation_order(&tags), vec!["orphan"]);
    }

    #[test]
    fn every_tag_appears_exactly_once() {
        let tags = forest(&[
            ("a", tag("a", None)),
            ("b", tag("b", Some("a"))),
            ("c", tag("c", Some("a"))),
            ("d", tag("d", Some("c"))),
            ("e", tag("e", None)),
        ]);
        let mut order = creation_order(&tags);
        assert_eq!(order.len(), 5);
        order.sort();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn containment_matching_is_looser_than_equality() {
        assert!(remote_tag_satisfies("2021/Holidays", "2021/Holidays"));
        // A remote tag named "2021" swallows every legacy tag containing it.
        assert!(remote_tag_satisfies("2021/Holidays", "2021"));
        assert!(!remote_tag_satisfies("2021", "2021/Holidays"));
    }
}
