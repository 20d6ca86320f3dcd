//! Delta resolution between local parts and remote state.

use std::collections::BTreeSet;

use crate::part::sanitized_name;

/// Names present locally but not remotely, sorted and deduplicated.
///
/// The result does not depend on the order either side was listed in. An
/// empty result means there is nothing left to do.
pub fn resolve<I, S>(local: I, remote: &BTreeSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    local
        .into_iter()
        .filter(|name| !remote.contains(name.as_ref()))
        .map(|name| name.as_ref().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Raw part names whose sanitized counterpart is not in `sanitized`, sorted.
///
/// Names that are not raw parts are ignored.
pub fn resolve_pending_transforms<I, S>(raw: I, sanitized: &BTreeSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|name| {
            let name = name.as_ref();
            let output = sanitized_name(name)?;
            (!sanitized.contains(&output)).then(|| name.to_string())
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_is_sorted_difference() {
        let local = ["c", "a", "b", "d"];
        let remote = set(&["b", "x"]);
        assert_eq!(resolve(local, &remote), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_resolve_same_sets_is_empty() {
        let names = ["part-0.json.gz", "part-1.json.gz"];
        assert!(resolve(names, &set(&names)).is_empty());
    }

    #[test]
    fn test_resolve_independent_of_order() {
        let remote = set(&["part-1.json.gz"]);
        let forward = resolve(["part-0.json.gz", "part-1.json.gz", "part-2.json.gz"], &remote);
        let backward = resolve(["part-2.json.gz", "part-1.json.gz", "part-0.json.gz"], &remote);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_resolve_staged_delta() {
        let local = [
            "part-0_NR.json.gz",
            "part-1_NR.json.gz",
            "part-2_NR.json.gz",
        ];
        let remote = set(&["part-0_NR.json.gz"]);
        assert_eq!(
            resolve(local, &remote),
            vec!["part-1_NR.json.gz", "part-2_NR.json.gz"]
        );
    }

    #[test]
    fn test_resolve_empty_local() {
        let local: [&str; 0] = [];
        assert!(resolve(local, &set(&["a"])).is_empty());
    }

    #[test]
    fn test_pending_transforms() {
        let raw = ["part-2.json.gz", "part-0.json.gz", "part-1.json.gz"];
        let done = set(&["part-1_NR.json.gz"]);
        assert_eq!(
            resolve_pending_transforms(raw, &done),
            vec!["part-0.json.gz", "part-2.json.gz"]
        );
    }

    #[test]
    fn test_pending_transforms_ignores_non_raw() {
        let raw = ["part-0_NR.json.gz", "notes.txt"];
        assert!(resolve_pending_transforms(raw, &BTreeSet::new()).is_empty());
    }
}
