//! Module allow/deny lists.

use std::collections::BTreeSet;

/// Outcome of checking a module path against a [`ModuleAccessList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportDecision {
    /// The path, or one of its dotted prefixes, is allowed and none is denied.
    Allowed,
    /// Neither list mentions the path. The import proceeds but is reported.
    Unlisted,
    /// The path, or one of its dotted prefixes, is denied.
    Denied,
}

/// Allowed and denied dotted module paths.
///
/// Matching is prefix-wise by whole segments: denying `a.b` denies `a.b` and
/// `a.b.c` but not `a.bc` or `a`. A path that is both allowed and denied is
/// denied. Lists only grow.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleAccessList {
    allowed: BTreeSet<String>,
    denied: BTreeSet<String>,
}

/// `a`, `a.b`, `a.b.c` for `a.b.c`.
fn prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('.')
        .map(|(idx, _)| &path[..idx])
        .chain(std::iter::once(path))
}

impl ModuleAccessList {
    /// An empty list: every path is unlisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a module and everything below it.
    pub fn allow(&mut self, path: impl Into<String>) {
        self.allowed.insert(path.into());
    }

    /// Deny a module and everything below it.
    pub fn deny(&mut self, path: impl Into<String>) {
        self.denied.insert(path.into());
    }

    /// Whether `path` or one of its prefixes is allowed.
    pub fn allows(&self, path: &str) -> bool {
        prefixes(path).any(|p| self.allowed.contains(p))
    }

    /// Whether `path` or one of its prefixes is denied.
    pub fn denies(&self, path: &str) -> bool {
        prefixes(path).any(|p| self.denied.contains(p))
    }

    /// Classify an import of `path`.
    pub fn decide(&self, path: &str) -> ImportDecision {
        if self.denies(path) {
            ImportDecision::Denied
        } else if self.allows(path) {
            ImportDecision::Allowed
        } else {
            ImportDecision::Unlisted
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_prefixes() {
        assert_eq!(prefixes("a.b.c").collect::<Vec<_>>(), ["a", "a.b", "a.b.c"]);
        assert_eq!(prefixes("json").collect::<Vec<_>>(), ["json"]);
    }

    #[test]
    fn test_segment_matching() {
        let mut list = ModuleAccessList::new();
        list.deny("os.path");
        assert!(list.denies("os.path"));
        assert!(list.denies("os.path.join"));
        assert!(!list.denies("os"));
        assert!(!list.denies("os.pathlib"));
    }

    #[test]
    fn test_decide() {
        let mut list = ModuleAccessList::new();
        list.allow("json");
        list.deny("socket");
        assert_eq!(list.decide("json"), ImportDecision::Allowed);
        assert_eq!(list.decide("socket"), ImportDecision::Denied);
        assert_eq!(list.decide("os"), ImportDecision::Unlisted);
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,5}"
    }

    fn module_path() -> impl Strategy<Value = String> {
        prop::collection::vec(segment(), 1..4).prop_map(|segments| segments.join("."))
    }

    proptest! {
        #[test]
        fn deny_beats_allow(path in module_path(), suffix in prop::option::of(module_path())) {
            let mut list = ModuleAccessList::new();
            list.allow(path.clone());
            list.deny(path.clone());
            let target = match suffix {
                Some(s) => format!("{path}.{s}"),
                None => path,
            };
            prop_assert_eq!(list.decide(&target), ImportDecision::Denied);
        }

        #[test]
        fn listing_covers_descendants(root in module_path(), rest in module_path()) {
            let mut list = ModuleAccessList::new();
            list.allow(root.clone());
            let child = format!("{root}.{rest}");
            prop_assert!(list.allows(&child));
            prop_assert_eq!(list.decide(&child), ImportDecision::Allowed);
        }

        #[test]
        fn listing_never_matches_sibling_names(root in module_path(), extra in "[a-z0-9]{1,3}") {
            let mut list = ModuleAccessList::new();
            list.deny(root.clone());
            let sibling = format!("{root}{extra}");
            prop_assert!(!list.denies(&sibling));
        }

        #[test]
        fn additions_never_unlist(paths in prop::collection::vec(module_path(), 1..6), path in module_path()) {
            let mut list = ModuleAccessList::new();
            let mut previous = list.decide(&path);
            for p in paths {
                list.allow(p);
                let after = list.decide(&path);
                prop_assert!(previous != ImportDecision::Allowed || after == ImportDecision::Allowed);
                previous = after;
            }
        }
    }
}
