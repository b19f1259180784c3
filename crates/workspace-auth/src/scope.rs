//! Scope validation and canonical cache keys
//!
//! Plain set containment: no scope implies another (`drive` does not cover
//! `drive.readonly` here even though Google treats it as broader).

use std::collections::BTreeSet;

/// Cache key used when a caller does not name any scopes.
pub const DEFAULT_CACHE_KEY: &str = "default";

/// True iff every required scope is present in `granted`.
pub fn covers<S: AsRef<str>>(granted: &BTreeSet<String>, required: &[S]) -> bool {
    required
        .iter()
        .all(|scope| granted.contains(AsRef::<str>::as_ref(scope)))
}

/// Required scopes absent from `granted`, sorted and deduplicated.
pub fn missing<S: AsRef<str>>(granted: &BTreeSet<String>, required: &[S]) -> Vec<String> {
    required
        .iter()
        .map(AsRef::<str>::as_ref)
        .filter(|s| !granted.contains(*s))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Canonical cache key for a scope set: sorted, deduplicated, space-joined.
///
/// Call-site ordering and repeats never change the key.
pub fn cache_key<S: AsRef<str>>(scopes: &[S]) -> String {
    if scopes.is_empty() {
        return DEFAULT_CACHE_KEY.to_string();
    }
    let set: BTreeSet<&str> = scopes.iter().map(AsRef::<str>::as_ref).collect();
    set.into_iter().collect::<Vec<_>>().join(" ")
}

/// Union of two scope lists, sorted and deduplicated.
pub fn union<A: AsRef<str>, B: AsRef<str>>(a: &[A], b: &[B]) -> Vec<String> {
    a.iter()
        .map(|s| AsRef::<str>::as_ref(s).to_string())
        .chain(b.iter().map(|s| AsRef::<str>::as_ref(s).to_string()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(scopes: &[&str]) -> BTreeSet<String> {
        scopes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn superset_covers_subset() {
        let g = granted(&["calendar", "drive", "gmail"]);
        assert!(covers(&g, &["calendar"]));
        assert!(covers(&g, &["drive", "calendar"]));
        assert!(covers(&g, &["calendar", "drive", "gmail"]));
    }

    #[test]
    fn every_subset_of_granted_is_covered() {
        let all = ["a", "b", "c", "d"];
        let g = granted(&all);
        for mask in 0u8..16 {
            let subset: Vec<&str> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, s)| *s)
                .collect();
            assert!(covers(&g, &subset), "subset {subset:?} must be covered");
        }
    }

    #[test]
    fn empty_requirement_is_always_covered() {
        assert!(covers(&granted(&[]), &[] as &[&str]));
    }

    #[test]
    fn missing_scope_is_reported() {
        let g = granted(&["calendar"]);
        assert!(!covers(&g, &["calendar", "drive"]));
        assert_eq!(missing(&g, &["drive", "calendar", "drive"]), vec!["drive"]);
    }

    #[test]
    fn no_scope_hierarchy() {
        let g = granted(&["https://www.googleapis.com/auth/drive"]);
        assert!(!covers(&g, &["https://www.googleapis.com/auth/drive.readonly"]));
    }

    #[test]
    fn cache_key_is_order_independent() {
        assert_eq!(
            cache_key(&["gmail", "calendar"]),
            cache_key(&["calendar", "gmail", "calendar"])
        );
        assert_eq!(cache_key(&["gmail", "calendar"]), "calendar gmail");
    }

    #[test]
    fn cache_key_defaults_when_empty() {
        assert_eq!(cache_key(&[] as &[String]), DEFAULT_CACHE_KEY);
    }

    #[test]
    fn union_merges_and_sorts() {
        assert_eq!(
            union(&["gmail", "calendar"], &["drive", "gmail"]),
            vec!["calendar", "drive", "gmail"]
        );
    }
}
