/**
 * Namespace scoping for watches
 *
 * Included namespaces become one watch each. Excluded namespaces are pushed
 * to the API server as a field selector on a single cluster-wide watch.
 */

const NAMESPACE_NOT_EQUAL: &str = "metadata.namespace!=";

/// Build the field selector that excludes `exclude_namespaces`.
///
/// Clauses are emitted last-to-first, each with a trailing comma. Empty
/// entries are skipped, so `[""]` yields an empty selector.
#[must_use]
pub fn generate_field_selector(exclude_namespaces: &[String]) -> String {
    exclude_namespaces
        .iter()
        .rev()
        .filter(|ns| !ns.is_empty())
        .map(|ns| format!("{NAMESPACE_NOT_EQUAL}{ns},"))
        .collect()
}

/// Namespaces to open a watch on; `None` is a cluster-wide watch.
///
/// An empty list, or any empty entry, selects the whole cluster. Duplicates
/// are watched once.
#[must_use]
pub fn watch_namespaces(include_namespaces: &[String]) -> Vec<Option<String>> {
    if include_namespaces.is_empty() || include_namespaces.iter().any(String::is_empty) {
        return vec![None];
    }

    let mut namespaces: Vec<Option<String>> = Vec::with_capacity(include_namespaces.len());
    for ns in include_namespaces {
        let ns = Some(ns.clone());
        if !namespaces.contains(&ns) {
            namespaces.push(ns);
        }
    }
    namespaces
}

/// Whether `selector` (as produced by [`generate_field_selector`]) filters
/// out an object living in `namespace`.
#[must_use]
pub fn field_selector_excludes(selector: &str, namespace: Option<&str>) -> bool {
    let namespace = namespace.unwrap_or_default();
    selector
        .split(',')
        .filter_map(|clause| clause.trim().strip_prefix(NAMESPACE_NOT_EQUAL))
        .any(|excluded| excluded == namespace)
}
