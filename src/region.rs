//! Region name lookup
//!
//! Users type regions loosely ("US East", "us-east", "useast1"). This
//! resolves a query against the provider's known regions without touching
//! any orchestrator state.

/// Lowercase alphanumerics only
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Resolve `query` to one of `known`, or return `fallback`
///
/// Tries, in order: exact match, case and punctuation insensitive match,
/// prefix match, substring match. Within a step the first region in
/// `known` order wins.
pub fn resolve_region<S: AsRef<str>>(query: &str, known: &[S], fallback: &str) -> String {
    let query = query.trim();
    if query.is_empty() {
        return fallback.to_string();
    }

    if let Some(hit) = known.iter().find(|r| r.as_ref() == query) {
        return hit.as_ref().to_string();
    }

    let wanted = normalize(query);
    if wanted.is_empty() {
        return fallback.to_string();
    }
    let normalized: Vec<(String, &str)> = known
        .iter()
        .map(|r| (normalize(r.as_ref()), r.as_ref()))
        .collect();

    let steps: [fn(&str, &str) -> bool; 3] = [
        |candidate, wanted| candidate == wanted,
        |candidate, wanted| candidate.starts_with(wanted),
        |candidate, wanted| candidate.contains(wanted),
    ];
    for matches in steps {
        if let Some((_, original)) = normalized.iter().find(|(n, _)| matches(n, &wanted)) {
            return original.to_string();
        }
    }

    fallback.to_string()
}
