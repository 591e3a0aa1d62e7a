//! Namespaced identifiers
//!
//! Every tool, prompt, resource, and template the gateway exposes carries the
//! owning backend's name as a prefix so identifiers stay unique across
//! backends. The split is never parsed back out of the id; catalog entries
//! store the owning backend alongside the original identifier.

/// Build the namespaced id for a tool or prompt.
#[must_use]
pub fn namespaced_id(backend: &str, original: &str) -> String {
    format!("{backend}_{original}")
}

/// Build the namespaced URI for a resource.
///
/// The original URI is folded into a URI-safe token first: every character
/// outside `[A-Za-z0-9._~-]` becomes `_` and runs of `_` collapse to one.
/// The transformation is lossy; callers must keep the original URI on the
/// catalog entry.
#[must_use]
pub fn namespaced_uri(backend: &str, uri: &str) -> String {
    format!("{backend}_{}", sanitize_uri(uri))
}

/// Key under which a resource template is stored.
#[must_use]
pub fn template_key(backend: &str, uri_template: &str) -> String {
    format!("{backend}_{uri_template}")
}

/// Fold a URI into a URI-safe token.
#[must_use]
pub fn sanitize_uri(uri: &str) -> String {
    let mut out = String::with_capacity(uri.len());
    let mut last_was_underscore = false;
    for c in uri.chars() {
        let mapped = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '-') {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(mapped);
            last_was_underscore = false;
        }
    }
    out
}

/// Tokenize an identifier or description into lowercase terms, splitting on
/// non-alphanumeric characters.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Rank catalog ids by similarity to a miss and return the closest few.
///
/// Token overlap with a prefix bonus; good enough to suggest `alpha_echo`
/// for `alpha_ecko` without pulling in an edit-distance crate.
#[must_use]
pub fn suggestions<'a, I>(query: &str, candidates: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let query_lower = query.to_lowercase();
    let query_tokens = tokenize(query);

    let mut scored: Vec<(String, usize)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let candidate_lower = candidate.to_lowercase();
            let mut score = 0usize;

            if candidate_lower.starts_with(&query_lower) || query_lower.starts_with(&candidate_lower)
            {
                score += 4;
            }
            let candidate_tokens = tokenize(candidate);
            score += query_tokens
                .iter()
                .filter(|t| candidate_tokens.contains(t))
                .count()
                * 2;
            if candidate_lower.contains(&query_lower) || query_lower.contains(&candidate_lower) {
                score += 1;
            }

            (score > 0).then(|| (candidate.to_string(), score))
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(limit);
    scored.into_iter().map(|(name, _)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── sanitize_uri ──────────────────────────────────────────────────

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_uri("file:///a.txt"), "file_a.txt");
        assert_eq!(sanitize_uri("https://host/path?q=1"), "https_host_path_q_1");
    }

    #[test]
    fn sanitize_collapses_underscore_runs() {
        assert_eq!(sanitize_uri("a:///b"), "a_b");
        assert_eq!(sanitize_uri("a___b"), "a_b");
    }

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_uri("a.b~c-d_e"), "a.b~c-d_e");
    }

    #[test]
    fn namespaced_uri_matches_wire_shape() {
        // file:///a.txt -> file_a.txt, prefixed by the backend name
        assert_eq!(namespaced_uri("fs", "file:///a.txt"), "fs_file_a.txt");
    }

    // ── namespaced ids ────────────────────────────────────────────────

    #[test]
    fn namespaced_id_is_backend_underscore_name() {
        assert_eq!(namespaced_id("alpha", "echo"), "alpha_echo");
        // Underscores inside either part are preserved as-is; the catalog
        // entry, not the id, records the owner.
        assert_eq!(namespaced_id("my_backend", "my_tool"), "my_backend_my_tool");
    }

    #[test]
    fn distinct_pairs_produce_distinct_ids() {
        let a = namespaced_id("alpha", "echo");
        let b = namespaced_id("beta", "echo");
        assert_ne!(a, b);
    }

    // ── suggestions ───────────────────────────────────────────────────

    #[test]
    fn suggestions_finds_near_miss() {
        let catalog = ["alpha_echo", "beta_echo", "alpha_search"];
        let hits = suggestions("alpha_ecko", catalog, 3);
        assert_eq!(hits.first().map(String::as_str), Some("alpha_echo"));
    }

    #[test]
    fn suggestions_respects_limit() {
        let catalog = ["t_one", "t_two", "t_three", "t_four"];
        let hits = suggestions("t", catalog, 2);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn suggestions_empty_for_unrelated_query() {
        let catalog = ["alpha_echo"];
        let hits = suggestions("zzz", catalog, 3);
        assert!(hits.is_empty());
    }

    #[test]
    fn tokenize_splits_identifiers() {
        assert_eq!(tokenize("get_current_time"), vec!["get", "current", "time"]);
        assert_eq!(tokenize("Search the WEB"), vec!["search", "the", "web"]);
    }
}
