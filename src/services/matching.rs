//! Relevance scoring for merged search results.
//!
//! Scores are 0..=100. External catalog entries get a small boost so the
//! broader catalog wins ties against a sparse local library.

use strsim::levenshtein;

/// Bonus applied to external results, capped so it can never beat a strictly
/// better local match tier.
pub const EXTERNAL_BOOST: u32 = 5;

/// Similarity of a query against one target string.
///
/// Tiers: exact 100, prefix 90, whole-token 80, substring 70, otherwise an
/// edit-distance score scaled into 0..60.
pub fn similarity(query: &str, target: &str) -> u32 {
    let query = query.to_lowercase();
    let target = target.to_lowercase();

    if query == target {
        return 100;
    }
    if target.starts_with(&query) {
        return 90;
    }
    if target
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .any(|tok| tok == query)
    {
        return 80;
    }
    if target.contains(&query) {
        return 70;
    }

    let max_len = query.chars().count().max(target.chars().count());
    if max_len == 0 {
        return 0;
    }
    let distance = levenshtein(&query, &target);
    let ratio = 1.0 - (distance as f64 / max_len as f64);
    (ratio.max(0.0) * 60.0) as u32
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Token-based score of a query against a record's searchable fields.
///
/// Each query token counts as matched when it substring-matches any field,
/// or reaches 70 similarity against any field token. Query tokens with no
/// alphanumeric content only get the substring check.
pub fn score_record(query: &str, fields: &[&str]) -> u32 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0;
    }

    let lower_fields: Vec<String> = fields.iter().map(|f| f.to_lowercase()).collect();
    let field_tokens: Vec<String> = fields.iter().flat_map(|f| tokenize(f)).collect();

    let mut matched = 0usize;
    for token in &query_tokens {
        let substring_hit = lower_fields.iter().any(|f| f.contains(token.as_str()));
        if substring_hit {
            matched += 1;
            continue;
        }
        if !token.chars().any(|c| c.is_alphanumeric()) {
            continue;
        }
        if field_tokens.iter().any(|ft| similarity(token, ft) >= 70) {
            matched += 1;
        }
    }

    ((matched as f64 / query_tokens.len() as f64) * 100.0) as u32
}

/// Full ranking score for one record. `is_external` applies the catalog
/// boost, capped at 100.
pub fn rank(query: &str, primary: &str, fields: &[&str], is_external: bool) -> u32 {
    let direct = similarity(query, primary);
    let tokens = score_record(query, fields);
    let base = direct.max(tokens);
    if is_external {
        (base + EXTERNAL_BOOST).min(100)
    } else {
        base
    }
}

/// Strip surrounding quotes and whitespace before scoring.
pub fn clean_query(query: &str) -> &str {
    let trimmed = query.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_tiers() {
        assert_eq!(similarity("Daft Punk", "daft punk"), 100);
        assert_eq!(similarity("daft", "Daft Punk"), 90);
        assert_eq!(similarity("punk", "Daft Punk"), 80);
        assert_eq!(similarity("aft pun", "Daft Punk"), 70);
        let fuzzy = similarity("daft pank", "daft punk");
        assert!(fuzzy < 70 && fuzzy > 40, "got {}", fuzzy);
    }

    #[test]
    fn exact_match_outranks_partial_token_match() {
        let exact = rank("Daft Punk", "Daft Punk", &["Daft Punk"], false);
        let partial = rank("Daft Punk", "Daft Trunk", &["Daft Trunk"], false);
        assert_eq!(exact, 100);
        assert!(partial < exact, "{} vs {}", partial, exact);
    }

    #[test]
    fn token_scoring_counts_matched_fraction() {
        let full = score_record("daft punk", &["Daft Punk", "Discovery"]);
        assert_eq!(full, 100);
        let half = score_record("daft zeppelin", &["Daft Punk", "Discovery"]);
        assert_eq!(half, 50);
    }

    #[test]
    fn non_alphanumeric_tokens_only_substring_match() {
        // "&&" is not in any field and has no alphanumeric content, so the
        // edit-distance fallback must not fire.
        assert_eq!(score_record("&&", &["Daft Punk"]), 0);
        assert_eq!(score_record("!!!", &["!!! (Chk Chk Chk)"]), 100);
    }

    #[test]
    fn external_boost_caps_at_100() {
        assert_eq!(rank("abba", "ABBA", &["ABBA"], true), 100);
        // A weak fuzzy match sits well under the cap, so the boost shows.
        let local = rank("abet", "ABBA", &["ABBA"], false);
        let external = rank("abet", "ABBA", &["ABBA"], true);
        assert!(local < 70, "got {}", local);
        assert_eq!(external, local + EXTERNAL_BOOST);
    }

    #[test]
    fn clean_query_strips_quotes() {
        assert_eq!(clean_query("  \"Daft Punk\"  "), "Daft Punk");
        assert_eq!(clean_query("'around the world'"), "around the world");
        assert_eq!(clean_query("plain"), "plain");
    }
}
