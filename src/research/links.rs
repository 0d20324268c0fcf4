//! URL extraction from research Markdown

use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::Regex;

// Link and image targets may carry one level of balanced parentheses,
// as in `https://en.wikipedia.org/wiki/Rust_(programming_language)`.
static IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[[^\]]*\]\((https?://(?:[^()\s]|\([^()\s]*\))+)"#).expect("valid image regex")
});

static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[[^\]]*\]\((https?://(?:[^()\s]|\([^()\s]*\))+)"#).expect("valid link regex")
});

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[A-Za-z0-9\-._~:/?#@!$&*+,;=%]+"#).expect("valid url regex"));

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// URLs found in a Markdown document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedLinks {
    /// Every URL, deduplicated, in order of first appearance
    pub sources: Vec<String>,
    /// Targets of `![alt](url)`, deduplicated
    pub images: Vec<String>,
}

/// Collect image targets and all referenced URLs from `markdown`
pub fn extract_links(markdown: &str) -> ExtractedLinks {
    let images: IndexSet<String> = IMAGE_RE
        .captures_iter(markdown)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect();

    // Image syntax contains link syntax, so LINK_RE sees image targets too.
    let targets: Vec<(usize, usize)> = LINK_RE
        .captures_iter(markdown)
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.end()))
        .collect();

    let inside_target = |pos: usize| targets.iter().any(|(start, end)| (*start..*end).contains(&pos));

    let mut found: Vec<(usize, &str)> = targets
        .iter()
        .map(|(start, end)| (*start, &markdown[*start..*end]))
        .collect();
    found.extend(
        URL_RE
            .find_iter(markdown)
            .filter(|m| !inside_target(m.start()))
            .map(|m| (m.start(), m.as_str().trim_end_matches(TRAILING_PUNCTUATION))),
    );
    found.sort_by_key(|(pos, _)| *pos);

    let sources: IndexSet<String> = found
        .into_iter()
        .map(|(_, url)| url)
        .filter(|url| url.len() > "https://".len())
        .map(str::to_string)
        .collect();

    ExtractedLinks {
        sources: sources.into_iter().collect(),
        images: images.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_syntax() {
        let links = extract_links(
            "See [docs](https://a.com) and ![img](https://b.com/i.png) and bare https://c.com",
        );
        assert_eq!(links.images, vec!["https://b.com/i.png"]);
        assert_eq!(
            links.sources,
            vec!["https://a.com", "https://b.com/i.png", "https://c.com"]
        );
    }

    #[test]
    fn test_deduplicates_first_seen() {
        let links = extract_links(
            "[one](https://x.io/a) then https://y.io and again [two](https://x.io/a).",
        );
        assert_eq!(links.sources, vec!["https://x.io/a", "https://y.io"]);
    }

    #[test]
    fn test_trailing_punctuation_trimmed() {
        let links = extract_links("来源：https://example.com/report。更多见 https://example.org, 完。");
        assert_eq!(
            links.sources,
            vec!["https://example.com/report", "https://example.org"]
        );
    }

    #[test]
    fn test_link_with_title() {
        let links = extract_links(r#"[site](https://a.com/page "Title")"#);
        assert_eq!(links.sources, vec!["https://a.com/page"]);
    }

    #[test]
    fn test_parenthesized_targets_kept_whole() {
        let links = extract_links(
            "See [Rust](https://en.wikipedia.org/wiki/Rust_(programming_language)) and ![d](https://x.org/a_(b).png)",
        );
        assert_eq!(links.images, vec!["https://x.org/a_(b).png"]);
        assert_eq!(
            links.sources,
            vec![
                "https://en.wikipedia.org/wiki/Rust_(programming_language)",
                "https://x.org/a_(b).png"
            ]
        );
    }

    #[test]
    fn test_bare_url_before_link_keeps_text_order() {
        let links = extract_links("first https://z.com then [a](https://a.com)");
        assert_eq!(links.sources, vec!["https://z.com", "https://a.com"]);
    }

    #[test]
    fn test_no_links() {
        assert_eq!(extract_links("plain text only"), ExtractedLinks::default());
    }
}
