use scraper::{Html, Selector};
use url::Url;

/// Extracts same-document hyperlink targets from raw HTML, resolving
/// relative hrefs against `base_url`. Mirrors the minimal subset of link
/// discovery a crawl fan-out actually needs: no script/style evaluation,
/// no redirect following, no sitemap awareness (that lives upstream of
/// this crate, per the URL-discovery collaborators named in scope).
pub fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        let mut resolved = resolved;
        resolved.set_fragment(None);
        links.push(resolved.to_string());
    }

    links.sort();
    links.dedup();
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_links_against_base() {
        let html = r#"<html><body>
            <a href="/a">a</a>
            <a href="https://other.example/b">b</a>
            <a href="#frag">skip</a>
            <a href="mailto:x@y.com">skip</a>
        </body></html>"#;
        let links = extract_links(html, "https://example.com/start");
        assert_eq!(
            links,
            vec!["https://example.com/a".to_string(), "https://other.example/b".to_string()]
        );
    }

    #[test]
    fn dedups_and_drops_non_http_schemes() {
        let html = r#"<a href="/a">1</a><a href="/a">2</a><a href="ftp://x/y">ftp</a>"#;
        let links = extract_links(html, "https://example.com/");
        assert_eq!(links, vec!["https://example.com/a".to_string()]);
    }

    #[test]
    fn invalid_base_yields_no_links() {
        assert!(extract_links("<a href=\"/a\">a</a>", "not a url").is_empty());
    }
}
