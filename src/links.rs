//! URL helpers and prefetch-link discovery in HTML bodies.

use scraper::{Html, Selector};
use url::Url;

/// Elements that explicitly opt in to prefetching.
const PREFETCH_SELECTOR: &str = "a[href][data-prefetch], link[href][rel~=prefetch]";

/// Resolve `raw` against `origin` and return its path plus query when it is
/// same-origin. Fragment-only and foreign references yield `None`.
pub fn same_origin_path(raw: &str, origin: &Url) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    let url = origin.join(raw).ok()?;
    if url.origin() != origin.origin() {
        return None;
    }
    Some(path_and_query(&url))
}

pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

/// Same-origin targets of every prefetch-marked link, de-duplicated in document order.
pub fn prefetch_links(html: &str, origin: &Url) -> Vec<String> {
    let Ok(selector) = Selector::parse(PREFETCH_SELECTOR) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);

    let mut links: Vec<String> = Vec::new();
    for el in document.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if let Some(path) = same_origin_path(href, origin)
            && !links.contains(&path)
        {
            links.push(path);
        }
    }
    links
}

/// Cache key for a request: path plus query without the cache marker parameter.
pub fn cache_key(path_and_query: &str, marker: &str) -> String {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return path_and_query.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(k, _)| k);
            !pair.is_empty() && name != marker
        })
        .collect();
    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", kept.join("&"))
    }
}

/// True when the query string carries the cache marker parameter.
pub fn has_query_param(path_and_query: &str, name: &str) -> bool {
    path_and_query.split_once('?').is_some_and(|(_, query)| {
        query
            .split('&')
            .any(|pair| pair.split_once('=').map_or(pair, |(k, _)| k) == name)
    })
}

/// The canonical page for a lightweight variant: `/p/1.amp?x=1` becomes `/p/1?x=1`.
pub fn canonical_of_lightweight(path_and_query: &str, suffix: &str) -> Option<String> {
    if suffix.is_empty() {
        return None;
    }
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };
    let canonical = path.strip_suffix(suffix)?;
    let canonical = if canonical.is_empty() { "/" } else { canonical };
    Some(match query {
        Some(q) => format!("{canonical}?{q}"),
        None => canonical.to_string(),
    })
}
