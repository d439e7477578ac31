//! DOM snapshot analysis: page metadata, favicon candidates and media URLs.
//!
//! Parsing happens inside each function so no parsed tree is ever held
//! across an await point; callers pass the serialized snapshot and get
//! owned values back.

use std::collections::BTreeMap;

use scraper::{Html, Selector};
use url::Url;

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

/// Resolve candidate URLs against the frame base, dropping empties and
/// anything the base cannot absorb.
pub fn make_absolute_urls(base_url: &str, urls: &[String]) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    urls.iter()
        .filter(|u| !u.is_empty())
        .filter_map(|u| base.join(u).ok())
        .map(|u| u.to_string())
        .collect()
}

/// `<title>` text, if any.
pub fn extract_title(html: &str) -> Option<String> {
    let dom = Html::parse_document(html);
    let title = dom
        .select(&selector("head > title"))
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())?;
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Meta tags as a name→content map. Names are lowercased; tags without a
/// name are dropped; later tags overwrite earlier ones.
pub fn extract_meta_tags(html: &str) -> BTreeMap<String, String> {
    let dom = Html::parse_document(html);
    let mut tags = BTreeMap::new();
    for el in dom.select(&selector("meta")) {
        let Some(name) = el.value().attr("name") else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let content = el.value().attr("content").unwrap_or("").to_string();
        tags.insert(name.to_ascii_lowercase(), content);
    }
    tags
}

/// Favicon candidates: `<link rel="icon"|"shortcut icon">` hrefs first
/// (so a page-declared icon beats the fallback), then `/favicon.ico`,
/// resolved and deduplicated preserving order.
pub fn extract_favicon_urls(html: &str, content_url: &str) -> Vec<String> {
    let dom = Html::parse_document(html);
    let mut candidates = Vec::new();
    for el in dom.select(&selector("link")) {
        let rel = el.value().attr("rel").unwrap_or("").to_ascii_lowercase();
        if rel == "icon" || rel == "shortcut icon" {
            if let Some(href) = el.value().attr("href") {
                candidates.push(href.to_string());
            }
        }
    }
    candidates.push("/favicon.ico".to_string());

    let mut seen = std::collections::HashSet::new();
    make_absolute_urls(content_url, &candidates)
        .into_iter()
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

fn srcset_image_urls(dom: &Html) -> Vec<String> {
    let mut urls = Vec::new();
    for el in dom.select(&selector("img[srcset], source[srcset]")) {
        for entry in el.value().attr("srcset").unwrap_or("").split(',') {
            if let Some(src) = entry.trim().split_whitespace().next() {
                if !src.is_empty() {
                    urls.push(src.to_string());
                }
            }
        }
    }
    // src too: browsers do not necessarily request it when a srcset matched
    for el in dom.select(&selector("img[src]")) {
        urls.push(el.value().attr("src").unwrap_or("").to_string());
    }
    urls
}

fn audio_video_urls(dom: &Html) -> Vec<String> {
    let mut urls = Vec::new();
    for el in dom.select(&selector("video, audio, embed, source")) {
        let src = el.value().attr("src").unwrap_or("").trim();
        if !src.is_empty() {
            urls.push(src.to_string());
        }
    }
    urls
}

/// `<object>` data/archive attributes and nested `<param name="movie">`
/// values, resolved against the object's `codebase` when present.
fn object_urls(dom: &Html, base_url: &str) -> Vec<String> {
    let param_selector = selector(r#"param[name="movie"]"#);
    let mut urls = Vec::new();
    for el in dom.select(&selector("object")) {
        let codebase = el.value().attr("codebase");
        let mut el_urls: Vec<String> = Vec::new();
        if let Some(data) = el.value().attr("data") {
            el_urls.push(data.to_string());
        }
        for part in el.value().attr("archive").unwrap_or("").split_whitespace() {
            el_urls.push(part.to_string());
        }
        for param in el.select(&param_selector) {
            if let Some(value) = param.value().attr("value") {
                el_urls.push(value.to_string());
            }
        }
        for raw in el_urls {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let resolved = match codebase {
                Some(codebase) => Url::parse(base_url)
                    .ok()
                    .and_then(|b| b.join(codebase).ok())
                    .and_then(|cb| cb.join(raw).ok())
                    .map(|u| u.to_string()),
                None => Some(raw.to_string()),
            };
            if let Some(resolved) = resolved {
                urls.push(resolved);
            }
        }
    }
    urls
}

/// Every media URL referenced by one frame's DOM, absolute.
pub fn extract_media_urls(html: &str, base_url: &str) -> Vec<String> {
    let dom = Html::parse_document(html);
    let mut urls = srcset_image_urls(&dom);
    urls.extend(audio_video_urls(&dom));
    urls.extend(object_urls(&dom, base_url));
    let mut seen = std::collections::HashSet::new();
    make_absolute_urls(base_url, &urls)
        .into_iter()
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
            <title> The Title </title>
            <meta name="Description" content="first">
            <meta name="description" content="second">
            <meta content="nameless">
            <meta name="perma" content="noarchive">
            <link rel="ICON" href="/icons/a.png">
            <link rel="shortcut icon" href="/icons/b.ico">
            <link rel="stylesheet" href="/style.css">
        </head><body>
            <img src="/img/plain.png">
            <img srcset="/img/one.png 1x, /img/two.png 2x" src="/img/fallback.png">
            <video src="/media/clip.mp4"></video>
            <audio src=""></audio>
            <object codebase="/flash/" data="movie.swf" archive="a.jar b.jar">
                <param name="movie" value="param.swf">
            </object>
        </body></html>
    "#;

    #[test]
    fn title_is_trimmed() {
        assert_eq!(extract_title(PAGE).as_deref(), Some("The Title"));
        assert_eq!(extract_title("<html><body>x</body></html>"), None);
    }

    #[test]
    fn later_meta_tags_overwrite_and_nameless_are_dropped() {
        let tags = extract_meta_tags(PAGE);
        assert_eq!(tags.get("description").map(String::as_str), Some("second"));
        assert_eq!(tags.get("perma").map(String::as_str), Some("noarchive"));
        assert!(!tags.contains_key(""));
    }

    #[test]
    fn favicon_candidates_prefer_declared_icons_over_fallback() {
        let urls = extract_favicon_urls(PAGE, "http://example.test/page");
        assert_eq!(
            urls,
            vec![
                "http://example.test/icons/a.png",
                "http://example.test/icons/b.ico",
                "http://example.test/favicon.ico",
            ]
        );
    }

    #[test]
    fn media_urls_cover_srcset_src_av_and_objects() {
        let urls = extract_media_urls(PAGE, "http://example.test/page");
        assert!(urls.contains(&"http://example.test/img/one.png".to_string()));
        assert!(urls.contains(&"http://example.test/img/two.png".to_string()));
        assert!(urls.contains(&"http://example.test/img/plain.png".to_string()));
        assert!(urls.contains(&"http://example.test/img/fallback.png".to_string()));
        assert!(urls.contains(&"http://example.test/media/clip.mp4".to_string()));
        // resolved against the object's codebase
        assert!(urls.contains(&"http://example.test/flash/movie.swf".to_string()));
        assert!(urls.contains(&"http://example.test/flash/a.jar".to_string()));
        assert!(urls.contains(&"http://example.test/flash/param.swf".to_string()));
        // empty audio src dropped
        assert!(!urls.iter().any(|u| u.ends_with("/page")));
    }

    #[test]
    fn absolute_resolution_drops_empties() {
        let urls = make_absolute_urls(
            "http://example.test/a/b",
            &["c".to_string(), String::new(), "/root.png".to_string()],
        );
        assert_eq!(
            urls,
            vec!["http://example.test/a/c", "http://example.test/root.png"]
        );
    }
}
