//! Asset-rewrite pass (§6.5): strip external font/CDN references from rendered HTML and inline
//! a locally embedded font style block in their place.

use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;

/// One embedded font family: its CSS `@font-face` text with the `src` already pointing at a
/// base64 `data:` URL.
#[derive(Debug, Clone)]
pub struct EmbeddedFont {
    pub css: String,
}

fn external_font_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let sources = [
            // Google Fonts <link> tags (stylesheet or preconnect).
            r#"<link[^>]+fonts\.googleapis\.com[^>]*>"#,
            r#"<link[^>]+fonts\.gstatic\.com[^>]*>"#,
            // @import rules pulling from Google Fonts.
            r#"@import\s+url\([^)]*fonts\.googleapis\.com[^)]*\)\s*;?"#,
            // Font Awesome / common CDN font hosts.
            r#"<link[^>]+fontawesome[^>]*>"#,
            r#"<link[^>]+maxcdn\.bootstrapcdn\.com[^>]*>"#,
            r#"<link[^>]+cdnjs\.cloudflare\.com[^>]*font[^>]*>"#,
            // Generic external @font-face with a remote src.
            r#"@font-face\s*\{[^}]*url\(\s*['"]?https?://[^)]*\)[^}]*\}"#,
        ];
        sources
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .expect("static asset-rewrite pattern must compile")
            })
            .collect()
    })
}

/// Strip every recognized external font/CDN reference from `html`.
pub fn strip_external_font_references(html: &str) -> String {
    let mut out = html.to_string();
    for pattern in external_font_patterns() {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}

/// Build a `<style>` block embedding every font's CSS, base64 data URLs already inlined.
pub fn build_embedded_style_block(fonts: &[EmbeddedFont]) -> String {
    let mut block = String::from("<style>\n");
    for font in fonts {
        block.push_str(&font.css);
        block.push('\n');
    }
    block.push_str("</style>\n");
    block
}

fn head_open_tag() -> &'static Regex {
    static HEAD_TAG: OnceLock<Regex> = OnceLock::new();
    HEAD_TAG.get_or_init(|| {
        RegexBuilder::new(r#"<head[^>]*>"#)
            .case_insensitive(true)
            .build()
            .expect("head-tag pattern must compile")
    })
}

/// Insert `style_block` right after the first `<head ...>` tag, or prepend it if the document
/// has no head.
pub fn insert_after_head(html: &str, style_block: &str) -> String {
    match head_open_tag().find(html) {
        Some(m) => {
            let mut out = String::with_capacity(html.len() + style_block.len());
            out.push_str(&html[..m.end()]);
            out.push_str(style_block);
            out.push_str(&html[m.end()..]);
            out
        }
        None => format!("{style_block}{html}"),
    }
}

/// Full asset-rewrite pass: strip external references, inline local fonts.
pub fn patch_html_fonts(html: &str, fonts: &[EmbeddedFont]) -> String {
    let stripped = strip_external_font_references(html);
    let block = build_embedded_style_block(fonts);
    insert_after_head(&stripped, &block)
}

/// Returns every surviving external font/CDN URL in `html`. An implementation is correct only
/// if this returns an empty list for any rendered artifact (§6.5, §8).
pub fn verify_no_external_font_urls(html: &str) -> Vec<String> {
    static URL_PATTERN: OnceLock<Regex> = OnceLock::new();
    let url_re = URL_PATTERN.get_or_init(|| {
        Regex::new(r#"https?://(?:fonts\.googleapis\.com|fonts\.gstatic\.com|[^"'\s)]*fontawesome[^"'\s)]*|maxcdn\.bootstrapcdn\.com|cdnjs\.cloudflare\.com)[^"'\s)]*"#)
            .expect("url verifier pattern must compile")
    });
    url_re.find_iter(html).map(|m| m.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_google_fonts_link() {
        let html = r#"<head><link href="https://fonts.googleapis.com/css?family=Roboto" rel="stylesheet"></head>"#;
        let out = strip_external_font_references(html);
        assert!(!out.contains("fonts.googleapis.com"));
    }

    #[test]
    fn strips_import_statement() {
        let html = "<style>@import url(https://fonts.googleapis.com/css?family=Lato);</style>";
        let out = strip_external_font_references(html);
        assert!(!out.contains("fonts.googleapis.com"));
    }

    #[test]
    fn inserts_after_head_tag() {
        let html = "<html><head class=\"x\"><title>t</title></head><body></body></html>";
        let out = insert_after_head(html, "<style>embedded</style>");
        let head_end = out.find("</head>").unwrap();
        let style_pos = out.find("<style>embedded</style>").unwrap();
        assert!(style_pos < head_end);
    }

    #[test]
    fn prepends_when_no_head() {
        let html = "<body>no head here</body>";
        let out = insert_after_head(html, "<style>embedded</style>");
        assert!(out.starts_with("<style>embedded</style>"));
    }

    #[test]
    fn full_patch_leaves_no_external_urls() {
        let html = r#"<head><link href="https://fonts.googleapis.com/css?family=Roboto" rel="stylesheet"></head><body>hi</body>"#;
        let fonts = vec![EmbeddedFont {
            css: "@font-face { font-family: 'Roboto'; src: url(data:font/woff2;base64,AAAA); }".to_string(),
        }];
        let out = patch_html_fonts(html, &fonts);
        assert!(verify_no_external_font_urls(&out).is_empty());
        assert!(out.contains("data:font/woff2"));
    }
}
