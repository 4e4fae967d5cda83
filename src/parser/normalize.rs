//! Text normalization shared by every extractor.

use std::sync::LazyLock;

use regex::Regex;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").expect("static regex"));
static MD_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\([!-/:-@\[-`{-~])").expect("static regex"));
static MD_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(\*\*|__|^#{1,6}\s|^\s*>\s?|\|)").expect("static regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|<[^>]+>").expect("static regex")
});

/// Strip carriage returns, turn non-breaking spaces into spaces, collapse
/// whitespace runs, trim.
pub fn normalize_text(text: &str) -> String {
    let cleaned = text.replace('\r', "").replace('\u{a0}', " ");
    WHITESPACE.replace_all(&cleaned, " ").trim().to_string()
}

/// Plain text of an HTML body. Script and style content is dropped.
pub fn html_to_text(html: &str) -> String {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "head"])
        .build();

    match converter.convert(html) {
        Ok(markdown) => {
            let text = MD_LINK.replace_all(&markdown, "$1");
            let text = MD_ESCAPE.replace_all(&text, "$1");
            MD_MARKERS.replace_all(&text, " ").into_owned()
        }
        Err(e) => {
            tracing::debug!(error = %e, "HTML conversion failed, stripping tags");
            decode_entities(&TAG.replace_all(html, " "))
        }
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}
