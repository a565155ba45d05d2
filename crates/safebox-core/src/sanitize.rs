//! Input sanitization applied before user content is stored or rendered.
//!
//! Script-capable elements (`script`, `style`, `iframe`, `object`, `embed`,
//! `form`, `noscript`, `template`) and `on*` event attributes are removed
//! no matter what the caller allows.

use once_cell::sync::Lazy;
use regex::{Captures, Regex, RegexSet};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{Result, SafeboxError};

pub const DANGEROUS_TAGS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "form", "noscript", "template",
];
/// Basic formatting markup, for callers without their own allow-list.
pub const BASIC_TAGS: &[&str] = &["b", "i", "em", "strong", "u", "p", "br", "ul", "ol", "li", "a"];
pub const BASIC_ATTRIBUTES: &[&str] = &["href", "title"];
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https", "mailto", "tel", "ftp"];
const BLOCKED_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:"];
const URL_ATTRIBUTES: &[&str] = &["href", "src", "action", "formaction", "xlink:href"];

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex is valid"));

static DANGEROUS_BLOCKS: Lazy<Vec<Regex>> = Lazy::new(|| {
    DANGEROUS_TAGS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"))
                .expect("static regex is valid")
        })
        .collect()
});

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(/?)([a-zA-Z][a-zA-Z0-9:-]*)([^<>]*)>").expect("static regex is valid")
});

static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#,
    )
    .expect("static regex is valid")
});

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("static regex is valid"));

static RELATIVE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9\-._~/?#@!$&()*+,;=%:]+$").expect("static regex is valid")
});

static CHAR_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)&#x([0-9a-f]+);?|&#([0-9]+);?|&(colon|tab|newline|lpar|rpar|sol|amp);")
        .expect("static regex is valid")
});

static PERCENT_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%([0-9a-fA-F]{2})").expect("static regex is valid"));

static XSS_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)<\s*script\b",
        r"(?i)<\s*/\s*script",
        r"(?i)javascript\s*:",
        r"(?i)vbscript\s*:",
        r"(?i)data\s*:\s*text/html",
        r#"(?i)<[a-z][^>]*[\s/"']on[a-z]+\s*="#,
        r"(?i)<\s*(iframe|object|embed|style|form|meta|link|base)\b",
        r"(?i)expression\s*\(",
        r"(?i)srcdoc\s*=",
    ])
    .expect("static regex set is valid")
});

fn truncate_chars(input: &str, max_length: Option<usize>) -> &str {
    match max_length.and_then(|max| input.char_indices().nth(max)) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

fn named_reference(name: &str) -> Option<char> {
    match name.to_ascii_lowercase().as_str() {
        "colon" => Some(':'),
        "tab" => Some('\t'),
        "newline" => Some('\n'),
        "lpar" => Some('('),
        "rpar" => Some(')'),
        "sol" => Some('/'),
        "amp" => Some('&'),
        _ => None,
    }
}

fn decode_once(input: &str) -> String {
    let references = CHAR_REFERENCE.replace_all(input, |caps: &Captures| {
        let decoded = if let Some(hex) = caps.get(1) {
            u32::from_str_radix(hex.as_str(), 16).ok().and_then(char::from_u32)
        } else if let Some(dec) = caps.get(2) {
            dec.as_str().parse::<u32>().ok().and_then(char::from_u32)
        } else {
            caps.get(3).and_then(|name| named_reference(name.as_str()))
        };
        decoded.map(String::from).unwrap_or_default()
    });
    PERCENT_ESCAPE
        .replace_all(&references, |caps: &Captures| {
            match u8::from_str_radix(&caps[1], 16) {
                Ok(byte) if byte.is_ascii() => char::from(byte).to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// The text a browser would see after resolving character references and
/// percent escapes. Nested encodings (`&amp;#106;`) unwrap one level per pass.
fn decode_obfuscation(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..4 {
        let decoded = decode_once(&current);
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_angle(input: &str) -> String {
    input.replace('<', "&lt;").replace('>', "&gt;")
}

fn is_listed(list: &[&str], name: &str) -> bool {
    list.iter().any(|entry| entry.eq_ignore_ascii_case(name))
}

/// Keep only allow-listed tags and attributes.
///
/// Disallowed tags are unwrapped (their text survives); dangerous elements
/// are removed together with their content. URL attributes go through
/// [`sanitize_url`] and are dropped when rejected. `max_length` truncates the
/// input, in characters, before parsing.
pub fn sanitize_html(
    input: &str,
    allowed_tags: &[&str],
    allowed_attributes: &[&str],
    max_length: Option<usize>,
) -> String {
    let input = truncate_chars(input, max_length);
    let mut cleaned = COMMENT.replace_all(input, "").into_owned();
    for block in DANGEROUS_BLOCKS.iter() {
        cleaned = block.replace_all(&cleaned, "").into_owned();
    }

    let mut out = String::with_capacity(cleaned.len());
    let mut last = 0;
    for caps in TAG.captures_iter(&cleaned) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&escape_angle(&cleaned[last..whole.start()]));
        last = whole.end();

        let name = caps[2].to_ascii_lowercase();
        if is_listed(DANGEROUS_TAGS, &name) || !is_listed(allowed_tags, &name) {
            continue;
        }
        if !caps[1].is_empty() {
            out.push_str("</");
            out.push_str(&name);
            out.push('>');
            continue;
        }

        let attributes = &caps[3];
        out.push('<');
        out.push_str(&name);
        push_attributes(&mut out, attributes, allowed_attributes);
        if attributes.trim_end().ends_with('/') {
            out.push_str(" /");
        }
        out.push('>');
    }
    out.push_str(&escape_angle(&cleaned[last..]));
    out
}

fn push_attributes(out: &mut String, source: &str, allowed_attributes: &[&str]) {
    for attr in ATTRIBUTE.captures_iter(source) {
        let name = attr[1].to_ascii_lowercase();
        if name.starts_with("on") || !is_listed(allowed_attributes, &name) {
            continue;
        }
        let value = attr
            .get(2)
            .or_else(|| attr.get(3))
            .or_else(|| attr.get(4))
            .map(|m| m.as_str());
        let Some(value) = value else {
            out.push(' ');
            out.push_str(&name);
            continue;
        };
        let value = if URL_ATTRIBUTES.contains(&name.as_str()) {
            match sanitize_url(value) {
                Some(url) => url,
                None => continue,
            }
        } else if contains_xss(value) || value.to_ascii_lowercase().contains("javascript:") {
            continue;
        } else {
            value.to_string()
        };
        out.push(' ');
        out.push_str(&name);
        out.push_str("=\"");
        out.push_str(&escape_html(&value));
        out.push('"');
    }
}

/// Collapse whitespace, trim, truncate to `max_length` characters, then
/// escape the HTML metacharacters.
pub fn sanitize_text(input: &str, max_length: Option<usize>) -> String {
    let collapsed = WHITESPACE.replace_all(input.trim(), " ");
    escape_html(truncate_chars(&collapsed, max_length))
}

/// Normalized URL for allowed schemes, the trimmed input for relative paths,
/// `None` otherwise.
pub fn sanitize_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let compact: String = decode_obfuscation(trimmed)
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    if BLOCKED_SCHEMES.iter().any(|scheme| compact.starts_with(scheme)) {
        return None;
    }
    match Url::parse(trimmed) {
        Ok(parsed) if ALLOWED_SCHEMES.contains(&parsed.scheme()) => Some(parsed.to_string()),
        Ok(_) => None,
        Err(url::ParseError::RelativeUrlWithoutBase)
            if RELATIVE_PATH.is_match(trimmed) && !first_segment_has_colon(&compact) =>
        {
            Some(trimmed.to_string())
        }
        Err(_) => None,
    }
}

/// RFC 3986 4.2: a relative-path reference cannot carry `:` in its first
/// segment, otherwise it reads as a scheme.
fn first_segment_has_colon(path: &str) -> bool {
    path.split(['/', '?', '#'])
        .next()
        .is_some_and(|segment| segment.contains(':'))
}

/// [`sanitize_url`] for call sites that treat rejection as an error.
pub fn validate_url(url: &str) -> Result<String> {
    sanitize_url(url)
        .ok_or_else(|| SafeboxError::InvalidInput(format!("disallowed or malformed URL: {url:?}")))
}

/// Matches the dangerous-pattern set against the raw content and against
/// its decoded form.
pub fn contains_xss(content: &str) -> bool {
    if XSS_PATTERNS.is_match(content) {
        return true;
    }
    let decoded = decode_obfuscation(content);
    decoded != content && XSS_PATTERNS.is_match(&decoded)
}

/// Apply [`sanitize_text`] to every string value in a JSON tree. Object keys
/// are kept as they are.
pub fn sanitize_value(value: &Value, max_length: Option<usize>) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_text(s, max_length)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| sanitize_value(v, max_length)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v, max_length)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_removed_allowed_tag_kept() {
        assert_eq!(
            sanitize_html("<script>alert(1)</script><p>ok</p>", &["p"], &[], None),
            "<p>ok</p>"
        );
    }

    #[test]
    fn dangerous_tags_ignore_allow_list() {
        let out = sanitize_html(
            "<p>a</p><SCRIPT type=\"x\">bad()</SCRIPT><iframe src=\"https://x\"></iframe><style>p{}</style>",
            &["p", "script", "iframe", "style"],
            &["src", "type"],
            None,
        );
        assert_eq!(out, "<p>a</p>");
    }

    #[test]
    fn disallowed_tags_are_unwrapped() {
        assert_eq!(
            sanitize_html("<div><b>bold</b> <i>it</i></div>", &["b"], &[], None),
            "<b>bold</b> it"
        );
    }

    #[test]
    fn attributes_filtered() {
        let out = sanitize_html(
            r#"<a href="https://example.com/x" onclick="steal()" title='t' target=_blank>x</a>"#,
            &["a"],
            &["href", "title", "onclick"],
            None,
        );
        assert_eq!(out, r#"<a href="https://example.com/x" title="t">x</a>"#);
    }

    #[test]
    fn javascript_href_dropped() {
        let out = sanitize_html(
            r#"<a href="javascript:alert(1)">x</a><img src="data:text/html;base64,xx" />"#,
            &["a", "img"],
            &["href", "src"],
            None,
        );
        assert_eq!(out, "<a>x</a><img />");
    }

    #[test]
    fn comments_and_stray_brackets() {
        assert_eq!(
            sanitize_html("<!-- <script>x</script> -->1 < 2 > 0", &[], &[], None),
            "1 &lt; 2 &gt; 0"
        );
    }

    #[test]
    fn nested_script_trick_is_neutralized() {
        let out = sanitize_html("<scr<script>x</script>ipt>alert(1)</script>", &["p"], &[], None);
        assert!(!out.to_ascii_lowercase().contains("<script"));
        assert!(!contains_xss(&out));
    }

    #[test]
    fn html_max_length() {
        assert_eq!(sanitize_html("<p>abcdef</p>", &["p"], &[], Some(6)), "<p>abc");
    }

    #[test]
    fn text_is_escaped_collapsed_truncated() {
        assert_eq!(
            sanitize_text("  <b>\"Tom\"  &\n\t'Jerry'</b> ", None),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#x27;Jerry&#x27;&lt;/b&gt;"
        );
        assert_eq!(sanitize_text("héllo wörld", Some(5)), "héllo");
        assert_eq!(sanitize_text("a<b", Some(2)), "a&lt;");
    }

    #[test]
    fn url_schemes() {
        assert_eq!(sanitize_url("javascript:alert(1)"), None);
        assert_eq!(sanitize_url("  JaVa\tScRiPt:alert(1)"), None);
        assert_eq!(sanitize_url("vbscript:msgbox(1)"), None);
        assert_eq!(sanitize_url("data:text/html;base64,PHNjcmlwdD4="), None);
        assert_eq!(sanitize_url("file:///etc/passwd"), None);
        assert_eq!(
            sanitize_url("https://example.com/x").as_deref(),
            Some("https://example.com/x")
        );
        assert_eq!(
            sanitize_url("mailto:someone@example.com").as_deref(),
            Some("mailto:someone@example.com")
        );
        assert_eq!(sanitize_url("tel:+15551234").as_deref(), Some("tel:+15551234"));
        assert_eq!(sanitize_url("HTTP://Example.COM").as_deref(), Some("http://example.com/"));
    }

    #[test]
    fn encoded_schemes_rejected() {
        assert_eq!(sanitize_url("java&#x73;cript:alert(1)"), None);
        assert_eq!(sanitize_url("&#106;avascript:alert(1)"), None);
        assert_eq!(sanitize_url("&#x6A&#x61vascript:alert(1)"), None);
        assert_eq!(sanitize_url("javascript&colon;alert(1)"), None);
        assert_eq!(sanitize_url("&amp;#106;avascript:alert(1)"), None);
        assert_eq!(sanitize_url("%6Aavascript:alert(1)"), None);
        assert_eq!(sanitize_url("java%73cript:alert(1)"), None);
        assert_eq!(sanitize_url("d&#97;ta:text/html,x"), None);
    }

    #[test]
    fn colon_in_first_relative_segment_rejected() {
        assert_eq!(sanitize_url("evil:payload"), None);
        assert_eq!(sanitize_url("a&#58;b/c"), None);
        assert_eq!(sanitize_url("docs/a:b").as_deref(), Some("docs/a:b"));
        assert_eq!(sanitize_url("/time?at=12:30").as_deref(), Some("/time?at=12:30"));
    }

    #[test]
    fn relative_urls() {
        assert_eq!(sanitize_url("/docs/page?x=1#top").as_deref(), Some("/docs/page?x=1#top"));
        assert_eq!(sanitize_url("../up").as_deref(), Some("../up"));
        assert_eq!(sanitize_url("#anchor").as_deref(), Some("#anchor"));
        assert_eq!(sanitize_url("has space/in path"), None);
        assert_eq!(sanitize_url("\"><script>"), None);
        assert_eq!(sanitize_url(""), None);
    }

    #[test]
    fn validate_url_errors() {
        assert!(matches!(
            validate_url("javascript:void(0)"),
            Err(SafeboxError::InvalidInput(_))
        ));
        assert_eq!(validate_url("https://example.com/").unwrap(), "https://example.com/");
    }

    #[test]
    fn xss_detection() {
        assert!(contains_xss("<script>alert(1)</script>"));
        assert!(contains_xss(r#"<img src=x onerror="alert(1)">"#));
        assert!(contains_xss("JAVASCRIPT:alert(1)"));
        assert!(contains_xss("<iframe src=//evil>"));
        assert!(contains_xss("width: expression(alert(1))"));
        assert!(contains_xss("java&#x73;cript:alert(1)"));
        assert!(contains_xss("&#106;avascript:alert(1)"));
        assert!(contains_xss("%6Aavascript:alert(1)"));
        assert!(!contains_xss("&lt;img src=x onerror=alert(1)&gt;"));
        assert!(contains_xss("&#60;script&#62;alert(1)"));
        assert!(!contains_xss("Everyone knows 2 < 3 and one = 1"));
        assert!(!contains_xss("AT&T charges 50% less"));
        assert!(!contains_xss("<p class=\"note\">plain</p>"));
    }

    #[test]
    fn value_tree_sanitized() {
        let input = json!({"title": "<b>hi</b>", "tags": ["a&b", 3], "<k>": {"n": null}});
        assert_eq!(
            sanitize_value(&input, None),
            json!({"title": "&lt;b&gt;hi&lt;/b&gt;", "tags": ["a&amp;b", 3], "<k>": {"n": null}})
        );
    }
}
