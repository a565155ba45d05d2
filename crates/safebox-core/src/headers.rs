//! Content-Security-Policy and companion security headers for whatever HTTP
//! layer serves the application.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CspOptions {
    /// Extra sources beyond `'self'` for each directive.
    pub script_src: Vec<String>,
    pub style_src: Vec<String>,
    pub img_src: Vec<String>,
    pub connect_src: Vec<String>,
    pub allow_unsafe_eval: bool,
    pub allow_unsafe_inline: bool,
}

fn directive(name: &str, base: &[&str], extra: &[String]) -> String {
    let mut sources: Vec<&str> = base.to_vec();
    for source in extra {
        let source = source.trim();
        if !source.is_empty() && !sources.contains(&source) {
            sources.push(source);
        }
    }
    format!("{name} {}", sources.join(" "))
}

pub fn content_security_policy(options: &CspOptions) -> String {
    let mut script_base = vec!["'self'"];
    if options.allow_unsafe_inline {
        script_base.push("'unsafe-inline'");
    }
    if options.allow_unsafe_eval {
        script_base.push("'unsafe-eval'");
    }
    let mut style_base = vec!["'self'"];
    if options.allow_unsafe_inline {
        style_base.push("'unsafe-inline'");
    }

    [
        "default-src 'self'".to_string(),
        directive("script-src", &script_base, &options.script_src),
        directive("style-src", &style_base, &options.style_src),
        directive("img-src", &["'self'", "data:", "https:"], &options.img_src),
        directive("connect-src", &["'self'"], &options.connect_src),
        "font-src 'self'".to_string(),
        "object-src 'none'".to_string(),
        "base-uri 'self'".to_string(),
        "form-action 'self'".to_string(),
        "frame-ancestors 'none'".to_string(),
        "upgrade-insecure-requests".to_string(),
    ]
    .join("; ")
}

pub fn security_headers(options: &CspOptions) -> Vec<(&'static str, String)> {
    vec![
        ("Content-Security-Policy", content_security_policy(options)),
        ("X-Frame-Options", "DENY".into()),
        ("X-Content-Type-Options", "nosniff".into()),
        ("Referrer-Policy", "strict-origin-when-cross-origin".into()),
        (
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains".into(),
        ),
        (
            "Permissions-Policy",
            "camera=(), microphone=(), geolocation=()".into(),
        ),
    ]
}
