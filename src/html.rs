//! Helpers for the string-substitution HTML templates.

/// Escape text for safe interpolation into HTML bodies and attribute values.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Accept only `#rgb` / `#rrggbb` colours; anything else falls back.
///
/// Colours are interpolated into inline CSS, where escaping is not enough.
pub fn css_color<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    match value {
        Some(v)
            if (v.len() == 4 || v.len() == 7)
                && v.starts_with('#')
                && v[1..].chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            v
        }
        _ => fallback,
    }
}
