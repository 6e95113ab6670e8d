//! Home-directory expansion of `~` and `%USERPROFILE%` tokens.
//!
//! Two modes exist because a user's config file is expanded *before* it is
//! parsed: plain mode operates on a path string, JSON-text mode operates on
//! raw JSON source and must keep the result valid JSON (backslashes in the
//! substituted home are doubled).

use std::path::Path;

/// Expand a plain path string against `home`.
///
/// A leading `~/` or `~\` (or a bare `~`) is replaced by the home directory,
/// then any remaining `%VAR%` environment tokens are expanded.
/// `%USERPROFILE%` always resolves to `home` regardless of case; unknown
/// tokens are left literal.
pub fn expand_path(input: &str, home: &Path) -> String {
    let home_str = home.to_string_lossy();
    let expanded = if input == "~" {
        home_str.clone().into_owned()
    } else if let Some(rest) = input.strip_prefix("~/").or_else(|| input.strip_prefix("~\\")) {
        let separator = input.as_bytes()[1] as char;
        format!("{home_str}{separator}{rest}")
    } else {
        input.to_string()
    };
    expand_env_tokens(&expanded, &home_str)
}

/// Expand raw JSON source text against `home`.
///
/// Only `~\`, `~/`, and `%USERPROFILE%` are substituted; other environment
/// tokens are left untouched. Backslashes in the home path are doubled so
/// the output is valid JSON whenever the input is.
pub fn expand_json_text(text: &str, home: &Path) -> String {
    let home_json = home.to_string_lossy().replace('\\', "\\\\");
    let replaced = text.replace("~\\\\", &format!("{home_json}\\\\"));
    let replaced = replaced.replace("~/", &format!("{home_json}/"));
    replace_case_insensitive(&replaced, "%USERPROFILE%", &home_json)
}

fn expand_env_tokens(input: &str, home: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let name = &after[..end];
                if name.eq_ignore_ascii_case("USERPROFILE") {
                    out.push_str(home);
                } else if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                } else {
                    out.push('%');
                    out.push_str(name);
                    out.push('%');
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn replace_case_insensitive(text: &str, needle: &str, replacement: &str) -> String {
    let lower_text = text.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(found) = lower_text[cursor..].find(&lower_needle) {
        let at = cursor + found;
        out.push_str(&text[cursor..at]);
        out.push_str(replacement);
        cursor = at + needle.len();
    }
    out.push_str(&text[cursor..]);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
