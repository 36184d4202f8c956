//! Environment variable expansion for inventory values
//!
//! `$NAME` and `${NAME}` are replaced by the variable's value; a leading
//! `~` (alone or followed by `/`) by `$HOME`. Unset variables are left as
//! written.

/// Expand `value` using the process environment.
pub fn expand(value: &str) -> String {
    expand_with(value, |name| std::env::var(name).ok())
}

/// Expand `value` using `lookup` to resolve variable names.
pub fn expand_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let value = match value.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match lookup("HOME") {
            Some(home) => format!("{home}{rest}"),
            None => value.to_string(),
        },
        _ => value.to_string(),
    };

    let mut out = String::with_capacity(value.len());
    let mut rest = value.as_str();
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        let original = &rest[pos..pos + 1 + consumed];
        if name.is_empty() {
            out.push_str(original);
        } else {
            match lookup(name) {
                Some(resolved) => out.push_str(&resolved),
                None => out.push_str(original),
            }
        }
        rest = &rest[pos + 1 + consumed..];
    }
    out.push_str(rest);
    out
}
