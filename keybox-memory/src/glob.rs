//! Redis style glob patterns.

use regex::Regex;

/// Compiles a `SCAN MATCH` style pattern.
///
/// Supports `*`, `?`, `[...]` classes and `\` escapes. Everything else matches
/// literally.
pub(crate) fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => expr.push_str(&regex::escape(&escaped.to_string())),
                None => expr.push_str(r"\\"),
            },
            '[' => {
                expr.push('[');
                let mut first = true;
                for class in chars.by_ref() {
                    if class == ']' {
                        break;
                    }
                    match class {
                        '^' if first => expr.push('^'),
                        '\\' | '[' | '&' | '~' => {
                            expr.push('\\');
                            expr.push(class);
                        }
                        other => expr.push(other),
                    }
                    first = false;
                }
                expr.push(']');
            }
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

#[cfg(test)]
mod tests {
    use super::compile;

    #[test]
    fn star_matches_any_suffix() {
        let re = compile("app:user:*").unwrap();
        assert!(re.is_match("app:user:1"));
        assert!(re.is_match("app:user:"));
        assert!(!re.is_match("app:users"));
    }

    #[test]
    fn question_mark_and_classes() {
        let re = compile("k?y[0-9]").unwrap();
        assert!(re.is_match("key1"));
        assert!(!re.is_match("key"));
        assert!(!re.is_match("keyA"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let re = compile("a.b+(c)").unwrap();
        assert!(re.is_match("a.b+(c)"));
        assert!(!re.is_match("aXbb(c)"));
    }
}
