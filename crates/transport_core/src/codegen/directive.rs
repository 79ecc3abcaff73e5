//! Directive scanner.
//!
//! A directive is `$TOKEN`, optionally followed by `[labels]` and then
//! `{arg, ...}`. Tokens match `[A-Z_][A-Z0-9_]*`; a `$` not followed by a token
//! character is ordinary text.

use crate::error::{Location, TranslationError};

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub token: String,
    pub labels: Vec<char>,
    pub args: Vec<String>,
    /// Whether `[...]` was written, even if empty.
    pub has_labels: bool,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Directive(Directive),
}

fn is_token_start(c: char) -> bool {
    c.is_ascii_uppercase() || c == '_'
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'
}

/// Finds the position of the bracket closing the one at `open`, skipping
/// quoted text and nested groups.
fn closing(chars: &[char], open: usize, close: char) -> Option<usize> {
    let opener = chars[open];
    let mut depth = 0usize;
    let mut quoted = false;
    for (i, c) in chars.iter().enumerate().skip(open) {
        match *c {
            '"' => quoted = !quoted,
            _ if quoted => {}
            c if c == opener => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits an argument list on top-level commas, trimming each argument and
/// removing surrounding double quotes.
pub fn split_arguments(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            '(' | '[' | '{' if !quoted => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' if !quoted => {
                depth -= 1;
                current.push(c);
            }
            ',' if !quoted && depth == 0 => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out.into_iter().map(|arg| unquote(arg.trim()).to_string()).collect()
}

fn unquote(arg: &str) -> &str {
    if arg.len() >= 2 && arg.starts_with('"') && arg.ends_with('"') {
        &arg[1..arg.len() - 1]
    } else {
        arg
    }
}

/// One scanned template line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScannedLine {
    pub segments: Vec<Segment>,
    /// Directives that could not be read.
    pub malformed: Vec<TranslationError>,
}

impl ScannedLine {
    pub fn is_clean(&self) -> bool {
        self.malformed.is_empty()
    }
}

/// Splits one template line into text and directives. `line` is 1-based.
///
/// An unterminated `[` or `{` swallows the rest of the line: it is recorded as
/// malformed, and the directives scanned before it are kept so they can still
/// be checked.
pub fn scan_line(text: &str, line: usize) -> ScannedLine {
    let chars: Vec<char> = text.chars().collect();
    let mut scanned = ScannedLine::default();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c != '$' || !chars.get(i + 1).copied().map(is_token_start).unwrap_or(false) {
            literal.push(c);
            i += 1;
            continue;
        }

        let location = Location::new(line, i + 1);
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && is_token_char(chars[end]) {
            end += 1;
        }
        let token: String = chars[start..end].iter().collect();
        i = end;

        let unterminated = |open: char| TranslationError::Malformed {
            token: token.clone(),
            reason: format!("unterminated '{}'", open),
            location,
        };

        let mut labels = Vec::new();
        let mut has_labels = false;
        if chars.get(i) == Some(&'[') {
            let Some(close) = closing(&chars, i, ']') else {
                scanned.malformed.push(unterminated('['));
                break;
            };
            labels = chars[i + 1..close].iter().copied().filter(|c| !c.is_whitespace()).collect();
            has_labels = true;
            i = close + 1;
        }

        let mut args = Vec::new();
        if chars.get(i) == Some(&'{') {
            let Some(close) = closing(&chars, i, '}') else {
                scanned.malformed.push(unterminated('{'));
                break;
            };
            let inner: String = chars[i + 1..close].iter().collect();
            args = split_arguments(&inner);
            i = close + 1;
        }

        if !literal.is_empty() {
            scanned.segments.push(Segment::Text(std::mem::take(&mut literal)));
        }
        scanned.segments.push(Segment::Directive(Directive {
            token,
            labels,
            args,
            has_labels,
            location,
        }));
    }

    if !literal.is_empty() {
        scanned.segments.push(Segment::Text(literal));
    }
    scanned
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn directives(segments: &[Segment]) -> Vec<&Directive> {
        segments
            .iter()
            .filter_map(|s| match s {
                Segment::Directive(d) => Some(d),
                Segment::Text(_) => None,
            })
            .collect()
    }

    #[test]
    fn plain_text_passes_through() {
        let scanned = scan_line("cost = $5 + a$b;", 1);
        assert!(scanned.is_clean());
        assert_eq!(scanned.segments, vec![Segment::Text("cost = $5 + a$b;".to_string())]);
    }

    #[test]
    fn labels_and_arguments() {
        let segments = scan_line("  __u2[$FLATTEN[AB]] = $U2[AB]{__k, __a, \"__Hsq\", eps};", 3).segments;
        let found = directives(&segments);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].token, "FLATTEN");
        assert_eq!(found[0].labels, vec!['A', 'B']);
        assert_eq!(found[0].location, Location::new(3, 8));
        assert_eq!(found[1].token, "U2");
        assert_eq!(found[1].args, vec!["__k", "__a", "__Hsq", "eps"]);
        assert!(matches!(&segments[0], Segment::Text(t) if t == "  __u2["));
    }

    #[test]
    fn quoted_commas_stay_in_one_argument() {
        assert_eq!(
            split_arguments(r#""const auto $1 = $2;", f(a, b), x"#),
            vec!["const auto $1 = $2;", "f(a, b)", "x"]
        );
        assert!(split_arguments("  ").is_empty());
    }

    #[test]
    fn unterminated_group_is_malformed() {
        let scanned = scan_line("x = $U1[A{__Hsq;", 7);
        assert!(directives(&scanned.segments).is_empty());
        assert_eq!(scanned.malformed.len(), 1);
        let err = &scanned.malformed[0];
        assert!(matches!(err, TranslationError::Malformed { token, .. } if token == "U1"));
        assert_eq!(err.location(), Location::new(7, 5));
        let scanned = scan_line("$TEMP_POOL{\"$1 = $2;\"", 2);
        assert_eq!(scanned.malformed[0].token(), "TEMP_POOL");
    }

    #[test]
    fn directives_before_a_malformed_one_are_kept() {
        let scanned = scan_line("$NOPE $MODEL $U1[A{x", 1);
        let found = directives(&scanned.segments);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].token, "NOPE");
        assert_eq!(found[1].token, "MODEL");
        assert_eq!(scanned.malformed.len(), 1);
        assert_eq!(scanned.malformed[0].location(), Location::new(1, 14));
    }

    #[test]
    fn bare_token_has_no_labels() {
        let segments = scan_line("$MODEL", 1).segments;
        let found = directives(&segments);
        assert_eq!(found[0].token, "MODEL");
        assert!(!found[0].has_labels);
        assert!(found[0].args.is_empty());
    }
}
