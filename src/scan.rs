//! Token-level scan of Python source for calls to dynamic-evaluation
//! builtins. Strings and comments are skipped except for f-string
//! replacement fields, which are scanned as code. Attribute calls such as
//! `frame.eval(...)` and definitions such as `def exec(...)` are not flagged.
//!
//! This is an advisory filter: aliasing (`f = eval; f(src)`) gets through.

const DYNAMIC_EVAL_BUILTINS: &[&str] = &["eval", "exec"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIssue {
    pub line: usize,
    pub name: String,
}

impl std::fmt::Display for ScanIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: call to {}()", self.line, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub issues: Vec<ScanIssue>,
}

impl ScanReport {
    pub fn is_safe(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Previous {
    Nothing,
    Dot,
    Keyword,
    Other,
}

pub fn scan(code: &str) -> ScanReport {
    let chars: Vec<char> = code.chars().collect();
    let mut issues = Vec::new();
    let mut line = 1;
    let mut previous = Previous::Nothing;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                i = skip_string(&chars, i, &mut line, false, &mut issues);
                previous = Previous::Other;
            }
            c if c == '_' || c.is_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i] == '_' || chars[i].is_alphanumeric()) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if i < chars.len() && matches!(chars[i], '\'' | '"') && is_string_prefix(&word) {
                    let fstring = word.contains(['f', 'F']);
                    i = skip_string(&chars, i, &mut line, fstring, &mut issues);
                    previous = Previous::Other;
                    continue;
                }
                if DYNAMIC_EVAL_BUILTINS.contains(&word.as_str())
                    && !matches!(previous, Previous::Dot | Previous::Keyword)
                    && next_is_open_paren(&chars, i)
                {
                    issues.push(ScanIssue { line, name: word.clone() });
                }
                previous = if matches!(word.as_str(), "def" | "class") {
                    Previous::Keyword
                } else {
                    Previous::Other
                };
            }
            c if c.is_ascii_digit() => {
                // Consume numeric literals whole so `1.real` is not read as an attribute dot.
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                previous = Previous::Other;
            }
            '.' => {
                previous = Previous::Dot;
                i += 1;
            }
            c if c.is_whitespace() => {
                i += 1;
            }
            '\\' => {
                // Explicit line continuation.
                i += 1;
            }
            _ => {
                previous = Previous::Other;
                i += 1;
            }
        }
    }

    ScanReport { issues }
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

/// Returns the index just past the string literal starting at `start`.
/// Replacement fields of f-strings are scanned into `issues`.
fn skip_string(
    chars: &[char],
    start: usize,
    line: &mut usize,
    fstring: bool,
    issues: &mut Vec<ScanIssue>,
) -> usize {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            if chars.get(i + 1) == Some(&'\n') {
                *line += 1;
            }
            i += 2;
            continue;
        }
        if fstring && c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                i += 2;
            } else {
                i = scan_field(chars, i + 1, line, issues);
            }
            continue;
        }
        if c == '\n' {
            *line += 1;
            if !triple {
                // Unterminated single-line literal.
                return i + 1;
            }
        }
        if c == quote {
            if !triple {
                return i + 1;
            }
            if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return i + 3;
            }
        }
        i += 1;
    }
    chars.len()
}

/// Scans one `{...}` field of an f-string as code and returns the index just
/// past its closing brace. Format specs (`{x:{width}}`) nest.
fn scan_field(chars: &[char], start: usize, line: &mut usize, issues: &mut Vec<ScanIssue>) -> usize {
    let first_line = *line;
    let mut depth = 1;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            '\'' | '"' => {
                // Nested literals are scanned again below as part of the field.
                i = skip_string(chars, i, line, false, &mut Vec::new());
                continue;
            }
            '\n' => *line += 1,
            _ => {}
        }
        i += 1;
    }
    let end = i.min(chars.len());
    let field: String = chars[start..end].iter().collect();
    issues.extend(scan(&field).issues.into_iter().map(|issue| ScanIssue {
        line: first_line + issue.line - 1,
        name: issue.name,
    }));
    (end + 1).min(chars.len())
}

fn next_is_open_paren(chars: &[char], mut i: usize) -> bool {
    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' => i += 1,
            '\\' if chars.get(i + 1) == Some(&'\n') => i += 2,
            '(' => return true,
            _ => return false,
        }
    }
    false
}
