//! Restricts filter queries to a half-open ingestion-time window.
//!
//! The predicate is placed right after the query's source table, before any other operator, so
//! the analytical store prunes by ingestion time first. Queries are normalized on the way in;
//! the cleanups made and anything that looks wrong are reported as warnings, never as errors.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::bail;
use crate::error::{ErrorKind, RelayResult};

static WINDOW_PREDICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\|\s*where\s+ingestion_time\(\)\s*>=\s*datetime\(([^)]*)\)\s+and\s+ingestion_time\(\)\s*<\s*datetime\(([^)]*)\)[ \t]*$",
    )
    .expect("window predicate pattern is valid")
});

static ESCAPED_PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\u(201[89cCdD]|201[34])").expect("escaped punctuation pattern is valid")
});

/// Half-open time interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.to
    }
}

/// A query restricted to a window, with everything noticed while rewriting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowedQuery {
    pub query: String,
    pub warnings: Vec<String>,
}

/// Restricts `query` to ingestion times in `window`.
///
/// Applying the same window twice gives the same text as applying it once, and a query already
/// restricted to another window gets that predicate replaced rather than a second one added.
pub fn apply_window(query: &str, window: &TimeWindow) -> RelayResult<WindowedQuery> {
    let mut warnings = Vec::new();
    let normalized = normalize(query, &mut warnings);

    if normalized.trim().is_empty() {
        bail!(ErrorKind::QueryFailed, "Query is empty");
    }

    let predicate = window_predicate(window);

    let windowed = if WINDOW_PREDICATE.is_match(&normalized) {
        // `replace_all` takes the replacement as a template; `$` never occurs in the predicate.
        WINDOW_PREDICATE
            .replace_all(&normalized, predicate.as_str())
            .into_owned()
    } else {
        if normalized.contains("ingestion_time()") {
            warnings.push("query already filters on ingestion_time(); the window is added on top".to_owned());
        }

        match insert_predicate(&normalized, &predicate) {
            Some(windowed) => windowed,
            None => bail!(
                ErrorKind::QueryFailed,
                "Query has no tabular expression to restrict",
                normalized
            ),
        }
    };

    check_integrity(&windowed, &mut warnings);

    Ok(WindowedQuery {
        query: format!("{windowed}\n"),
        warnings,
    })
}

/// Reads back the window a query was restricted to, if any.
pub fn parse_window(query: &str) -> Option<TimeWindow> {
    let captures = WINDOW_PREDICATE.captures(query)?;
    let from = DateTime::parse_from_rfc3339(captures.get(1)?.as_str().trim()).ok()?;
    let to = DateTime::parse_from_rfc3339(captures.get(2)?.as_str().trim()).ok()?;

    Some(TimeWindow::new(from.with_timezone(&Utc), to.with_timezone(&Utc)))
}

/// Name of the table a query reads from.
pub fn source_table(query: &str) -> Option<String> {
    let lines = query.lines().collect::<Vec<_>>();
    let index = source_line(&lines)?;
    let (head, _) = split_first_pipe(lines[index]);

    let name = head
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>();

    (!name.is_empty()).then_some(name)
}

fn window_predicate(window: &TimeWindow) -> String {
    format!(
        "| where ingestion_time() >= datetime({}) and ingestion_time() < datetime({})",
        window.from.to_rfc3339_opts(SecondsFormat::Millis, true),
        window.to.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

fn normalize(query: &str, warnings: &mut Vec<String>) -> String {
    let mut text = query.to_owned();

    if text.contains('\r') {
        text = text.replace("\r\n", "\n").replace('\r', "\n");
        warnings.push("line endings normalized".to_owned());
    }

    let unescaped = replace_punctuation(&text);
    if unescaped != text {
        warnings.push("typographic punctuation replaced with ASCII".to_owned());
        text = unescaped;
    }

    let mut lines: Vec<&str> = Vec::new();
    let mut collapsed = false;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() && lines.last().is_some_and(|last| last.is_empty()) {
            collapsed = true;
            continue;
        }
        lines.push(line);
    }
    if collapsed {
        warnings.push("repeated blank lines collapsed".to_owned());
    }

    while lines.first().is_some_and(|line| line.is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}

fn replace_punctuation(text: &str) -> String {
    let text = ESCAPED_PUNCTUATION.replace_all(text, |captures: &regex::Captures<'_>| {
        match captures[1].to_ascii_lowercase().as_str() {
            "2018" | "2019" => "'",
            "201c" | "201d" => "\"",
            _ => "-",
        }
    });

    text.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            other => other,
        })
        .collect()
}

/// Index of the line holding the source table: the first line that is not blank, a comment,
/// or part of a `let`/`set`/`declare` statement.
fn source_line(lines: &[&str]) -> Option<usize> {
    let mut in_statement = false;

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if in_statement {
            in_statement = !trimmed.ends_with(';');
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        if ["let ", "set ", "declare "]
            .iter()
            .any(|keyword| trimmed.starts_with(keyword))
        {
            in_statement = !trimmed.ends_with(';');
            continue;
        }
        if trimmed.starts_with('|') {
            return None;
        }

        return Some(index);
    }

    None
}

/// Splits a line at its first pipe outside string literals and brackets.
fn split_first_pipe(line: &str) -> (&str, Option<&str>) {
    let mut quote = None;
    let mut depth = 0i32;

    for (index, c) in line.char_indices() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth -= 1,
            (None, '|') if depth == 0 => return (&line[..index], Some(&line[index..])),
            _ => {}
        }
    }

    (line, None)
}

fn insert_predicate(text: &str, predicate: &str) -> Option<String> {
    let lines = text.lines().collect::<Vec<_>>();
    let index = source_line(&lines)?;
    let (head, tail) = split_first_pipe(lines[index]);

    let mut out = Vec::with_capacity(lines.len() + 2);
    out.extend(lines[..index].iter().map(|line| (*line).to_owned()));
    out.push(head.trim_end().to_owned());
    out.push(predicate.to_owned());
    if let Some(tail) = tail {
        out.push(tail.trim().to_owned());
    }
    out.extend(lines[index + 1..].iter().map(|line| (*line).to_owned()));

    Some(out.join("\n"))
}

fn check_integrity(query: &str, warnings: &mut Vec<String>) {
    let mut quote = None;
    let mut depth = 0i32;

    for c in query.chars() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth -= 1,
            _ => {}
        }
    }

    if quote.is_some() {
        warnings.push("query has an unterminated string literal".to_owned());
    }
    if depth != 0 {
        warnings.push("query has unbalanced brackets".to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).unwrap().with_timezone(&Utc)
    }

    fn window() -> TimeWindow {
        TimeWindow::new(at("2024-05-01T08:00:00Z"), at("2024-05-01T08:05:00Z"))
    }

    #[test]
    fn predicate_follows_the_source_table() {
        let windowed = apply_window("Orders\n| where Amount > 10\n| project Id", &window()).unwrap();

        assert_eq!(
            windowed.query,
            "Orders\n\
             | where ingestion_time() >= datetime(2024-05-01T08:00:00.000Z) and ingestion_time() < datetime(2024-05-01T08:05:00.000Z)\n\
             | where Amount > 10\n\
             | project Id\n"
        );
        assert!(windowed.warnings.is_empty());
    }

    #[test]
    fn single_line_query_is_split_at_the_first_pipe() {
        let windowed = apply_window("Orders | where Note == 'a|b'", &window()).unwrap();
        let lines = windowed.query.lines().collect::<Vec<_>>();

        assert_eq!(lines[0], "Orders");
        assert!(lines[1].starts_with("| where ingestion_time()"));
        assert_eq!(lines[2], "| where Note == 'a|b'");
    }

    #[test]
    fn let_statements_and_comments_are_skipped() {
        let query = "// big orders\nlet threshold = 10;\nOrders | where Amount > threshold";
        let windowed = apply_window(query, &window()).unwrap();
        let lines = windowed.query.lines().collect::<Vec<_>>();

        assert_eq!(lines[2], "Orders");
        assert!(lines[3].starts_with("| where ingestion_time()"));
        assert_eq!(source_table(&windowed.query).as_deref(), Some("Orders"));
    }

    #[test]
    fn applying_twice_is_the_same_as_once() {
        let once = apply_window("Orders\r\n\r\n\r\n| take 5", &window()).unwrap();
        let twice = apply_window(&once.query, &window()).unwrap();

        assert_eq!(once.query, twice.query);
        assert_eq!(once.query.matches("ingestion_time() >=").count(), 1);
        assert!(twice.warnings.is_empty());
    }

    #[test]
    fn a_new_window_replaces_the_old_predicate() {
        let first = apply_window("Orders", &window()).unwrap();
        let next = TimeWindow::new(at("2024-05-01T08:05:00Z"), at("2024-05-01T08:10:00Z"));

        let second = apply_window(&first.query, &next).unwrap();

        assert_eq!(parse_window(&second.query), Some(next));
        assert_eq!(second.query.matches("ingestion_time() >=").count(), 1);
    }

    #[test]
    fn normalization_is_reported() {
        let query = "Orders\r\n| where Status == \\u201cOpen\\u201d\n\n\n| where Note != ‘x’";
        let windowed = apply_window(query, &window()).unwrap();

        assert!(windowed.query.contains("Status == \"Open\""));
        assert!(windowed.query.contains("Note != 'x'"));
        assert!(!windowed.query.contains("\n\n\n"));
        assert_eq!(windowed.warnings.len(), 3);
    }

    #[test]
    fn integrity_problems_are_warnings() {
        let windowed = apply_window("Orders | where (Amount > 10", &window()).unwrap();
        assert_eq!(windowed.warnings, vec!["query has unbalanced brackets".to_owned()]);
    }

    #[test]
    fn queries_without_a_source_are_rejected() {
        assert_eq!(
            apply_window("  \n ", &window()).unwrap_err().kind(),
            ErrorKind::QueryFailed
        );
        assert_eq!(
            apply_window("let x = 1;", &window()).unwrap_err().kind(),
            ErrorKind::QueryFailed
        );
    }

    #[test]
    fn window_is_half_open() {
        let window = window();
        assert!(window.contains(at("2024-05-01T08:00:00Z")));
        assert!(window.contains(at("2024-05-01T08:04:59Z")));
        assert!(!window.contains(at("2024-05-01T08:05:00Z")));
        assert!(!window.contains(at("2024-05-01T07:59:59Z")));
    }
}
