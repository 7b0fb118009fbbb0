//! Full-text query sanitization, execution and match highlighting

use crate::config::SearchConfig;
use crate::index::SearchIndex;
use crate::record::Composition;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Boolean keywords passed through to FTS5 as operators
const KEYWORDS: &[&str] = &["AND", "OR", "NOT"];

/// One occurrence of a search term inside a composition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    /// Byte offset of the first matched byte
    pub start: usize,
    /// Byte offset one past the last matched byte
    pub end: usize,
    /// The matched text as it appears in the content
    pub text: String,
}

/// A composition returned by a search, with its highlighted content
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub composition: Composition,
    pub highlighted: String,
    pub matches: Vec<SearchMatch>,
}

impl SearchResult {
    pub fn match_count(&self) -> usize {
        self.matches.len()
    }
}

/// Wraps matches in a pair of delimiters
#[derive(Debug, Clone)]
pub struct Highlighter {
    open: String,
    close: String,
}

impl Highlighter {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    /// Find every case-insensitive occurrence of `terms` and wrap it.
    ///
    /// Terms are processed in order; an occurrence overlapping one already
    /// accepted is discarded, so earlier terms win.
    pub fn highlight(&self, content: &str, terms: &[String]) -> (String, Vec<SearchMatch>) {
        let matches = find_matches(content, terms);
        (self.apply(content, &matches), matches)
    }

    /// Wrap the given matches, which must be sorted and non-overlapping
    pub fn apply(&self, content: &str, matches: &[SearchMatch]) -> String {
        let extra = matches.len() * (self.open.len() + self.close.len());
        let mut out = String::with_capacity(content.len() + extra);
        let mut last = 0;
        for m in matches {
            out.push_str(&content[last..m.start]);
            out.push_str(&self.open);
            out.push_str(&content[m.start..m.end]);
            out.push_str(&self.close);
            last = m.end;
        }
        out.push_str(&content[last..]);
        out
    }
}

impl Default for Highlighter {
    fn default() -> Self {
        let config = SearchConfig::default();
        Self::new(config.highlight_open, config.highlight_close)
    }
}

/// Runs user queries against the index
pub struct QueryEngine {
    index: Arc<SearchIndex>,
    highlighter: Highlighter,
}

impl QueryEngine {
    pub fn new(index: Arc<SearchIndex>, config: &SearchConfig) -> Self {
        Self {
            index,
            highlighter: Highlighter::new(&config.highlight_open, &config.highlight_close),
        }
    }

    pub fn highlighter(&self) -> &Highlighter {
        &self.highlighter
    }

    /// Highlight `terms` in `content` with the configured delimiters
    pub fn highlight(&self, content: &str, terms: &[String]) -> (String, Vec<SearchMatch>) {
        self.highlighter.highlight(content, terms)
    }

    /// Search all compositions, newest first.
    ///
    /// A query that sanitizes to nothing, or that FTS5 still refuses to
    /// parse, yields no results rather than an error.
    pub fn search(&self, raw: &str) -> crate::Result<Vec<SearchResult>> {
        let sanitized = sanitize(raw);
        let Some(fts_query) = to_fts_query(&sanitized) else {
            debug!(query = raw, "Query is empty after sanitization");
            return Ok(Vec::new());
        };

        let compositions = match self.index.search(&fts_query) {
            Ok(compositions) => compositions,
            Err(e) if e.is_fts_syntax() => {
                warn!(query = raw, fts_query = %fts_query, error = %e, "Search query rejected by full-text parser");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let terms = extract_terms(&sanitized);
        debug!(query = raw, results = compositions.len(), "Search complete");
        Ok(self.build_results(compositions, &terms))
    }

    /// Compositions of one working directory whose content contains any
    /// query term. An empty query matches every composition there.
    pub fn search_in_directory(&self, raw: &str, working_dir: &str) -> crate::Result<Vec<SearchResult>> {
        let terms = extract_terms(&sanitize(raw));
        let lowered: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();

        let compositions: Vec<Composition> = self
            .index
            .get_by_directory(working_dir)?
            .into_iter()
            .filter(|c| {
                if lowered.is_empty() {
                    return true;
                }
                let content = c.content.to_lowercase();
                lowered.iter().any(|term| content.contains(term.as_str()))
            })
            .collect();

        Ok(self.build_results(compositions, &terms))
    }

    fn build_results(&self, compositions: Vec<Composition>, terms: &[String]) -> Vec<SearchResult> {
        compositions
            .into_iter()
            .map(|composition| {
                let (highlighted, matches) = self.highlighter.highlight(&composition.content, terms);
                SearchResult {
                    composition,
                    highlighted,
                    matches,
                }
            })
            .collect()
    }
}

fn strip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"[^\w\s"'\-]"#).expect("sanitize pattern is a valid regex")
    })
}

/// Replace everything but word characters, whitespace, quotes and hyphens
/// with a space, then collapse runs of whitespace.
pub fn sanitize(raw: &str) -> String {
    let stripped = strip_pattern().replace_all(raw.trim(), " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Translate a sanitized query into an FTS5 MATCH expression.
///
/// Every term is emitted as a quoted FTS5 string; only the boolean keywords
/// survive as syntax. Returns `None` when no term remains.
pub fn to_fts_query(sanitized: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut pending_op: Option<&'static str> = None;

    for token in QueryTokenizer::new(sanitized).tokens() {
        match token {
            Token::Word(word) => {
                if let Some(op) = keyword(&word) {
                    // leading operators are dropped; repeated ones keep the first
                    if !parts.is_empty() && pending_op.is_none() {
                        pending_op = Some(op);
                    }
                    continue;
                }
                push_term(&mut parts, &mut pending_op, &word);
            }
            Token::Phrase(phrase) => push_term(&mut parts, &mut pending_op, &phrase),
        }
    }

    // a trailing pending operator is simply never emitted
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn push_term(parts: &mut Vec<String>, pending_op: &mut Option<&'static str>, term: &str) {
    if let Some(op) = pending_op.take() {
        parts.push(op.to_string());
    }
    parts.push(format!("\"{}\"", term.replace('"', "\"\"")));
}

fn keyword(word: &str) -> Option<&'static str> {
    KEYWORDS
        .iter()
        .find(|k| k.eq_ignore_ascii_case(word))
        .copied()
}

/// Terms to highlight: the text between boolean keywords, quotes removed.
///
/// Everything between two keywords is one term, so `hello world` highlights
/// only the adjacent pair.
pub fn extract_terms(sanitized: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut run: Vec<String> = Vec::new();

    for token in QueryTokenizer::new(sanitized).tokens() {
        match token {
            Token::Word(word) if keyword(&word).is_some() => flush_term(&mut terms, &mut run),
            Token::Word(text) | Token::Phrase(text) => run.push(text),
        }
    }
    flush_term(&mut terms, &mut run);
    terms
}

fn flush_term(terms: &mut Vec<String>, run: &mut Vec<String>) {
    let term = run.join(" ");
    run.clear();
    if !term.is_empty() {
        terms.push(term);
    }
}

/// Non-overlapping case-insensitive occurrences of `terms`, sorted by start
pub fn find_matches(content: &str, terms: &[String]) -> Vec<SearchMatch> {
    let mut matches: Vec<SearchMatch> = Vec::new();

    for term in terms.iter().filter(|t| !t.is_empty()) {
        let pattern = match RegexBuilder::new(&regex::escape(term))
            .case_insensitive(true)
            .build()
        {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(term = %term, error = %e, "Skipping unmatchable highlight term");
                continue;
            }
        };

        for found in pattern.find_iter(content) {
            let overlaps = matches
                .iter()
                .any(|m| found.start() < m.end && m.start < found.end());
            if !overlaps {
                matches.push(SearchMatch {
                    start: found.start(),
                    end: found.end(),
                    text: found.as_str().to_string(),
                });
            }
        }
    }

    matches.sort_by_key(|m| m.start);
    matches
}

/// Up to `radius` bytes of context either side of a match, widened to
/// character boundaries.
pub fn match_context<'a>(content: &'a str, m: &SearchMatch, radius: usize) -> &'a str {
    let mut start = m.start.min(content.len()).saturating_sub(radius);
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = m.end.saturating_add(radius).min(content.len());
    while !content.is_char_boundary(end) {
        end += 1;
    }
    &content[start..end]
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Phrase(String),
}

/// Splits a sanitized query into bare words and double-quoted phrases
struct QueryTokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> QueryTokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn tokens(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some('"') => {
                    self.advance(); // consume opening quote
                    let phrase = self.take_while(|c| c != '"');
                    self.advance(); // closing quote, if any
                    let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !phrase.is_empty() {
                        tokens.push(Token::Phrase(phrase));
                    }
                }
                Some(_) => {
                    let word = self.take_while(|c| !c.is_whitespace() && c != '"');
                    tokens.push(Token::Word(word.to_string()));
                }
            }
        }
        tokens
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if keep(c) {
                self.advance();
            } else {
                break;
            }
        }
        &self.input[start..self.pos]
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;
    use time::OffsetDateTime;

    fn terms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (TempDir, Arc<SearchIndex>, QueryEngine) {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(SearchIndex::open(&dir.path().join("history.db"), 1).unwrap());
        let engine = QueryEngine::new(Arc::clone(&index), &SearchConfig::default());
        (dir, index, engine)
    }

    fn add(index: &SearchIndex, name: &str, dir: &str, content: &str, secs: i64) {
        let at = OffsetDateTime::from_unix_timestamp(1_760_000_000 + secs).unwrap();
        index
            .insert(&Composition::new(Path::new(&format!("/h/{name}.md")), dir, content, at))
            .unwrap();
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("  hello   world  "), "hello world");
        assert_eq!(sanitize("foo* (bar) ^baz"), "foo bar baz");
        assert_eq!(sanitize("don't re-use \"this\""), "don't re-use \"this\"");
        assert_eq!(sanitize("***"), "");
        assert_eq!(sanitize("naïve café"), "naïve café");
    }

    #[test]
    fn test_fts_query_quotes_terms_and_keeps_operators() {
        assert_eq!(to_fts_query("hello").as_deref(), Some("\"hello\""));
        assert_eq!(
            to_fts_query("cats and dogs").as_deref(),
            Some("\"cats\" AND \"dogs\"")
        );
        assert_eq!(
            to_fts_query("\"quick fox\" OR re-use").as_deref(),
            Some("\"quick fox\" OR \"re-use\"")
        );
    }

    #[test]
    fn test_fts_query_drops_dangling_operators() {
        assert_eq!(to_fts_query("AND hello OR").as_deref(), Some("\"hello\""));
        assert_eq!(to_fts_query("a OR OR NOT b").as_deref(), Some("\"a\" OR \"b\""));
        assert_eq!(to_fts_query("not"), None);
        assert_eq!(to_fts_query(""), None);
        assert_eq!(to_fts_query("\"\""), None);
    }

    #[test]
    fn test_extract_terms() {
        assert_eq!(
            extract_terms("\"quick fox\" and lazy OR dog"),
            terms(&["quick fox", "lazy", "dog"])
        );
        assert_eq!(extract_terms("\"unterminated phrase"), terms(&["unterminated phrase"]));
        assert!(extract_terms("AND or Not").is_empty());
    }

    #[test]
    fn test_extract_terms_keeps_words_between_keywords_together() {
        assert_eq!(extract_terms("hello world"), terms(&["hello world"]));
        assert_eq!(
            extract_terms("big \"red dog\" not cat"),
            terms(&["big red dog", "cat"])
        );
        assert_eq!(extract_terms("or hello world AND"), terms(&["hello world"]));
    }

    #[test]
    fn test_search_highlights_multi_word_term_once() {
        let (_dir, index, engine) = setup();
        add(&index, "a", "/tmp", "say hello world now", 0);

        let results = engine.search("hello world").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].highlighted, "say <<hello world>> now");
        let spans: Vec<(usize, usize)> = results[0].matches.iter().map(|m| (m.start, m.end)).collect();
        assert_eq!(spans, vec![(4, 15)]);
    }

    #[test]
    fn test_highlight_does_not_nest_overlapping_matches() {
        let highlighter = Highlighter::default();
        let (text, matches) = highlighter.highlight("cat catalog", &terms(&["cat"]));

        let spans: Vec<(usize, usize)> = matches.iter().map(|m| (m.start, m.end)).collect();
        assert_eq!(spans, vec![(0, 3), (4, 7)]);
        assert_eq!(text, "<<cat>> <<cat>>alog");
    }

    #[test]
    fn test_highlight_first_term_wins() {
        let highlighter = Highlighter::new("[", "]");
        let (text, matches) = highlighter.highlight("catalog", &terms(&["catalog", "cat", "log"]));
        assert_eq!(matches.len(), 1);
        assert_eq!(text, "[catalog]");

        let (text, matches) = highlighter.highlight("Hello HELLO world", &terms(&["world", "hello"]));
        let starts: Vec<usize> = matches.iter().map(|m| m.start).collect();
        assert_eq!(starts, vec![0, 6, 12]);
        assert_eq!(matches[1].text, "HELLO");
        assert_eq!(text, "[Hello] [HELLO] [world]");
    }

    #[test]
    fn test_highlight_without_terms_is_identity() {
        let (text, matches) = Highlighter::default().highlight("plain text", &[]);
        assert_eq!(text, "plain text");
        assert!(matches.is_empty());
    }

    #[test]
    fn test_match_context_respects_char_boundaries() {
        let content = "ééé needle ééé";
        let m = &find_matches(content, &terms(&["needle"]))[0];
        let snippet = match_context(content, m, 2);
        assert!(snippet.contains("needle"));
        assert!(snippet.len() >= "needle".len() + 2);
        assert_eq!(match_context(content, m, 1000), content);
    }

    #[test]
    fn test_search_returns_highlighted_results_newest_first() {
        let (_dir, index, engine) = setup();
        add(&index, "a", "/tmp/proj", "hello\nworld", 0);
        add(&index, "b", "/tmp/other", "say hello again", 10);
        add(&index, "c", "/tmp/proj", "unrelated", 20);

        let results = engine.search("hello").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].composition.content, "say hello again");
        assert_eq!(results[1].composition.content, "hello\nworld");
        assert_eq!(results[1].matches[0].start, 0);
        assert_eq!(results[1].matches[0].end, 5);
        assert_eq!(results[1].highlighted, "<<hello>>\nworld");
        assert_eq!(results[1].match_count(), 1);
    }

    #[test]
    fn test_search_with_hostile_input_never_errors() {
        let (_dir, index, engine) = setup();
        add(&index, "a", "/tmp", "it's a well-known fact", 0);

        assert!(engine.search("").unwrap().is_empty());
        assert!(engine.search("(((").unwrap().is_empty());
        assert!(engine.search("OR AND").unwrap().is_empty());
        assert!(engine.search("\"unbalanced").unwrap().is_empty());
        assert_eq!(engine.search("well-known").unwrap().len(), 1);
        assert_eq!(engine.search("it's").unwrap().len(), 1);
        assert_eq!(engine.search("fact*").unwrap().len(), 1);
    }

    #[test]
    fn test_search_in_directory() {
        let (_dir, index, engine) = setup();
        add(&index, "a", "/proj/a", "Deploy notes", 0);
        add(&index, "b", "/proj/a", "grocery list", 10);
        add(&index, "c", "/proj/b", "deploy elsewhere", 20);

        let hits = engine.search_in_directory("deploy", "/proj/a").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].highlighted, "<<Deploy>> notes");

        let everything = engine.search_in_directory("", "/proj/a").unwrap();
        assert_eq!(everything.len(), 2);
    }
}
