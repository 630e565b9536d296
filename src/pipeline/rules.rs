//! Data-driven heuristics for the match engine.
//!
//! Every heuristic is an ordered list of compiled rules rather than
//! hard-coded branches:
//! - priority keyword sets, most severe first
//! - task-title vocabularies (action words, technical subjects)
//! - subject-line ticket-number patterns, most specific first
//!
//! All rule sets are pure and deterministic; none touch the database.

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::Priority;

const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "emergency",
    "critical",
    "asap",
    "down",
    "not working",
];
const HIGH_KEYWORDS: &[&str] = &["important", "high priority", "soon", "broken", "error"];

const ACTION_WORDS: &[&str] = &[
    "fix",
    "repair",
    "install",
    "setup",
    "configure",
    "update",
    "upgrade",
    "replace",
    "check",
    "troubleshoot",
    "reset",
    "restore",
    "resolve",
    "connection",
    "issue",
    "problem",
    "error",
    "bug",
    "crash",
    "slow",
];
const TECH_SUBJECTS: &[&str] = &[
    "email",
    "printer",
    "network",
    "wifi",
    "computer",
    "laptop",
    "server",
    "database",
    "website",
    "application",
    "software",
    "password",
    "access",
    "login",
    "account",
    "internet",
    "phone",
    "mobile",
    "vpn",
];

const FALLBACK_TITLE: &str = "Support Request";

/// Build a case-insensitive, word-bounded alternation over `words`.
fn keyword_regex(words: &[&str], suffix: &str) -> Regex {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b({alternation}){suffix}\b")).unwrap()
}

// ── Priority ────────────────────────────────────────────────────────

/// A keyword set that assigns one priority.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    pub priority: Priority,
    pub regex: Regex,
}

/// Ordered priority rules; first hit wins, no hit yields `Medium`.
#[derive(Debug, Clone)]
pub struct PriorityRules {
    rules: Vec<PriorityRule>,
}

impl PriorityRules {
    pub fn default_rules() -> Self {
        Self {
            rules: vec![
                PriorityRule {
                    priority: Priority::Urgent,
                    regex: keyword_regex(URGENT_KEYWORDS, ""),
                },
                PriorityRule {
                    priority: Priority::High,
                    regex: keyword_regex(HIGH_KEYWORDS, ""),
                },
            ],
        }
    }

    pub fn evaluate(&self, subject: &str, body: &str) -> Priority {
        let content = format!("{subject}\n{body}");
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(&content))
            .map(|rule| rule.priority)
            .unwrap_or(Priority::Medium)
    }
}

// ── Task titles ─────────────────────────────────────────────────────

/// Short task titles built from two fixed vocabularies.
#[derive(Debug, Clone)]
pub struct TitleRules {
    actions: Regex,
    subjects: Regex,
    max_chars: usize,
}

impl TitleRules {
    pub fn default_rules(max_chars: usize) -> Self {
        Self {
            actions: keyword_regex(ACTION_WORDS, "(?:es|ed|ing|s)?"),
            subjects: keyword_regex(TECH_SUBJECTS, "s?"),
            max_chars,
        }
    }

    /// Derive a title of at most three words, action first, capped at
    /// `max_chars` including any ellipsis.
    pub fn derive(&self, subject: &str, body: &str) -> String {
        let mut nouns: Vec<String> = Vec::new();
        for text in [subject, body] {
            for word in captures(&self.subjects, text) {
                if nouns.len() >= 2 {
                    break;
                }
                if !nouns.contains(&word) {
                    nouns.push(word);
                }
            }
        }

        let action = captures(&self.actions, subject)
            .into_iter()
            .chain(captures(&self.actions, body))
            .find(|word| !nouns.contains(word));

        let tokens: Vec<String> = action.into_iter().chain(nouns).take(3).collect();
        let title = if tokens.is_empty() {
            let words: Vec<&str> = subject
                .split_whitespace()
                .filter(|w| w.chars().count() > 3)
                .take(3)
                .collect();
            if words.is_empty() {
                FALLBACK_TITLE.to_string()
            } else {
                words.join(" ")
            }
        } else {
            tokens.iter().map(|t| title_case(t)).collect::<Vec<_>>().join(" ")
        };

        truncate_with_ellipsis(&title, self.max_chars)
    }
}

/// Lowercased first-group captures, in text order.
fn captures(regex: &Regex, text: &str) -> Vec<String> {
    regex
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Shorten to `max` characters, ending in `...` when cut.
pub fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let head: String = text.chars().take(keep).collect();
    format!("{}...", head.trim_end())
}

// ── Subject-line ticket numbers ─────────────────────────────────────

/// A ticket reference found in a subject line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketToken {
    /// Full `TKT-YYYY-NNNNN` number.
    Number(String),
    /// Bare numeric reference, resolved against the sequence suffix.
    Sequence(i64),
}

#[derive(Debug, Clone, Copy)]
enum TokenShape {
    Number,
    Sequence,
}

/// One subject-line pattern.
#[derive(Debug, Clone)]
pub struct SubjectPattern {
    pub name: &'static str,
    regex: Regex,
    shape: TokenShape,
}

/// Ordered ticket-number patterns plus reply-prefix stripping.
#[derive(Debug, Clone)]
pub struct SubjectRules {
    prefix: Regex,
    patterns: Vec<SubjectPattern>,
}

impl SubjectRules {
    pub fn default_rules() -> Self {
        let pattern = |name, re: &str, shape| SubjectPattern {
            name,
            regex: Regex::new(re).unwrap(),
            shape,
        };
        Self {
            prefix: Regex::new(r"(?i)^(?:\s*(?:re|fwd?|aw|wg)\s*:|\s*\[[^\]]*\])+\s*").unwrap(),
            patterns: vec![
                pattern("full ticket number", r"(?i)\b(TKT-\d{4}-\d+)\b", TokenShape::Number),
                pattern("ticket #n", r"(?i)\bticket\s*#?\s*(\d+)", TokenShape::Sequence),
                pattern("[#n]", r"\[#(\d+)\]", TokenShape::Sequence),
                pattern("#n", r"#(\d+)", TokenShape::Sequence),
                pattern("bare 5+ digits", r"(?:^|\s)(\d{5,})\b", TokenShape::Sequence),
            ],
        }
    }

    /// Remove leading `Re:`/`Fwd:`/`[...]` tokens.
    pub fn strip_prefixes(&self, subject: &str) -> String {
        self.prefix.replace(subject, "").trim().to_string()
    }

    /// Candidate tickets, most specific first, searched on the original
    /// subject and then on the stripped one. Duplicates are dropped.
    pub fn candidates(&self, subject: &str) -> Vec<TicketToken> {
        let stripped = self.strip_prefixes(subject);
        let mut out = Vec::new();
        for text in [subject, stripped.as_str()] {
            for pattern in &self.patterns {
                let Some(found) = pattern.regex.captures(text).and_then(|c| c.get(1)) else {
                    continue;
                };
                let token = match pattern.shape {
                    TokenShape::Number => TicketToken::Number(found.as_str().to_uppercase()),
                    TokenShape::Sequence => match found.as_str().parse() {
                        Ok(n) => TicketToken::Sequence(n),
                        Err(_) => continue,
                    },
                };
                debug!(pattern = pattern.name, ?token, "Subject pattern hit");
                if !out.contains(&token) {
                    out.push(token);
                }
            }
        }
        out
    }
}

// ── Rule set ────────────────────────────────────────────────────────

/// All heuristics the match engine uses.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub priority: PriorityRules,
    pub title: TitleRules,
    pub subject: SubjectRules,
}

impl RuleSet {
    pub fn default_rules(title_max_chars: usize) -> Self {
        Self {
            priority: PriorityRules::default_rules(),
            title: TitleRules::default_rules(title_max_chars),
            subject: SubjectRules::default_rules(),
        }
    }
}
