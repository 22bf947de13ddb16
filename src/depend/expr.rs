// src/depend/expr.rs

//! Dependency expression parsing, cleaning and evaluation.
//!
//! Grammar, lowest to highest binding:
//!
//! ```text
//! expr   := repeat ( ',' repeat )*
//! repeat := alt ( '|' alt )*
//! alt    := NAME ( '&' NAME )*
//! ```
//!
//! Empty segments (`"A,,B"`, `"A|"`) are skipped, so cleaning can drop tokens
//! and re-render without dangling separators.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::DependencyError;

pub const REPEAT_SEP: char = ',';
pub const ALT_SEP: char = '|';
pub const AND_SEP: char = '&';

/// Typed dependency expression tree.
///
/// [`parse`] always produces the normalized shape
/// `Repeat([Or([And([Task, ..]), ..]), ..])`; constructors of hand-built
/// trees should keep to it as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepExpr {
    Task(String),
    And(Vec<DepExpr>),
    Or(Vec<DepExpr>),
    Repeat(Vec<DepExpr>),
}

/// Progress of a single referenced task, as seen by [`DepExpr::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    /// Finished in a way that satisfies dependents.
    Done,
    /// Not finished yet.
    Pending,
    /// Finished in a way that can never satisfy dependents.
    Blocked,
}

/// Result of evaluating an expression against current task progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Satisfied,
    Waiting,
    Unsatisfiable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    Repeat,
    Alt,
    And,
}

fn tokenize(src: &str) -> Result<Vec<Token>, DependencyError> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, tokens: &mut Vec<Token>| -> Result<(), DependencyError> {
        let name = current.trim();
        if !name.is_empty() {
            if name.chars().any(char::is_whitespace) {
                return Err(DependencyError::InvalidToken {
                    expr: src.to_string(),
                    token: name.to_string(),
                });
            }
            tokens.push(Token::Name(name.to_string()));
        }
        current.clear();
        Ok(())
    };

    for ch in src.chars() {
        let op = match ch {
            REPEAT_SEP => Some(Token::Repeat),
            ALT_SEP => Some(Token::Alt),
            AND_SEP => Some(Token::And),
            _ => None,
        };
        match op {
            Some(op) => {
                flush(&mut current, &mut tokens)?;
                tokens.push(op);
            }
            None => current.push(ch),
        }
    }
    flush(&mut current, &mut tokens)?;

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_repeat(&mut self) -> DepExpr {
        let mut conditions = Vec::new();
        loop {
            let cond = self.parse_or();
            if !cond.is_empty() {
                conditions.push(cond);
            }
            match self.peek() {
                Some(Token::Repeat) => {
                    self.bump();
                }
                _ => break,
            }
        }
        DepExpr::Repeat(conditions)
    }

    fn parse_or(&mut self) -> DepExpr {
        let mut alternatives = Vec::new();
        loop {
            let alt = self.parse_and();
            if !alt.is_empty() {
                alternatives.push(alt);
            }
            match self.peek() {
                Some(Token::Alt) => {
                    self.bump();
                }
                _ => break,
            }
        }
        DepExpr::Or(alternatives)
    }

    fn parse_and(&mut self) -> DepExpr {
        let mut members = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Name(_)) => {
                    if let Some(Token::Name(name)) = self.bump() {
                        members.push(DepExpr::Task(name));
                    }
                }
                Some(Token::And) => {
                    self.bump();
                }
                _ => break,
            }
        }
        DepExpr::And(members)
    }
}

/// Parse an expression into its normalized tree.
pub fn parse(src: &str) -> Result<DepExpr, DependencyError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    Ok(parser.parse_repeat())
}

/// Drop every token that does not name a task in `item_list` (or names `item`
/// itself), collapsing groups that become empty.
///
/// Idempotent: `clean(l, i, &clean(l, i, e)?) == clean(l, i, e)`.
pub fn clean<S: AsRef<str>>(
    item_list: &[S],
    item: &str,
    expr: &str,
) -> Result<String, DependencyError> {
    let known: HashSet<&str> = item_list.iter().map(|s| s.as_ref()).collect();
    let parsed = parse(expr)?;
    let cleaned = parsed.retain_tasks(&|name| name != item && known.contains(name));
    if cleaned != parsed {
        tracing::debug!(task = %item, before = %expr, after = %cleaned, "cleaned dependency expression");
    }
    Ok(cleaned.to_string())
}

impl DepExpr {
    /// Whether the node contains no task at all.
    pub fn is_empty(&self) -> bool {
        match self {
            DepExpr::Task(_) => false,
            DepExpr::And(xs) | DepExpr::Or(xs) | DepExpr::Repeat(xs) => {
                xs.iter().all(DepExpr::is_empty)
            }
        }
    }

    /// Copy of this tree keeping only tasks accepted by `keep`; empty groups
    /// are removed from their parent.
    pub fn retain_tasks(&self, keep: &dyn Fn(&str) -> bool) -> DepExpr {
        let filter = |xs: &[DepExpr]| -> Vec<DepExpr> {
            xs.iter()
                .map(|x| x.retain_tasks(keep))
                .filter(|x| !x.is_empty())
                .collect()
        };
        match self {
            DepExpr::Task(name) => {
                if keep(name.as_str()) {
                    DepExpr::Task(name.clone())
                } else {
                    DepExpr::And(Vec::new())
                }
            }
            DepExpr::And(xs) => DepExpr::And(filter(xs)),
            DepExpr::Or(xs) => DepExpr::Or(filter(xs)),
            DepExpr::Repeat(xs) => DepExpr::Repeat(filter(xs)),
        }
    }

    /// All task names referenced, in first-seen order without duplicates.
    pub fn task_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_tasks(&mut |name| {
            if seen.insert(name.to_string()) {
                out.push(name.to_string());
            }
        });
        out
    }

    fn collect_tasks(&self, f: &mut dyn FnMut(&str)) {
        match self {
            DepExpr::Task(name) => f(name.as_str()),
            DepExpr::And(xs) | DepExpr::Or(xs) | DepExpr::Repeat(xs) => {
                for x in xs {
                    x.collect_tasks(f);
                }
            }
        }
    }

    /// Repeat-conditions of a normalized tree.
    pub fn conditions(&self) -> &[DepExpr] {
        match self {
            DepExpr::Repeat(xs) => xs,
            _ => std::slice::from_ref(self),
        }
    }

    /// Alternatives of a repeat-condition as sets of task names.
    pub fn alternative_sets(&self) -> Vec<BTreeSet<String>> {
        match self {
            DepExpr::Or(alts) => alts
                .iter()
                .map(|alt| alt.task_names().into_iter().collect())
                .collect(),
            other => vec![other.task_names().into_iter().collect()],
        }
    }

    /// Evaluate against the progress of referenced tasks.
    ///
    /// An empty expression is always satisfied.
    pub fn evaluate(&self, state_of: &dyn Fn(&str) -> DepState) -> Readiness {
        match self {
            DepExpr::Task(name) => match state_of(name.as_str()) {
                DepState::Done => Readiness::Satisfied,
                DepState::Pending => Readiness::Waiting,
                DepState::Blocked => Readiness::Unsatisfiable,
            },
            DepExpr::And(xs) => {
                let mut result = Readiness::Satisfied;
                for x in xs {
                    match x.evaluate(state_of) {
                        Readiness::Unsatisfiable => return Readiness::Unsatisfiable,
                        Readiness::Waiting => result = Readiness::Waiting,
                        Readiness::Satisfied => {}
                    }
                }
                result
            }
            DepExpr::Or(xs) | DepExpr::Repeat(xs) => {
                if xs.is_empty() {
                    return Readiness::Satisfied;
                }
                let mut result = Readiness::Unsatisfiable;
                for x in xs {
                    match x.evaluate(state_of) {
                        Readiness::Satisfied => return Readiness::Satisfied,
                        Readiness::Waiting => result = Readiness::Waiting,
                        Readiness::Unsatisfiable => {}
                    }
                }
                result
            }
        }
    }
}

impl fmt::Display for DepExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, xs: &[DepExpr], sep: char| -> fmt::Result {
            for (i, x) in xs.iter().enumerate() {
                if i > 0 {
                    write!(f, "{sep}")?;
                }
                write!(f, "{x}")?;
            }
            Ok(())
        };
        match self {
            DepExpr::Task(name) => f.write_str(name),
            DepExpr::And(xs) => join(f, xs, AND_SEP),
            DepExpr::Or(xs) => join(f, xs, ALT_SEP),
            DepExpr::Repeat(xs) => join(f, xs, REPEAT_SEP),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_three_tiers() {
        let e = parse("A&B|C,D").unwrap();
        assert_eq!(e.conditions().len(), 2);
        assert_eq!(e.conditions()[0].alternative_sets().len(), 2);
        assert_eq!(e.to_string(), "A&B|C,D");
    }

    #[test]
    fn whitespace_around_tokens_is_ignored() {
        assert_eq!(parse(" A & B | C ").unwrap().to_string(), "A&B|C");
    }

    #[test]
    fn names_with_inner_whitespace_are_rejected() {
        assert!(matches!(
            parse("A B"),
            Err(DependencyError::InvalidToken { .. })
        ));
    }

    #[test]
    fn clean_collapses_empty_groups() {
        let items = names(&["A", "C", "T"]);
        assert_eq!(clean(&items, "T", "A&B|C,B").unwrap(), "A|C");
        assert_eq!(clean(&items, "T", "B,B&X|Y").unwrap(), "");
        assert_eq!(clean(&items, "T", ",A,,C,").unwrap(), "A,C");
    }

    #[test]
    fn clean_drops_self_reference() {
        let items = names(&["A", "T"]);
        assert_eq!(clean(&items, "T", "T|A").unwrap(), "A");
    }

    #[test]
    fn evaluate_respects_tiers() {
        let e = parse("A&B|C").unwrap();
        let state = |done: &'static [&'static str], blocked: &'static [&'static str]| {
            move |n: &str| {
                if done.contains(&n) {
                    DepState::Done
                } else if blocked.contains(&n) {
                    DepState::Blocked
                } else {
                    DepState::Pending
                }
            }
        };

        assert_eq!(e.evaluate(&state(&["C"], &[])), Readiness::Satisfied);
        assert_eq!(e.evaluate(&state(&["A"], &[])), Readiness::Waiting);
        assert_eq!(e.evaluate(&state(&["A", "B"], &[])), Readiness::Satisfied);
        assert_eq!(e.evaluate(&state(&[], &["A", "C"])), Readiness::Unsatisfiable);
        assert_eq!(parse("").unwrap().evaluate(&state(&[], &[])), Readiness::Satisfied);
    }
}
