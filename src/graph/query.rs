//! Pattern queries sent to the graph store
//!
//! A query is a comma-separated list of clauses, each `<label>(<conditions>)`.
//! Every clause constrains the same node:
//!
//! ```text
//! n(type=domain,value~/\.com$/),1(depth<=2),1(ID=[4,7])
//! ```
//!
//! Conditions are `key=value`, `key!=value`, `key~/regex/`, numeric
//! comparisons (`<`, `<=`, `>`, `>=`) and list membership `key=[a,b]`.

use super::{GraphError, GraphResult};
use crate::message::NodeData;
use regex::Regex;
use serde_json::Value;

/// A worker's pattern plus the bounds the coordinator adds to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphQuery {
    pub pattern: String,
    pub depth: Option<u32>,
    pub ids: Vec<u64>,
}

impl GraphQuery {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            depth: None,
            ids: Vec::new(),
        }
    }

    pub fn with_depth(mut self, depth: Option<u32>) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_ids(mut self, ids: &[u64]) -> Self {
        self.ids = ids.to_vec();
        self
    }

    /// Render in the graph store's query syntax.
    pub fn render(&self) -> String {
        let mut query = self.pattern.trim().to_string();
        if let Some(depth) = self.depth {
            query.push_str(&format!(",1(depth<={depth})"));
        }
        if !self.ids.is_empty() {
            let ids: Vec<String> = self.ids.iter().map(u64::to_string).collect();
            query.push_str(&format!(",1(ID=[{}])", ids.join(",")));
        }
        query
    }
}

impl std::fmt::Display for GraphQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone)]
enum Op {
    Eq(String),
    NotEq(String),
    Matches(Regex),
    Lt(f64),
    Le(f64),
    Gt(f64),
    Ge(f64),
    In(Vec<String>),
}

#[derive(Debug, Clone)]
struct Condition {
    key: String,
    op: Op,
}

/// A parsed query, ready to test nodes against.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    conditions: Vec<Condition>,
}

impl CompiledQuery {
    pub fn parse(query: &str) -> GraphResult<Self> {
        let invalid = |why: &str| GraphError::InvalidQuery(format!("{query}: {why}"));
        let mut conditions = Vec::new();
        let mut rest = query.trim();

        while !rest.is_empty() {
            let open = rest.find('(').ok_or_else(|| invalid("expected '('"))?;
            let body_start = open + 1;
            let close = find_close(rest, body_start).ok_or_else(|| invalid("unbalanced '('"))?;
            for part in split_top_level(&rest[body_start..close]) {
                let part = part.trim();
                if !part.is_empty() {
                    conditions.push(parse_condition(part).map_err(|e| invalid(&e))?);
                }
            }
            rest = rest[close + 1..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        }
        Ok(Self { conditions })
    }

    pub fn matches(&self, node: &NodeData) -> bool {
        self.conditions.iter().all(|c| {
            let Some(value) = node.get(&c.key) else {
                return matches!(c.op, Op::NotEq(_));
            };
            let text = value_text(value);
            match &c.op {
                Op::Eq(expected) => &text == expected,
                Op::NotEq(expected) => &text != expected,
                Op::Matches(re) => re.is_match(&text),
                Op::In(values) => values.contains(&text),
                Op::Lt(n) => value_number(value).is_some_and(|v| v < *n),
                Op::Le(n) => value_number(value).is_some_and(|v| v <= *n),
                Op::Gt(n) => value_number(value).is_some_and(|v| v > *n),
                Op::Ge(n) => value_number(value).is_some_and(|v| v >= *n),
            }
        })
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Index of the ')' closing the clause whose body starts at `from`.
fn find_close(s: &str, from: usize) -> Option<usize> {
    let mut in_regex = false;
    let mut in_list = false;
    let mut escaped = false;
    for (i, ch) in s[from..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_regex => escaped = true,
            '/' => in_regex = !in_regex,
            '[' if !in_regex => in_list = true,
            ']' if !in_regex => in_list = false,
            ')' if !in_regex && !in_list => return Some(from + i),
            _ => {}
        }
    }
    None
}

fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_regex = false;
    let mut in_list = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_regex => escaped = true,
            '/' => in_regex = !in_regex,
            '[' if !in_regex => in_list = true,
            ']' if !in_regex => in_list = false,
            ',' if !in_regex && !in_list => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

fn parse_condition(part: &str) -> Result<Condition, String> {
    let op_at = part
        .find(['=', '!', '~', '<', '>'])
        .ok_or_else(|| format!("no operator in '{part}'"))?;
    let key = part[..op_at].trim().to_string();
    if key.is_empty() {
        return Err(format!("missing key in '{part}'"));
    }
    let rest = &part[op_at..];
    let number = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a number"))
    };

    let op = if let Some(v) = rest.strip_prefix("<=") {
        Op::Le(number(v)?)
    } else if let Some(v) = rest.strip_prefix(">=") {
        Op::Ge(number(v)?)
    } else if let Some(v) = rest.strip_prefix("!=") {
        Op::NotEq(v.trim().to_string())
    } else if let Some(v) = rest.strip_prefix('<') {
        Op::Lt(number(v)?)
    } else if let Some(v) = rest.strip_prefix('>') {
        Op::Gt(number(v)?)
    } else if let Some(v) = rest.strip_prefix('~') {
        let v = v.trim();
        let source = v
            .strip_prefix('/')
            .and_then(|v| v.strip_suffix('/'))
            .ok_or_else(|| format!("regex must be /delimited/ in '{part}'"))?;
        Op::Matches(Regex::new(source).map_err(|e| e.to_string())?)
    } else if let Some(v) = rest.strip_prefix('=') {
        let v = v.trim();
        match v.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            Some(list) => Op::In(
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            None => Op::Eq(v.to_string()),
        }
    } else {
        return Err(format!("unknown operator in '{part}'"));
    };
    Ok(Condition { key, op })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(v: Value) -> NodeData {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn render_appends_depth_and_ids() {
        let q = GraphQuery::new("n(type=domain)")
            .with_depth(Some(2))
            .with_ids(&[4, 7]);
        assert_eq!(q.render(), "n(type=domain),1(depth<=2),1(ID=[4,7])");
        assert_eq!(GraphQuery::new("n(type=domain)").render(), "n(type=domain)");
    }

    #[test]
    fn rendered_query_filters_nodes() {
        let q = GraphQuery::new("n(type=domain,value~/\\.com$/)")
            .with_depth(Some(1))
            .with_ids(&[1, 2]);
        let compiled = CompiledQuery::parse(&q.render()).unwrap();

        assert!(compiled.matches(&node(json!({"type": "domain", "value": "a.com", "ID": 1, "depth": 1}))));
        assert!(!compiled.matches(&node(json!({"type": "domain", "value": "a.org", "ID": 1, "depth": 1}))));
        assert!(!compiled.matches(&node(json!({"type": "domain", "value": "a.com", "ID": 3, "depth": 0}))));
        assert!(!compiled.matches(&node(json!({"type": "domain", "value": "a.com", "ID": 2, "depth": 2}))));
    }

    #[test]
    fn commas_inside_regex_do_not_split() {
        let compiled = CompiledQuery::parse("n(value~/^a{1,2}$/)").unwrap();
        assert!(compiled.matches(&node(json!({"value": "aa"}))));
        assert!(!compiled.matches(&node(json!({"value": "aaa"}))));
    }

    #[test]
    fn empty_clause_matches_everything() {
        let compiled = CompiledQuery::parse("n()").unwrap();
        assert!(compiled.matches(&node(json!({"type": "x"}))));
    }

    #[test]
    fn not_equal_matches_missing_keys() {
        let compiled = CompiledQuery::parse("n(status!=done)").unwrap();
        assert!(compiled.matches(&node(json!({"type": "x"}))));
        assert!(!compiled.matches(&node(json!({"status": "done"}))));
    }

    #[test]
    fn malformed_queries_are_rejected() {
        assert!(CompiledQuery::parse("n(type=x").is_err());
        assert!(CompiledQuery::parse("n(type)").is_err());
        assert!(CompiledQuery::parse("n(value~unterminated)").is_err());
        assert!(CompiledQuery::parse("n(depth<=x)").is_err());
    }
}
