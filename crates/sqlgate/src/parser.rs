//! Statement parser: extracts `(operation, table)` for metrics labels.
//!
//! This is not a SQL parser. It tokenizes the statement at parenthesis depth
//! zero, takes the first token matching a known operation, and reads the
//! token following the operation's anchor word. Results are cached by a
//! 16-byte digest of the normalized statement, since services run a small
//! fixed set of query shapes.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use md5::{Digest, Md5};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Select,
    Insert,
    Update,
    Delete,
    Call,
    Exec,
    Execute,
    Upsert,
    Unknown,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Select => "select",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Call => "call",
            OperationKind::Exec => "exec",
            OperationKind::Execute => "execute",
            OperationKind::Upsert => "upsert",
            OperationKind::Unknown => "unknown",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "select" => Some(OperationKind::Select),
            "insert" => Some(OperationKind::Insert),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            "call" => Some(OperationKind::Call),
            "exec" => Some(OperationKind::Exec),
            "execute" => Some(OperationKind::Execute),
            "upsert" => Some(OperationKind::Upsert),
            _ => None,
        }
    }

    /// The word after which the table name appears.
    fn table_anchor(&self) -> Option<&'static str> {
        match self {
            OperationKind::Select | OperationKind::Delete => Some("from"),
            OperationKind::Insert | OperationKind::Upsert => Some("into"),
            OperationKind::Update => Some("update"),
            OperationKind::Call => Some("call"),
            OperationKind::Exec => Some("exec"),
            OperationKind::Execute => Some("execute"),
            OperationKind::Unknown => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: String,
}

const UNKNOWN_TABLE: &str = "unknown";

/// Thread-safe parser with a digest-keyed result cache.
#[derive(Debug, Default)]
pub struct Parser {
    cache: RwLock<HashMap<[u8; 16], Operation>>,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&self, stmt: &str) -> Operation {
        let normalized = normalize(stmt);

        let hash: [u8; 16] = Md5::digest(normalized.as_bytes()).into();

        if let Some(op) = self.cached(&hash) {
            return op;
        }

        let op = parse_statement(&normalized);
        self.memorize(hash, op.clone());

        op
    }

    fn cached(&self, hash: &[u8; 16]) -> Option<Operation> {
        self.cache
            .read()
            .ok()
            .and_then(|cache| cache.get(hash).cloned())
    }

    fn memorize(&self, hash: [u8; 16], op: Operation) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(hash, op);
        }
    }
}

fn normalize(stmt: &str) -> String {
    stmt.replace('\n', " ").trim().to_lowercase()
}

fn parse_statement(stmt: &str) -> Operation {
    let tokens = tokenize(stmt);

    let kind = tokens
        .iter()
        .find_map(|t| OperationKind::from_token(t))
        .unwrap_or(OperationKind::Unknown);

    let mut op = Operation {
        kind,
        table: UNKNOWN_TABLE.to_string(),
    };

    let Some(anchor) = kind.table_anchor() else {
        return op;
    };

    if let Some(idx) = tokens.iter().position(|t| *t == anchor) {
        if let Some(table) = tokens.get(idx + 1) {
            op.table = (*table).to_string();
        }
    }

    op
}

/// Splits a statement into tokens at parenthesis depth zero.
///
/// Keeping only depth-zero tokens is what makes a leading CTE resolve to the
/// outer statement: in `with q as (select …) insert into b …` the subquery's
/// `select` sits at depth one and never competes with `insert`.
fn tokenize(stmt: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut depth = 0u32;
    let mut start: Option<usize> = None;

    for (idx, ch) in stmt.char_indices() {
        if is_delimiter(ch) {
            if let Some(s) = start.take() {
                if depth == 0 {
                    tokens.push(&stmt[s..idx]);
                }
            }

            match ch {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }

    if let Some(s) = start {
        if depth == 0 {
            tokens.push(&stmt[s..]);
        }
    }

    tokens
}

fn is_delimiter(r: char) -> bool {
    if ('\u{2000}'..='\u{200a}').contains(&r) {
        return true;
    }

    matches!(
        r,
        ' ' | '\t'
            | '\n'
            | '\u{000b}'
            | '\u{000c}'
            | '\r'
            | ';'
            | '('
            | ')'
            | '.'
            | ','
            | '\u{0085}'
            | '\u{00a0}'
            | '\u{1680}'
            | '\u{2028}'
            | '\u{2029}'
            | '\u{202f}'
            | '\u{205f}'
            | '\u{3000}'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, table: &str) -> Operation {
        Operation {
            kind,
            table: table.to_string(),
        }
    }

    #[test]
    fn parse_table() {
        let cases = [
            (
                "SELECT id, name, phone FROM users WHERE id=$1",
                op(OperationKind::Select, "users"),
            ),
            ("SELECT 1", op(OperationKind::Select, "unknown")),
            (
                "INSERT INTO users (name, phone) VALUES ($1, $2)",
                op(OperationKind::Insert, "users"),
            ),
            (
                "INSERT INTO test SELECT * FROM boo",
                op(OperationKind::Insert, "test"),
            ),
            (
                "UPSERT INTO test (id, name, phone) VALUES ($1, $2, $3)",
                op(OperationKind::Upsert, "test"),
            ),
            ("update test set a = 1", op(OperationKind::Update, "test")),
            ("DELETE FROM sessions WHERE id=$1", op(OperationKind::Delete, "sessions")),
            ("call procedure", op(OperationKind::Call, "procedure")),
            ("call procedure(1, 2)", op(OperationKind::Call, "procedure")),
            ("exec procedure", op(OperationKind::Exec, "procedure")),
            ("execute procedure", op(OperationKind::Execute, "procedure")),
            ("unknown from users", op(OperationKind::Unknown, "unknown")),
        ];

        for (stmt, want) in cases {
            let p = Parser::new();
            assert_eq!(p.parse(stmt), want, "stmt: {stmt}");
        }
    }

    #[test]
    fn parse_cte_resolves_outer_statement() {
        let p = Parser::new();

        assert_eq!(
            p.parse("WITH q AS (SELECT id FROM a) INSERT INTO b SELECT * FROM q"),
            op(OperationKind::Insert, "b"),
        );

        assert_eq!(
            p.parse("WITH q(number) as (values (1),(2),(3)) SELECT * from q"),
            op(OperationKind::Select, "q"),
        );
    }

    #[test]
    fn parse_multiline_and_case() {
        let p = Parser::new();

        assert_eq!(
            p.parse("SELECT id\nFROM\nusers\nWHERE id=$1"),
            op(OperationKind::Select, "users"),
        );
    }

    #[test]
    fn parse_unicode_delimiters() {
        let p = Parser::new();

        let stmt = "WITH\u{0085}q1\u{1680}AS(SELECT id, name FROM users)INSERT\u{2000}INTO users(id, name)VALUES(q1.id, q1.name)";
        assert_eq!(p.parse(stmt), op(OperationKind::Insert, "users"));
    }

    #[test]
    fn parse_is_cached() {
        let p = Parser::new();
        let want = op(OperationKind::Select, "users");

        assert_eq!(p.parse("SELECT id, name, phone FROM users WHERE id=$1"), want);
        assert_eq!(p.parse("SELECT id, name, phone FROM users WHERE id=$1"), want);
        assert_eq!(p.cache.read().unwrap().len(), 1);
    }

    #[test]
    fn parse_is_idempotent_over_normalization() {
        let p = Parser::new();

        let raw = "  SELECT id\nFROM users  ";
        let normalized = normalize(raw);

        assert_eq!(p.parse(raw), p.parse(&normalized));
        // Both spell the same cache entry.
        assert_eq!(p.cache.read().unwrap().len(), 1);
    }

    #[test]
    fn tokenize_depth_zero_only() {
        assert_eq!(
            tokenize("insert into users(id, name)values($1, $2)"),
            vec!["insert", "into", "users", "values"],
        );
        assert_eq!(tokenize("(select 1)"), Vec::<&str>::new());
        assert_eq!(tokenize(") stray select"), vec!["stray", "select"]);
    }
}
