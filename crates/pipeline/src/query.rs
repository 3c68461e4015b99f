//! Classification of `QUERY` event statements.
//!
//! Only the leading keywords and table names of a statement matter to the
//! pipeline, so statements are tokenized rather than parsed: identifiers
//! (plain or backquoted), `.`-qualification and punctuation are kept, string
//! literals and comments are dropped.

use mysql_types::FullTableName;

/// A possibly namespace-qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub namespace: Option<String>,
    pub table: String,
}

impl TableRef {
    /// Qualify with `default_namespace` when the statement did not.
    pub fn resolve(&self, default_namespace: &str) -> FullTableName {
        FullTableName::new(
            self.namespace.as_deref().unwrap_or(default_namespace),
            self.table.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableDdl {
    Create(TableRef),
    Alter(TableRef),
    Drop(Vec<TableRef>),
    /// `(from, to)` pairs.
    Rename(Vec<(TableRef, TableRef)>),
    Truncate(TableRef),
}

impl TableDdl {
    pub fn verb(&self) -> &'static str {
        match self {
            TableDdl::Create(_) => "create",
            TableDdl::Alter(_) => "alter",
            TableDdl::Drop(_) => "drop",
            TableDdl::Rename(_) => "rename",
            TableDdl::Truncate(_) => "truncate",
        }
    }

    /// Every table named by the statement.
    pub fn tables(&self) -> Vec<&TableRef> {
        match self {
            TableDdl::Create(t) | TableDdl::Alter(t) | TableDdl::Truncate(t) => vec![t],
            TableDdl::Drop(tables) => tables.iter().collect(),
            TableDdl::Rename(pairs) => pairs.iter().flat_map(|(a, b)| [a, b]).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Begin,
    Commit,
    Rollback,
    /// Heartbeat `DROP VIEW` written by pseudo-GTID injectors.
    PseudoGtid,
    Table(TableDdl),
    View,
    Analyze,
    /// Names a table but its name could not be extracted.
    Unparseable,
    Other,
}

pub fn classify(sql: &str) -> QueryKind {
    let tokens = tokenize(sql);
    let Some(first) = tokens.first() else {
        return QueryKind::Other;
    };

    if first.is_word("begin") || (first.is_word("start") && word_at(&tokens, 1, "transaction"))
    {
        return QueryKind::Begin;
    }
    if first.is_word("commit") {
        return QueryKind::Commit;
    }
    if first.is_word("rollback") && !word_at(&tokens, 1, "to") {
        return QueryKind::Rollback;
    }
    if first.is_word("analyze") {
        return QueryKind::Analyze;
    }
    if first.is_word("drop") && sql.to_ascii_lowercase().contains("pseudo_gtid") {
        return QueryKind::PseudoGtid;
    }

    let result = if first.is_word("create") {
        classify_create(&tokens)
    } else if first.is_word("alter") {
        classify_alter(&tokens)
    } else if first.is_word("drop") {
        classify_drop(&tokens)
    } else if first.is_word("rename") {
        classify_rename(&tokens)
    } else if first.is_word("truncate") {
        classify_truncate(&tokens)
    } else {
        Some(QueryKind::Other)
    };
    result.unwrap_or(QueryKind::Unparseable)
}

const OBJECT_KEYWORDS: &[&str] = &[
    "table",
    "view",
    "index",
    "database",
    "schema",
    "trigger",
    "procedure",
    "function",
    "event",
    "user",
    "role",
    "server",
    "tablespace",
    "logfile",
];

/// Index of the object keyword after a leading verb, skipping modifiers like
/// `TEMPORARY`, `OR REPLACE` or `DEFINER = ...`.
fn object_keyword(tokens: &[Token]) -> Option<(usize, &str)> {
    tokens.iter().enumerate().skip(1).find_map(|(i, token)| match token {
        Token::Word(w) => OBJECT_KEYWORDS
            .iter()
            .find(|k| w.eq_ignore_ascii_case(k))
            .map(|k| (i, *k)),
        _ => None,
    })
}

fn classify_create(tokens: &[Token]) -> Option<QueryKind> {
    match object_keyword(tokens) {
        Some((i, "table")) => {
            let i = skip_words(tokens, i + 1, &["if", "not", "exists"]);
            let (name, _) = parse_name(tokens, i)?;
            Some(QueryKind::Table(TableDdl::Create(name)))
        }
        Some((_, "view")) => Some(QueryKind::View),
        Some((i, "index")) => index_target(tokens, i).map(|t| QueryKind::Table(TableDdl::Alter(t))),
        _ => Some(QueryKind::Other),
    }
}

fn classify_alter(tokens: &[Token]) -> Option<QueryKind> {
    match object_keyword(tokens) {
        Some((i, "table")) => {
            let (name, next) = parse_name(tokens, i + 1)?;
            // ALTER TABLE a RENAME [TO|AS] b
            let renamed = (next..tokens.len())
                .find(|&j| tokens[j].is_word("rename"))
                .map(|j| skip_words(tokens, j + 1, &["to", "as"]))
                .filter(|&j| {
                    !tokens
                        .get(j)
                        .is_some_and(|t| t.is_word("column") || t.is_word("index") || t.is_word("key"))
                })
                .and_then(|j| parse_name(tokens, j));
            match renamed {
                Some((to, _)) => Some(QueryKind::Table(TableDdl::Rename(vec![(name, to)]))),
                None => Some(QueryKind::Table(TableDdl::Alter(name))),
            }
        }
        Some((_, "view")) => Some(QueryKind::View),
        _ => Some(QueryKind::Other),
    }
}

fn classify_drop(tokens: &[Token]) -> Option<QueryKind> {
    match object_keyword(tokens) {
        Some((i, "table")) => {
            let mut i = skip_words(tokens, i + 1, &["if", "exists"]);
            let mut tables = Vec::new();
            loop {
                let (name, next) = parse_name(tokens, i)?;
                tables.push(name);
                if tokens.get(next) == Some(&Token::Symbol(',')) {
                    i = next + 1;
                } else {
                    break;
                }
            }
            Some(QueryKind::Table(TableDdl::Drop(tables)))
        }
        Some((_, "view")) => Some(QueryKind::View),
        Some((i, "index")) => index_target(tokens, i).map(|t| QueryKind::Table(TableDdl::Alter(t))),
        _ => Some(QueryKind::Other),
    }
}

fn classify_rename(tokens: &[Token]) -> Option<QueryKind> {
    if !word_at(tokens, 1, "table") {
        return Some(QueryKind::Other);
    }
    let mut i = 2;
    let mut pairs = Vec::new();
    loop {
        let (from, next) = parse_name(tokens, i)?;
        if !word_at(tokens, next, "to") {
            return None;
        }
        let (to, next) = parse_name(tokens, next + 1)?;
        pairs.push((from, to));
        if tokens.get(next) == Some(&Token::Symbol(',')) {
            i = next + 1;
        } else {
            break;
        }
    }
    Some(QueryKind::Table(TableDdl::Rename(pairs)))
}

fn classify_truncate(tokens: &[Token]) -> Option<QueryKind> {
    let i = skip_words(tokens, 1, &["table"]);
    let (name, _) = parse_name(tokens, i)?;
    Some(QueryKind::Table(TableDdl::Truncate(name)))
}

/// `... INDEX name ON table`.
fn index_target(tokens: &[Token], index_kw: usize) -> Option<TableRef> {
    let on = (index_kw + 1..tokens.len()).find(|&j| tokens[j].is_word("on"))?;
    parse_name(tokens, on + 1).map(|(name, _)| name)
}

fn parse_name(tokens: &[Token], i: usize) -> Option<(TableRef, usize)> {
    let first = tokens.get(i)?.identifier()?;
    if tokens.get(i + 1) == Some(&Token::Symbol('.')) {
        let second = tokens.get(i + 2)?.identifier()?;
        return Some((
            TableRef {
                namespace: Some(first.to_string()),
                table: second.to_string(),
            },
            i + 3,
        ));
    }
    Some((
        TableRef {
            namespace: None,
            table: first.to_string(),
        },
        i + 1,
    ))
}

fn skip_words(tokens: &[Token], mut i: usize, words: &[&str]) -> usize {
    while tokens
        .get(i)
        .is_some_and(|t| words.iter().any(|w| t.is_word(w)))
    {
        i += 1;
    }
    i
}

fn word_at(tokens: &[Token], i: usize, word: &str) -> bool {
    tokens.get(i).is_some_and(|t| t.is_word(word))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Symbol(char),
    Literal,
}

impl Token {
    fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(word))
    }

    fn identifier(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '/' {
            chars.next();
            if chars.peek() == Some(&'*') {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            } else {
                tokens.push(Token::Symbol('/'));
            }
        } else if c == '#' {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
        } else if c == '-' {
            chars.next();
            if chars.peek() == Some(&'-') {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                tokens.push(Token::Symbol('-'));
            }
        } else if c == '`' {
            chars.next();
            let mut ident = String::new();
            while let Some(c) = chars.next() {
                if c == '`' {
                    if chars.peek() == Some(&'`') {
                        ident.push('`');
                        chars.next();
                    } else {
                        break;
                    }
                } else {
                    ident.push(c);
                }
            }
            tokens.push(Token::Quoted(ident));
        } else if c == '\'' || c == '"' {
            let quote = c;
            chars.next();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    if chars.peek() == Some(&quote) {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            tokens.push(Token::Literal);
        } else if c.is_alphanumeric() || c == '_' || c == '$' {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' || c == '$' {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else {
            tokens.push(Token::Symbol(c));
            chars.next();
        }
    }
    tokens
}
