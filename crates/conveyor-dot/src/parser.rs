use std::collections::HashMap;

use winnow::ascii::multispace0;
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;
use crate::duration_serde::parse_duration_str;

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Strip line comments from the input: `//` anywhere outside a quoted
/// string, and `#` as the first non-whitespace character of a line.
/// Newlines are preserved so error line numbers stay correct.
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut i = 0;
    let mut at_line_start = true;

    while i < len {
        let b = bytes[i];
        if at_line_start && b == b'#' {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if i + 1 < len && b == b'/' && bytes[i + 1] == b'/' {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if b == b'"' {
            // quoted string — copy verbatim, honoring escapes
            out.push('"');
            i += 1;
            while i < len {
                if bytes[i] == b'\\' && i + 1 < len {
                    out.push(bytes[i] as char);
                    out.push(bytes[i + 1] as char);
                    i += 2;
                } else if bytes[i] == b'"' {
                    out.push('"');
                    i += 1;
                    break;
                } else {
                    out.push(bytes[i] as char);
                    i += 1;
                }
            }
            at_line_start = false;
            continue;
        }
        out.push(b as char);
        if b == b'\n' {
            at_line_start = true;
        } else if !b.is_ascii_whitespace() {
            at_line_start = false;
        }
        i += 1;
    }
    out
}

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Parse a dotted attribute key: identifier ( '.' identifier )*.
fn dotted_key(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    let mut s = first.to_string();
    for part in rest {
        s.push('.');
        s.push_str(part);
    }
    Ok(s)
}

/// Parse a double-quoted string with escape support for `\n`, `\t`, `\\`
/// and `\"`.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any.parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Classify a bare (unquoted) value token: boolean, duration, integer,
/// float, otherwise a plain string (e.g. `shape=Mdiamond`).
fn classify_bare_token(tok: &str) -> AttributeValue {
    match tok {
        "true" => return AttributeValue::Boolean(true),
        "false" => return AttributeValue::Boolean(false),
        _ => {}
    }
    if let Ok(d) = parse_duration_str(tok) {
        return AttributeValue::Duration(d);
    }
    if let Ok(i) = tok.parse::<i64>() {
        return AttributeValue::Integer(i);
    }
    if let Ok(f) = tok.parse::<f64>() {
        return AttributeValue::Float(f);
    }
    AttributeValue::String(tok.to_string())
}

/// Parse an attribute value: quoted string or bare token.
fn attr_value(input: &mut &str) -> ModalResult<AttributeValue> {
    if input.starts_with('<') {
        return Err(make_cut_error("HTML labels are not supported"));
    }
    if input.starts_with('"') {
        return quoted_string.map(AttributeValue::String).parse_next(input);
    }
    let tok = take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')
    })
    .parse_next(input)?;
    Ok(classify_bare_token(tok))
}

/// Parse a single attribute: key '=' value. Keys may be quoted (`"test.x"`)
/// or dotted identifiers (`verification.workdir`).
fn attr(input: &mut &str) -> ModalResult<(String, AttributeValue)> {
    let key = alt((quoted_string, dotted_key)).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)?;
    Ok((key, value))
}

/// Parse an attribute block: '[' attr ( ','? attr )* ']'
fn attr_block(input: &mut &str) -> ModalResult<HashMap<String, AttributeValue>> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = HashMap::new();
    if let Some(first) = opt(attr).parse_next(input)? {
        attrs.insert(first.0, first.1);
        loop {
            let _ = ws.parse_next(input)?;
            let _ = opt(alt((',', ';'))).parse_next(input)?;
            let _ = ws.parse_next(input)?;
            if let Some(a) = opt(attr).parse_next(input)? {
                attrs.insert(a.0, a.1);
            } else {
                break;
            }
        }
    }

    let _ = ws.parse_next(input)?;
    let _ = ']'.parse_next(input)?;
    Ok(attrs)
}

/// Intermediate representation of a parsed statement before merging.
enum Statement {
    GraphAttrs(HashMap<String, AttributeValue>),
    NodeDefaults(HashMap<String, AttributeValue>),
    EdgeDefaults(HashMap<String, AttributeValue>),
    Node(String, HashMap<String, AttributeValue>),
    Edge(Vec<String>, HashMap<String, AttributeValue>),
    GraphAttrDecl(String, AttributeValue),
}

/// Parse 'graph' '[' ... ']' ';'?
fn graph_attr_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("graph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::GraphAttrs(attrs))
}

/// Parse 'node' '[' ... ']' ';'?
fn node_defaults_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("node").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::NodeDefaults(attrs))
}

/// Parse 'edge' '[' ... ']' ';'?
fn edge_defaults_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("edge").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::EdgeDefaults(attrs))
}

/// Parse a node or edge statement. An edge statement starts with an
/// identifier followed by '->'.
fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Statement> {
    let first = identifier.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let arrow = opt(literal("->")).parse_next(input)?;
    if arrow.is_some() {
        // Edge statement — collect the chain
        let mut chain = vec![first.to_string()];
        let _ = ws.parse_next(input)?;
        let next = identifier
            .context(StrContext::Expected(StrContextValue::Description(
                "edge target identifier",
            )))
            .parse_next(input)?;
        chain.push(next.to_string());

        loop {
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_some() {
                let _ = ws.parse_next(input)?;
                let n = identifier
                    .context(StrContext::Expected(StrContextValue::Description(
                        "edge target identifier",
                    )))
                    .parse_next(input)?;
                chain.push(n.to_string());
            } else {
                break;
            }
        }

        let _ = ws.parse_next(input)?;
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Edge(chain, attrs));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(make_cut_error(
            "only directed edges (->); undirected edges (--) are not supported",
        ));
    }

    let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
    let _ = ws.parse_next(input)?;

    if !attrs.is_empty() {
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Node(first.to_string(), attrs));
    }

    // Bare `key = value` is a graph-level attribute declaration.
    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::GraphAttrDecl(first.to_string(), val));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Node(first.to_string(), attrs))
}

/// Parse a single statement.
fn statement(input: &mut &str) -> ModalResult<Statement> {
    let _ = ws.parse_next(input)?;
    if input.starts_with("subgraph") {
        return Err(make_cut_error("subgraphs are not supported"));
    }
    alt((
        graph_attr_stmt,
        node_defaults_stmt,
        edge_defaults_stmt,
        node_or_edge_stmt,
    ))
    .parse_next(input)
}

/// Parse zero or more statements.
fn statements(input: &mut &str) -> ModalResult<Vec<Statement>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        let stmt = statement.parse_next(input)?;
        stmts.push(stmt);
    }
    Ok(stmts)
}

/// Merge statements into the graph structure. Node and edge defaults apply
/// to declarations that follow them.
fn merge_statements(
    stmts: Vec<Statement>,
) -> (
    HashMap<String, AttributeValue>,
    HashMap<String, NodeDef>,
    Vec<EdgeDef>,
    HashMap<String, AttributeValue>,
    HashMap<String, AttributeValue>,
) {
    let mut graph_attrs = HashMap::new();
    let mut nodes: HashMap<String, NodeDef> = HashMap::new();
    let mut edges = Vec::new();
    let mut node_defaults: HashMap<String, AttributeValue> = HashMap::new();
    let mut edge_defaults: HashMap<String, AttributeValue> = HashMap::new();

    for stmt in stmts {
        match stmt {
            Statement::GraphAttrs(attrs) => {
                graph_attrs.extend(attrs);
            }
            Statement::NodeDefaults(attrs) => {
                node_defaults.extend(attrs);
            }
            Statement::EdgeDefaults(attrs) => {
                edge_defaults.extend(attrs);
            }
            Statement::Node(id, attrs) => {
                let entry = nodes.entry(id.clone()).or_insert_with(|| {
                    let mut na = HashMap::new();
                    for (k, v) in &node_defaults {
                        na.insert(k.clone(), v.clone());
                    }
                    NodeDef { id, attrs: na }
                });
                entry.attrs.extend(attrs);
            }
            Statement::Edge(chain, attrs) => {
                // Expand chained edges: A -> B -> C => (A,B), (B,C)
                for pair in chain.windows(2) {
                    let mut merged = edge_defaults.clone();
                    merged.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
                    edges.push(EdgeDef {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: merged,
                    });
                }
                // Nodes referenced only by edges still exist
                for node_id in &chain {
                    nodes.entry(node_id.clone()).or_insert_with(|| {
                        let mut na = HashMap::new();
                        for (k, v) in &node_defaults {
                            na.insert(k.clone(), v.clone());
                        }
                        NodeDef {
                            id: node_id.clone(),
                            attrs: na,
                        }
                    });
                }
            }
            Statement::GraphAttrDecl(key, val) => {
                graph_attrs.insert(key, val);
            }
        }
    }

    (graph_attrs, nodes, edges, node_defaults, edge_defaults)
}

/// Top-level parser: 'digraph' identifier '{' statements '}'.
fn parse_digraph(input: &mut &str) -> ModalResult<DotGraph> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(make_cut_error(
            "'digraph' keyword (strict graphs are not supported)",
        ));
    }
    if input.starts_with("graph") {
        let after = input["graph".len()..].trim_start();
        if after.starts_with('{') || after.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(make_cut_error(
                "'digraph' keyword (undirected graphs are not supported)",
            ));
        }
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = identifier
        .context(StrContext::Expected(StrContextValue::Description(
            "graph name identifier",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if !input.is_empty() {
        return Err(make_cut_error(
            "end of input (exactly one digraph per file)",
        ));
    }

    let (attrs, nodes, edges, node_defaults, edge_defaults) = merge_statements(stmts);

    Ok(DotGraph {
        name: name.to_string(),
        attrs,
        nodes,
        edges,
        node_defaults,
        edge_defaults,
    })
}

/// Compute (line, col) from the unconsumed suffix length.
fn offset_to_line_col(stripped: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = stripped.len() - remaining_len;
    let prefix = &stripped[..consumed.min(stripped.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

/// Public entry point.
pub fn parse(input: &str) -> conveyor_types::Result<DotGraph> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();

    parse_digraph.parse_next(&mut remaining).map_err(|e| {
        let (line, col) = offset_to_line_col(&stripped, remaining.len());
        let message = format!("{}", e);

        let snippet = remaining.chars().take(40).collect::<String>();
        let source_snippet = if snippet.is_empty() {
            None
        } else {
            Some(snippet)
        };

        conveyor_types::ConveyorError::Parse {
            line,
            col,
            message,
            source_snippet,
        }
    })
}
