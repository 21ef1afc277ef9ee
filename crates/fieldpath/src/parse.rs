//! Expression parser. Accepted forms:
//!
//! ```text
//! kind                                  bare dotted path
//! .metadata.name   {.metadata.name}     leading dot, optional braces, optional $
//! .spec.containers[*].name              wildcard (also .*)
//! ..name                                recursive descent
//! .spec.ports[0]  [1:3]  [0:10:2]  [-1] index / slice with negative wraparound
//! ['a','b']                             union of named keys
//! [?(@.status.phase=="Running")]        filter: == != < <= > >= or bare exists
//! {range .spec.containers[*]}{.name}{end}
//! ```

use crate::FieldPathError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Field(String),
    Union(Vec<String>),
    Wildcard,
    Descent,
    Index(i64),
    Slice { start: Option<i64>, end: Option<i64>, step: Option<i64> },
    Filter(Predicate),
    /// Re-invokes the inner expression once per element matched so far and
    /// concatenates the results. Always the last segment.
    Ranged(Vec<Segment>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Predicate {
    pub path: Vec<String>,
    pub op: PredOp,
    pub value: PredValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PredOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Exists,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PredValue {
    Str(String),
    Num(f64),
    Bool(bool),
    None,
}

fn perr(expr: &str, msg: impl Into<String>) -> FieldPathError {
    FieldPathError::Parse { expr: expr.to_string(), msg: msg.into() }
}

pub(crate) fn parse(expr: &str) -> Result<Vec<Segment>, FieldPathError> {
    let s = expr.trim();
    if s.is_empty() {
        return Err(perr(expr, "empty expression"));
    }
    if s.starts_with('{') {
        let chunks = brace_chunks(s, expr)?;
        if chunks.len() == 1 {
            return parse_body(&chunks[0], expr);
        }
        let first = chunks[0].trim();
        if let Some(range_of) = first.strip_prefix("range ") {
            if chunks.last().map(|c| c.trim()) != Some("end") {
                return Err(perr(expr, "range without matching {end}"));
            }
            if chunks.len() != 3 {
                return Err(perr(expr, "range expects exactly one body expression"));
            }
            let mut segs = parse_body(range_of, expr)?;
            segs.push(Segment::Ranged(parse_body(&chunks[1], expr)?));
            return Ok(segs);
        }
        return Err(perr(expr, "multiple template chunks without range"));
    }
    parse_body(s, expr)
}

/// Split `{a}{b}{c}` into its top-level chunks.
fn brace_chunks(s: &str, expr: &str) -> Result<Vec<String>, FieldPathError> {
    let mut chunks = Vec::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '{' {
            return Err(perr(expr, "expected '{'"));
        }
        let mut depth = 1usize;
        let mut j = i + 1;
        let mut quote: Option<char> = None;
        while j < chars.len() {
            let c = chars[j];
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => {}
                None => match c {
                    '\'' | '"' => quote = Some(c),
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                },
            }
            j += 1;
        }
        if depth != 0 {
            return Err(perr(expr, "unbalanced braces"));
        }
        chunks.push(chars[i + 1..j].iter().collect());
        i = j + 1;
    }
    if chunks.is_empty() {
        return Err(perr(expr, "empty expression"));
    }
    Ok(chunks)
}

fn is_ident_char(c: char) -> bool {
    !matches!(c, '.' | '[' | ']' | '{' | '}' | '*' | ' ')
}

fn parse_body(body: &str, expr: &str) -> Result<Vec<Segment>, FieldPathError> {
    let b = body.trim();
    let b = b.strip_prefix('$').unwrap_or(b);
    let chars: Vec<char> = b.chars().collect();
    let mut segs: Vec<Segment> = Vec::new();
    let mut i = 0usize;

    let read_ident = |i: &mut usize, chars: &[char]| -> String {
        let start = *i;
        while *i < chars.len() && is_ident_char(chars[*i]) {
            *i += 1;
        }
        chars[start..*i].iter().collect()
    };

    // Bare field paths start without a leading dot.
    if i < chars.len() && chars[i] != '.' && chars[i] != '[' {
        let ident = read_ident(&mut i, &chars);
        if ident.is_empty() {
            return Err(perr(expr, "expected field name"));
        }
        segs.push(Segment::Field(ident));
    }

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if i + 1 < chars.len() && chars[i + 1] == '.' {
                    segs.push(Segment::Descent);
                    i += 2;
                    if i < chars.len() && chars[i] == '*' {
                        segs.push(Segment::Wildcard);
                        i += 1;
                    } else if i < chars.len() && is_ident_char(chars[i]) {
                        let ident = read_ident(&mut i, &chars);
                        segs.push(Segment::Field(ident));
                    }
                    // a following '[' is handled by the main loop
                } else {
                    i += 1;
                    if i < chars.len() && chars[i] == '*' {
                        segs.push(Segment::Wildcard);
                        i += 1;
                    } else {
                        let ident = read_ident(&mut i, &chars);
                        if ident.is_empty() {
                            return Err(perr(expr, "expected field name after '.'"));
                        }
                        segs.push(Segment::Field(ident));
                    }
                }
            }
            '[' => {
                let mut j = i + 1;
                let mut quote: Option<char> = None;
                while j < chars.len() {
                    let c = chars[j];
                    match quote {
                        Some(q) if c == q => quote = None,
                        Some(_) => {}
                        None if c == '\'' || c == '"' => quote = Some(c),
                        None if c == ']' => break,
                        None => {}
                    }
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(perr(expr, "unterminated '['"));
                }
                let content: String = chars[i + 1..j].iter().collect();
                segs.push(parse_bracket(content.trim(), expr)?);
                i = j + 1;
            }
            c => return Err(perr(expr, format!("unexpected character {:?}", c))),
        }
    }
    if segs.is_empty() {
        return Err(perr(expr, "empty expression"));
    }
    Ok(segs)
}

fn parse_bracket(content: &str, expr: &str) -> Result<Segment, FieldPathError> {
    if content.is_empty() {
        return Err(perr(expr, "empty brackets"));
    }
    if content == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(rest) = content.strip_prefix('?') {
        let inner = rest
            .trim()
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(|| perr(expr, "filter must be ?(...)"))?;
        return Ok(Segment::Filter(parse_predicate(inner.trim(), expr)?));
    }
    if content.starts_with('\'') || content.starts_with('"') {
        let mut names = Vec::new();
        for part in content.split(',') {
            let part = part.trim();
            let unquoted = part
                .strip_prefix('\'')
                .and_then(|p| p.strip_suffix('\''))
                .or_else(|| part.strip_prefix('"').and_then(|p| p.strip_suffix('"')))
                .ok_or_else(|| perr(expr, format!("bad quoted key {:?}", part)))?;
            names.push(unquoted.to_string());
        }
        return Ok(Segment::Union(names));
    }
    if content.contains(':') {
        let parts: Vec<&str> = content.split(':').collect();
        if parts.len() > 3 {
            return Err(perr(expr, "slice takes at most start:end:step"));
        }
        let edge = |s: &str| -> Result<Option<i64>, FieldPathError> {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<i64>().map(Some).map_err(|_| perr(expr, format!("bad slice bound {:?}", s)))
        };
        return Ok(Segment::Slice {
            start: edge(parts[0])?,
            end: edge(parts.get(1).copied().unwrap_or(""))?,
            step: edge(parts.get(2).copied().unwrap_or(""))?,
        });
    }
    content
        .parse::<i64>()
        .map(Segment::Index)
        .map_err(|_| perr(expr, format!("bad bracket content {:?}", content)))
}

fn parse_predicate(s: &str, expr: &str) -> Result<Predicate, FieldPathError> {
    // Find the first operator outside quotes.
    const OPS: [(&str, PredOp); 6] = [
        ("==", PredOp::Eq),
        ("!=", PredOp::Ne),
        ("<=", PredOp::Le),
        (">=", PredOp::Ge),
        ("<", PredOp::Lt),
        (">", PredOp::Gt),
    ];
    let mut split: Option<(usize, &str, PredOp)> = None;
    let chars: Vec<char> = s.chars().collect();
    let mut quote: Option<char> = None;
    let mut i = 0;
    'outer: while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {
                let rest: String = chars[i..].iter().collect();
                for (tok, op) in OPS {
                    if rest.starts_with(tok) {
                        split = Some((i, tok, op));
                        break 'outer;
                    }
                }
            }
        }
        i += 1;
    }
    let (lhs, op, rhs) = match split {
        Some((at, tok, op)) => {
            let lhs: String = chars[..at].iter().collect();
            let rhs: String = chars[at + tok.len()..].iter().collect();
            (lhs.trim().to_string(), op, rhs.trim().to_string())
        }
        None => (s.trim().to_string(), PredOp::Exists, String::new()),
    };
    let path_str = lhs
        .strip_prefix('@')
        .ok_or_else(|| perr(expr, "filter lhs must start with '@'"))?
        .trim_start_matches('.');
    let path: Vec<String> = path_str.split('.').filter(|p| !p.is_empty()).map(str::to_string).collect();
    if path.is_empty() {
        return Err(perr(expr, "filter lhs selects nothing"));
    }
    let value = if op == PredOp::Exists {
        PredValue::None
    } else if let Some(v) = rhs
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| rhs.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
    {
        PredValue::Str(v.to_string())
    } else if rhs == "true" || rhs == "false" {
        PredValue::Bool(rhs == "true")
    } else {
        PredValue::Num(rhs.parse::<f64>().map_err(|_| perr(expr, format!("bad filter literal {:?}", rhs)))?)
    };
    Ok(Predicate { path, op, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths() {
        assert_eq!(
            parse("metadata.labels.name").unwrap(),
            vec![
                Segment::Field("metadata".into()),
                Segment::Field("labels".into()),
                Segment::Field("name".into())
            ]
        );
        assert_eq!(parse(".kind").unwrap(), vec![Segment::Field("kind".into())]);
        assert_eq!(parse("{.kind}").unwrap(), vec![Segment::Field("kind".into())]);
        assert_eq!(parse("$.kind").unwrap(), vec![Segment::Field("kind".into())]);
    }

    #[test]
    fn wildcard_and_descent() {
        assert_eq!(
            parse(".spec.containers[*].name").unwrap(),
            vec![
                Segment::Field("spec".into()),
                Segment::Field("containers".into()),
                Segment::Wildcard,
                Segment::Field("name".into())
            ]
        );
        assert_eq!(parse("..name").unwrap(), vec![Segment::Descent, Segment::Field("name".into())]);
        assert_eq!(parse(".spec.*").unwrap(), vec![Segment::Field("spec".into()), Segment::Wildcard]);
    }

    #[test]
    fn brackets() {
        assert_eq!(parse("[0]").unwrap(), vec![Segment::Index(0)]);
        assert_eq!(parse("[-1]").unwrap(), vec![Segment::Index(-1)]);
        assert_eq!(
            parse("[1:3]").unwrap(),
            vec![Segment::Slice { start: Some(1), end: Some(3), step: None }]
        );
        assert_eq!(
            parse("[::2]").unwrap(),
            vec![Segment::Slice { start: None, end: None, step: Some(2) }]
        );
        assert_eq!(
            parse("['a','b']").unwrap(),
            vec![Segment::Union(vec!["a".into(), "b".into()])]
        );
    }

    #[test]
    fn filters() {
        let segs = parse("[?(@.status.phase==\"Running\")]").unwrap();
        assert_eq!(
            segs,
            vec![Segment::Filter(Predicate {
                path: vec!["status".into(), "phase".into()],
                op: PredOp::Eq,
                value: PredValue::Str("Running".into())
            })]
        );
        let segs = parse("[?(@.spec.replicas>=2)]").unwrap();
        assert_eq!(
            segs,
            vec![Segment::Filter(Predicate {
                path: vec!["spec".into(), "replicas".into()],
                op: PredOp::Ge,
                value: PredValue::Num(2.0)
            })]
        );
        let segs = parse("[?(@.metadata.deletionTimestamp)]").unwrap();
        assert_eq!(
            segs,
            vec![Segment::Filter(Predicate {
                path: vec!["metadata".into(), "deletionTimestamp".into()],
                op: PredOp::Exists,
                value: PredValue::None
            })]
        );
    }

    #[test]
    fn range_form() {
        let segs = parse("{range .spec.containers[*]}{.name}{end}").unwrap();
        assert_eq!(
            segs,
            vec![
                Segment::Field("spec".into()),
                Segment::Field("containers".into()),
                Segment::Wildcard,
                Segment::Ranged(vec![Segment::Field("name".into())])
            ]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("{range .a}{.b}").is_err());
        assert!(parse("[1:2:3:4]").is_err());
        assert!(parse(".spec.[").is_err());
        assert!(parse("[?(status==1)]").is_err());
    }
}
