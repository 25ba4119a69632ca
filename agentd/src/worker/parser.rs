//! Small recursive-descent parser for the pseudocode action embedded in a
//! worker tool's text output, e.g. `click("the File menu", 1, "left")`,
//! `type("hello", enter=true)`, `done()`, `fail()` (spec §4.7 step 2).

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub keyword: Option<String>,
    pub value: ArgValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAction {
    Done { return_value: Option<String> },
    Fail,
    DeviceIntent { verb: String, args: Vec<Arg> },
}

/// Scans `text` for the first well-formed `identifier(args)` call and
/// parses it. Returns `None` if no call is found or it's malformed — the
/// caller (Worker) degrades to a `wait(1s)` action in that case.
pub fn parse_pseudocode(text: &str) -> Option<ParsedAction> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if is_ident_start(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_ident_char(bytes[i]) {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'(' {
                let ident = &text[start..i];
                if let Some((args_str, end)) = extract_balanced_parens(text, i) {
                    if let Some(args) = parse_args(args_str) {
                        i = end;
                        return Some(build_parsed_action(ident, args));
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

fn build_parsed_action(ident: &str, args: Vec<Arg>) -> ParsedAction {
    match ident.to_ascii_lowercase().as_str() {
        "done" => ParsedAction::Done {
            return_value: args.into_iter().next().and_then(|a| match a.value {
                ArgValue::Str(s) => Some(s),
                _ => None,
            }),
        },
        "fail" => ParsedAction::Fail,
        other => ParsedAction::DeviceIntent {
            verb: other.to_string(),
            args,
        },
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Given the index of an opening `(`, returns the substring between the
/// matching `)` (exclusive) and the index just past it. Respects quoted
/// strings so a `)` inside a string literal doesn't terminate early.
fn extract_balanced_parens(text: &str, open_idx: usize) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut i = open_idx;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b'(' if !in_quotes => depth += 1,
            b')' if !in_quotes => {
                depth -= 1;
                if depth == 0 {
                    return Some((&text[open_idx + 1..i], i + 1));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Splits `args_str` on top-level commas (outside quotes) and parses each
/// as a positional or `keyword=value` argument.
fn parse_args(args_str: &str) -> Option<Vec<Arg>> {
    let trimmed = args_str.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0usize;
    let bytes = trimmed.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b'(' if !in_quotes => depth += 1,
            b')' if !in_quotes => depth -= 1,
            b',' if !in_quotes && depth == 0 => {
                parts.push(&trimmed[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&trimmed[start..]);

    parts.into_iter().map(str::trim).map(parse_one_arg).collect()
}

fn parse_one_arg(raw: &str) -> Option<Arg> {
    let (keyword, value_str) = match raw.split_once('=') {
        Some((k, v)) if is_valid_keyword(k.trim()) => (Some(k.trim().to_string()), v.trim()),
        _ => (None, raw),
    };
    let value = parse_value(value_str)?;
    Some(Arg { keyword, value })
}

fn is_valid_keyword(s: &str) -> bool {
    !s.is_empty() && s.bytes().next().is_some_and(is_ident_start) && s.bytes().all(is_ident_char)
}

fn parse_value(raw: &str) -> Option<ArgValue> {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Some(ArgValue::Str(raw[1..raw.len() - 1].to_string()));
    }
    match raw {
        "true" => return Some(ArgValue::Bool(true)),
        "false" => return Some(ArgValue::Bool(false)),
        _ => {}
    }
    raw.parse::<f64>().ok().map(ArgValue::Num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_click_with_positional_args() {
        let parsed = parse_pseudocode(r#"I'll click the menu. click("the File menu", 1, "left")"#).unwrap();
        match parsed {
            ParsedAction::DeviceIntent { verb, args } => {
                assert_eq!(verb, "click");
                assert_eq!(args[0].value, ArgValue::Str("the File menu".to_string()));
                assert_eq!(args[1].value, ArgValue::Num(1.0));
                assert_eq!(args[2].value, ArgValue::Str("left".to_string()));
            }
            other => panic!("expected DeviceIntent, got {other:?}"),
        }
    }

    #[test]
    fn parses_type_with_keyword_arg() {
        let parsed = parse_pseudocode(r#"type("hello", enter=true)"#).unwrap();
        match parsed {
            ParsedAction::DeviceIntent { verb, args } => {
                assert_eq!(verb, "type");
                assert_eq!(args[1].keyword.as_deref(), Some("enter"));
                assert_eq!(args[1].value, ArgValue::Bool(true));
            }
            other => panic!("expected DeviceIntent, got {other:?}"),
        }
    }

    #[test]
    fn parses_done_and_fail() {
        assert_eq!(parse_pseudocode("done()"), Some(ParsedAction::Done { return_value: None }));
        assert_eq!(parse_pseudocode("fail()"), Some(ParsedAction::Fail));
        assert_eq!(
            parse_pseudocode(r#"done("task finished")"#),
            Some(ParsedAction::Done {
                return_value: Some("task finished".to_string())
            })
        );
    }

    #[test]
    fn returns_none_for_unparseable_text() {
        assert_eq!(parse_pseudocode("I am thinking about what to do next."), None);
    }

    #[test]
    fn handles_commas_inside_quoted_strings() {
        let parsed = parse_pseudocode(r#"type("hello, world", enter=false)"#).unwrap();
        match parsed {
            ParsedAction::DeviceIntent { args, .. } => {
                assert_eq!(args[0].value, ArgValue::Str("hello, world".to_string()));
            }
            other => panic!("expected DeviceIntent, got {other:?}"),
        }
    }
}
