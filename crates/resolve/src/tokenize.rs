//! Tokenizers for patterns, call expressions and command lines.

/// Escape separator for hex-encoded bytes in literal text (`~41` is `A`).
pub const ESCAPE: char = '~';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Text outside any `${...}`. `encoded` when it contains the escape separator.
    Literal { text: String, encoded: bool },
    /// Content between the outermost `${` and its matching `}`.
    Pattern(String),
}

impl Token {
    fn literal(text: String) -> Self {
        let encoded = text.contains(ESCAPE);
        Token::Literal { text, encoded }
    }

    /// Literal text with escapes decoded; patterns come back as written.
    pub fn decoded(&self) -> String {
        match self {
            Token::Literal { text, encoded: true } => decode_escapes(text),
            Token::Literal { text, encoded: false } => text.clone(),
            Token::Pattern(body) => format!("${{{}}}", body),
        }
    }
}

/// Split a pattern into literal and `${...}` tokens, left to right.
///
/// Nested `${...}` stay inside their enclosing pattern token. An unterminated `${` is kept as
/// literal text; escapes inside it are not decoded.
pub fn tokenize_pattern(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut body = String::new();
    let mut depth = 0usize;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            if depth > 0 { body.push_str("${"); }
            depth += 1;
            continue;
        }
        match (c, depth) {
            (_, 0) => literal.push(c),
            ('}', 1) => {
                depth = 0;
                if !literal.is_empty() { tokens.push(Token::literal(std::mem::take(&mut literal))); }
                tokens.push(Token::Pattern(std::mem::take(&mut body)));
            }
            ('}', _) => {
                depth -= 1;
                body.push(c);
            }
            _ => body.push(c),
        }
    }
    if depth == 0 {
        if !literal.is_empty() { tokens.push(Token::literal(literal)); }
        return tokens;
    }
    let raw = format!("${{{}", body);
    if literal.contains(ESCAPE) {
        tokens.push(Token::literal(literal));
        tokens.push(Token::Literal { text: raw, encoded: false });
    } else {
        literal.push_str(&raw);
        tokens.push(Token::Literal { text: literal, encoded: false });
    }
    tokens
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Replace `~XX` with the byte `0xXX`. Malformed escapes stay as written.
pub fn decode_escapes(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ESCAPE as u8 && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `name(arg,...)` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub name: String,
    pub args: Vec<String>,
}

/// Parse `name(arg1,arg2,...)`. Commas inside nested `${...}` do not split arguments.
/// Arguments are trimmed; `name()` has no arguments and a trailing comma adds an empty one.
pub fn parse_call(input: &str) -> Option<Call> {
    let input = input.trim();
    let open = input.find('(')?;
    if !input.ends_with(')') { return None; }
    let name = input[..open].trim();
    if name.is_empty() { return None; }
    let inner = &input[open + 1..input.len() - 1];
    let mut args = Vec::new();
    if inner.trim().is_empty() {
        return Some(Call { name: name.to_string(), args });
    }
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                depth += 1;
                current.push_str("${");
            }
            '}' if depth > 0 => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => args.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    args.push(current.trim().to_string());
    Some(Call { name: name.to_string(), args })
}

/// Split a command line on whitespace outside double quotes. Quotes are dropped.
pub fn split_command_line(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token { args.push(current); }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_literals_and_patterns() {
        let toks = tokenize_pattern("http://${builtin.nav-url}/x/${var.a}");
        assert_eq!(toks, vec![
            Token::Literal { text: "http://".into(), encoded: false },
            Token::Pattern("builtin.nav-url".into()),
            Token::Literal { text: "/x/".into(), encoded: false },
            Token::Pattern("var.a".into()),
        ]);
    }

    #[test]
    fn nested_patterns_stay_whole() {
        let toks = tokenize_pattern("${func.podlist(${resource.metadata.namespace},${var.n})}!");
        assert_eq!(toks[0], Token::Pattern("func.podlist(${resource.metadata.namespace},${var.n})".into()));
        assert_eq!(toks[1].decoded(), "!");
    }

    #[test]
    fn unterminated_pattern_is_literal() {
        assert_eq!(tokenize_pattern("a${var.x"), vec![Token::Literal { text: "a${var.x".into(), encoded: false }]);
        assert_eq!(tokenize_pattern("a}b"), vec![Token::Literal { text: "a}b".into(), encoded: false }]);
        assert_eq!(tokenize_pattern("${var.a~41"), vec![Token::Literal { text: "${var.a~41".into(), encoded: false }]);
        let decoded: String = tokenize_pattern("x~41${var.a~41").iter().map(Token::decoded).collect();
        assert_eq!(decoded, "xA${var.a~41");
        let decoded: String = tokenize_pattern("~41${a}b${c").iter().map(Token::decoded).collect();
        assert_eq!(decoded, "A${a}b${c");
    }

    #[test]
    fn hex_escapes_decode_best_effort() {
        assert_eq!(decode_escapes("a~41b"), "aAb");
        assert_eq!(decode_escapes("a~4"), "a~4");
        assert_eq!(decode_escapes("~zz~20x"), "~zz x");
        assert_eq!(decode_escapes("~"), "~");
        let toks = tokenize_pattern("a~41b");
        assert_eq!(toks, vec![Token::Literal { text: "a~41b".into(), encoded: true }]);
        assert_eq!(toks[0].decoded(), "aAb");
    }

    #[test]
    fn calls_split_on_top_level_commas() {
        assert_eq!(parse_call("podlist()"), Some(Call { name: "podlist".into(), args: vec![] }));
        let call = parse_call("f(${func.g(a,b)}, c)").expect("call");
        assert_eq!(call.args, vec!["${func.g(a,b)}".to_string(), "c".to_string()]);
        assert_eq!(parse_call("f(a,)").map(|c| c.args), Some(vec!["a".to_string(), String::new()]));
        assert!(parse_call("f(a").is_none());
        assert!(parse_call("noparens").is_none());
        assert!(parse_call("(a)").is_none());
    }

    #[test]
    fn command_lines_strip_quotes() {
        assert_eq!(split_command_line(r#"get pods -l "app=a b"  -o json"#), vec!["get", "pods", "-l", "app=a b", "-o", "json"]);
        assert_eq!(split_command_line(r#"echo "" x"#), vec!["echo", "", "x"]);
        assert_eq!(split_command_line("a\"b c\"d"), vec!["ab cd"]);
        assert!(split_command_line("   ").is_empty());
    }
}
