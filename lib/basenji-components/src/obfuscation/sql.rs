//! SQL query obfuscation.

use super::sql_tokenizer::{SqlTokenizer, TokenKind, TokenizeError};

/// Resource set on spans whose SQL query could not be tokenized.
pub const NON_PARSABLE_SQL: &str = "Non-parsable SQL query";

const LITERAL_PLACEHOLDER: &str = "?";

/// Obfuscates a SQL query.
///
/// Literals and bind arguments are replaced with `?`, comments are dropped, and lists of placeholders such as
/// `IN (1, 2, 3)` or `VALUES (1, 'a'), (2, 'b')` collapse to a single group. Tokens are re-joined with single spaces
/// (no space before a comma), which makes the output a fixed point: obfuscating it again yields the same string.
///
/// # Errors
///
/// If the query cannot be tokenized, or holds nothing but comments, an error is returned.
pub fn obfuscate_sql_string(query: &str) -> Result<String, TokenizeError> {
    let mut tokenizer = SqlTokenizer::new(query);
    let mut tokens: Vec<&str> = Vec::new();

    while let Some(token) = tokenizer.scan()? {
        let text = match token.kind {
            TokenKind::Comment => continue,
            TokenKind::String
            | TokenKind::Number
            | TokenKind::BooleanLiteral
            | TokenKind::Null
            | TokenKind::ValueArg => LITERAL_PLACEHOLDER,
            TokenKind::Id | TokenKind::QuotedId | TokenKind::Operator | TokenKind::Char => token.text,
        };
        tokens.push(text);
        group_placeholders(&mut tokens);
    }

    if tokens.is_empty() {
        return Ok(String::new());
    }

    let mut output = String::with_capacity(query.len());
    for token in tokens {
        if !output.is_empty() && token != "," {
            output.push(' ');
        }
        output.push_str(token);
    }
    Ok(output)
}

/// Collapses `? , ?` into `?` and `( ? ) , ( ? )` into `( ? )` at the tail of `tokens`.
fn group_placeholders(tokens: &mut Vec<&str>) {
    const LIST: &[&str] = &["?", ",", "?"];
    const GROUPS: &[&str] = &["(", "?", ")", ",", "(", "?", ")"];

    if tokens.ends_with(LIST) {
        tokens.truncate(tokens.len() - 2);
    } else if tokens.ends_with(GROUPS) {
        tokens.truncate(tokens.len() - 4);
    }
}
