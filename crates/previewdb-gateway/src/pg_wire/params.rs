//! Bind parameter handling
//!
//! Statements reach the stores as plain text, so bound values are decoded to
//! their text form and inlined as SQL literals in place of `$n`.

use crate::errors::{self, ClassifiedError};
use crate::federation::quote_literal;

/// Type OIDs whose text form may be inlined without quotes
const NUMERIC_OIDS: &[u32] = &[20, 21, 23, 26, 700, 701, 1700];

/// Wire format of a bound value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Format {
    Text,
    Binary,
}

impl Format {
    pub fn from_code(code: i16) -> Result<Self, ClassifiedError> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(errors::protocol_violation(format!(
                "invalid format code: {}",
                other
            ))),
        }
    }
}

/// Format of the `index`-th value given Bind's format code list: none means
/// all text, one applies to every value, otherwise one per value
pub(crate) fn format_for(formats: &[Format], index: usize) -> Format {
    match formats {
        [] => Format::Text,
        [only] => *only,
        many => many.get(index).copied().unwrap_or(Format::Text),
    }
}

/// Text form of one bound value
pub(crate) fn decode_value(
    index: usize,
    raw: &[u8],
    format: Format,
    type_oid: u32,
) -> Result<String, ClassifiedError> {
    let invalid = |reason: &str| errors::invalid_parameter(index, reason);

    if format == Format::Text {
        return String::from_utf8(raw.to_vec()).map_err(|_| invalid("not valid UTF-8"));
    }

    let text = match type_oid {
        16 => (fixed::<1>(index, raw)?[0] != 0).to_string(),
        21 => i16::from_be_bytes(fixed(index, raw)?).to_string(),
        23 => i32::from_be_bytes(fixed(index, raw)?).to_string(),
        26 => u32::from_be_bytes(fixed(index, raw)?).to_string(),
        20 => i64::from_be_bytes(fixed(index, raw)?).to_string(),
        700 => {
            let value = f32::from_be_bytes(fixed(index, raw)?);
            float_text(value.into(), value.to_string())
        }
        701 => {
            let value = f64::from_be_bytes(fixed(index, raw)?);
            float_text(value, value.to_string())
        }
        // text, varchar, bpchar, name, json
        25 | 1043 | 1042 | 19 | 114 => {
            String::from_utf8(raw.to_vec()).map_err(|_| invalid("not valid UTF-8"))?
        }
        3802 => match raw.split_first() {
            Some((1, json)) => {
                String::from_utf8(json.to_vec()).map_err(|_| invalid("not valid UTF-8"))?
            }
            _ => return Err(invalid("unsupported jsonb version")),
        },
        2950 => uuid_text(&fixed::<16>(index, raw)?),
        other => {
            return Err(errors::binary_format_unsupported(&format!(
                "parameter ${} (type oid {})",
                index + 1,
                other
            )))
        }
    };
    Ok(text)
}

fn fixed<const N: usize>(index: usize, raw: &[u8]) -> Result<[u8; N], ClassifiedError> {
    raw.try_into().map_err(|_| {
        errors::invalid_parameter(index, &format!("expected {} bytes, got {}", N, raw.len()))
    })
}

/// PostgreSQL spelling of the special values
fn float_text(value: f64, shortest: String) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        shortest
    }
}

fn uuid_text(raw: &[u8]) -> String {
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// SQL literal for a bound value of the given type (0 when unknown)
pub(crate) fn render_literal(value: Option<&str>, type_oid: u32) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) if NUMERIC_OIDS.contains(&type_oid) && is_plain_number(v) => {
            // Parenthesized so `x-$1` never becomes a comment
            if v.starts_with('-') {
                format!("({})", v)
            } else {
                v.to_string()
            }
        }
        Some(v) => quote_literal(v),
    }
}

fn is_plain_number(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
        && value.parse::<f64>().is_ok()
}

/// Replace `$n` placeholders outside string literals, quoted identifiers,
/// dollar-quoted bodies and comments
///
/// Fails when a placeholder has no bound value.
pub(crate) fn substitute_parameters(sql: &str, literals: &[String]) -> Result<String, ClassifiedError> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                let escapes = i > 0 && matches!(bytes[i - 1], b'E' | b'e');
                i = skip_quoted(bytes, i, b'\'', escapes);
            }
            b'"' => i = skip_quoted(bytes, i, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' if i > 0 && is_ident_byte(bytes[i - 1]) => i += 1,
            b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if digits > 0 {
                    let end = i + 1 + digits;
                    let position: usize = sql[i + 1..end].parse().unwrap_or(0);
                    let literal = position
                        .checked_sub(1)
                        .and_then(|p| literals.get(p))
                        .ok_or_else(|| {
                            errors::protocol_violation(format!(
                                "bind message supplies {} parameters, but the statement references ${}",
                                literals.len(),
                                position
                            ))
                        })?;
                    out.push_str(&sql[copied..i]);
                    out.push_str(literal);
                    copied = end;
                    i = end;
                } else {
                    i = skip_dollar_quoted(bytes, i);
                }
            }
            _ => i += 1,
        }
    }

    out.push_str(&sql[copied..]);
    Ok(out)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// Index just past the closing quote; a doubled quote does not close
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if backslash_escapes => i += 2,
            b if b == quote => {
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Block comments nest
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// `$tag$ ... $tag$`; a lone `$` is skipped
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let tag_len = bytes[start + 1..]
        .iter()
        .take_while(|&&b| is_ident_byte(b))
        .count();
    let close = start + 1 + tag_len;
    if bytes.get(close) != Some(&b'$') {
        return start + 1;
    }

    let tag = &bytes[start..=close];
    let body = close + 1;
    bytes[body..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(bytes.len(), |p| body + p + tag.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literals(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_substitutes_in_order() {
        let sql = substitute_parameters(
            "SELECT * FROM users WHERE id = $1 AND name = $2",
            &literals(&["7", "'Alice'"]),
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM users WHERE id = 7 AND name = 'Alice'");
    }

    #[test]
    fn test_double_digit_placeholders() {
        let values: Vec<String> = (1..=11).map(|n| n.to_string()).collect();
        let sql = substitute_parameters("SELECT $1, $10, $11", &values).unwrap();
        assert_eq!(sql, "SELECT 1, 10, 11");
    }

    #[test]
    fn test_placeholders_inside_quotes_and_comments_untouched() {
        let sql = substitute_parameters(
            "SELECT '$1', \"$1\", $$ $1 $$, $fn$ $1 $fn$, E'\\' $1' -- $1\n, $1 /* $1 /* $1 */ */",
            &literals(&["42"]),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT '$1', \"$1\", $$ $1 $$, $fn$ $1 $fn$, E'\\' $1' -- $1\n, 42 /* $1 /* $1 */ */"
        );
    }

    #[test]
    fn test_missing_parameter_is_an_error() {
        let err = substitute_parameters("SELECT $2", &literals(&["1"])).unwrap_err();
        assert_eq!(err.sqlstate, "08P01");
        assert!(substitute_parameters("SELECT $0", &literals(&["1"])).is_err());
    }

    #[test]
    fn test_render_literal() {
        assert_eq!(render_literal(None, 23), "NULL");
        assert_eq!(render_literal(Some("42"), 23), "42");
        assert_eq!(render_literal(Some("-5"), 20), "(-5)");
        assert_eq!(render_literal(Some("1.5e3"), 701), "1.5e3");
        // Untyped or textual values stay quoted even when they look numeric
        assert_eq!(render_literal(Some("42"), 0), "'42'");
        assert_eq!(render_literal(Some("42"), 25), "'42'");
        assert_eq!(render_literal(Some("NaN"), 701), "'NaN'");
        assert_eq!(render_literal(Some("1; DROP TABLE users"), 23), "'1; DROP TABLE users'");
        assert_eq!(render_literal(Some("O'Brien"), 25), "'O''Brien'");
    }

    #[test]
    fn test_decode_binary_values() {
        assert_eq!(decode_value(0, &42i32.to_be_bytes(), Format::Binary, 23).unwrap(), "42");
        assert_eq!(decode_value(0, &(-3i16).to_be_bytes(), Format::Binary, 21).unwrap(), "-3");
        assert_eq!(
            decode_value(0, &9_000_000_000i64.to_be_bytes(), Format::Binary, 20).unwrap(),
            "9000000000"
        );
        assert_eq!(decode_value(0, &[1], Format::Binary, 16).unwrap(), "true");
        assert_eq!(decode_value(0, &2.5f64.to_be_bytes(), Format::Binary, 701).unwrap(), "2.5");
        assert_eq!(decode_value(0, b"hi", Format::Binary, 25).unwrap(), "hi");
        assert_eq!(
            decode_value(0, &[0x12; 16], Format::Binary, 2950).unwrap(),
            "12121212-1212-1212-1212-121212121212"
        );

        let err = decode_value(1, &[0, 1], Format::Binary, 23).unwrap_err();
        assert_eq!(err.sqlstate, "22P02");
        let err = decode_value(0, &[0; 8], Format::Binary, 1114).unwrap_err();
        assert_eq!(err.sqlstate, "0A000");
    }

    #[test]
    fn test_format_codes() {
        assert_eq!(format_for(&[], 3), Format::Text);
        assert_eq!(format_for(&[Format::Binary], 3), Format::Binary);
        assert_eq!(format_for(&[Format::Text, Format::Binary], 1), Format::Binary);
        assert!(Format::from_code(2).is_err());
    }
}
