// Resource Query Language
// Parser and evaluator for the advanced query expression trees embedded in query URLs

use serde_json::Value;

use crate::model::api_version::ApiVersion;
use crate::model::tai::Tai;
use crate::{NmosError, Result};

/// A parsed RQL expression.
///
/// RQL is a tree of call operators, e.g.
/// `and(eq(format,urn:x-nmos:format:video),in(tags.location,(Salford,London)))`.
#[derive(Debug, Clone, PartialEq)]
pub enum RqlExpr {
    /// An operator call, e.g. `eq(...)`
    Call { name: String, args: Vec<RqlExpr> },
    /// A scalar value; typed values are `<type>:<value>`, e.g. `api_version:v1.3`
    Scalar(RqlValue),
    /// A parenthesised group of scalars, e.g. `(Salford,London)`
    Group(Vec<RqlValue>),
}

/// A scalar RQL value, either plain text or tagged with one of the supported
/// value types.
#[derive(Debug, Clone, PartialEq)]
pub enum RqlValue {
    Plain(String),
    String(String),
    Number(f64),
    Boolean(bool),
    ApiVersion(ApiVersion),
    Version(Tai),
}

/// Three-valued evaluation result; a property that does not exist or a
/// comparison between incompatible types is indeterminate, which never
/// matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tristate {
    True,
    False,
    Indeterminate,
}

impl Tristate {
    fn from_bool(value: bool) -> Self {
        if value {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

/// Parse an RQL query string.
pub fn parse_query(rql: &str) -> Result<RqlExpr> {
    let mut parser = Parser {
        input: rql.as_bytes(),
        pos: 0,
    };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.input.len() {
        return Err(NmosError::Validation(format!(
            "unexpected trailing input in RQL query at offset {}",
            parser.pos
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn parse_expr(&mut self) -> Result<RqlExpr> {
        if self.peek() == Some(b'(') {
            return self.parse_group();
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'(' || c == b')' || c == b',' {
                break;
            }
            self.pos += 1;
        }
        let word = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| NmosError::Validation("RQL query is not valid UTF-8".to_string()))?
            .to_string();

        if self.peek() == Some(b'(') {
            // a call operator
            self.pos += 1;
            let mut args = Vec::new();
            if self.peek() == Some(b')') {
                self.pos += 1;
            } else {
                loop {
                    args.push(self.parse_expr()?);
                    match self.peek() {
                        Some(b',') => self.pos += 1,
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        _ => {
                            return Err(NmosError::Validation(
                                "unterminated RQL call".to_string(),
                            ))
                        }
                    }
                }
            }
            Ok(RqlExpr::Call { name: word, args })
        } else {
            Ok(RqlExpr::Scalar(parse_scalar(&word)))
        }
    }

    fn parse_group(&mut self) -> Result<RqlExpr> {
        // consume '('
        self.pos += 1;
        let mut values = Vec::new();
        loop {
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == b')' || c == b',' {
                    break;
                }
                self.pos += 1;
            }
            let word = std::str::from_utf8(&self.input[start..self.pos])
                .map_err(|_| NmosError::Validation("RQL query is not valid UTF-8".to_string()))?;
            values.push(parse_scalar(word));
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(NmosError::Validation("unterminated RQL group".to_string())),
            }
        }
        Ok(RqlExpr::Group(values))
    }
}

fn parse_scalar(word: &str) -> RqlValue {
    // a typed value only when the prefix is one of the supported types, so
    // that e.g. "urn:x-nmos:transport:rtp" stays a plain string
    if let Some(value) = word.strip_prefix("string:") {
        return RqlValue::String(percent_decode(value));
    }
    if let Some(value) = word.strip_prefix("number:") {
        if let Ok(number) = value.parse() {
            return RqlValue::Number(number);
        }
    }
    if let Some(value) = word.strip_prefix("boolean:") {
        if let Ok(boolean) = value.parse() {
            return RqlValue::Boolean(boolean);
        }
    }
    if let Some(value) = word.strip_prefix("api_version:") {
        if let Ok(version) = value.parse() {
            return RqlValue::ApiVersion(version);
        }
    }
    if let Some(value) = word.strip_prefix("version:") {
        if let Ok(tai) = value.parse() {
            return RqlValue::Version(tai);
        }
    }
    RqlValue::Plain(percent_decode(word))
}

// values inside an RQL expression have reserved characters percent-encoded
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(
                std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""),
                16,
            ) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(decoded).unwrap_or_else(|_| value.to_string())
}

/// Evaluate a parsed RQL expression against a resource representation.
pub fn matches(data: &Value, query: &RqlExpr) -> bool {
    evaluate(data, query) == Tristate::True
}

fn evaluate(data: &Value, expr: &RqlExpr) -> Tristate {
    let RqlExpr::Call { name, args } = expr else {
        return Tristate::Indeterminate;
    };
    match name.as_str() {
        "and" => {
            let mut result = Tristate::True;
            for arg in args {
                match evaluate(data, arg) {
                    Tristate::True => {}
                    other => result = other,
                }
                if result != Tristate::True {
                    return result;
                }
            }
            result
        }
        "or" => {
            let mut result = Tristate::False;
            for arg in args {
                match evaluate(data, arg) {
                    Tristate::True => return Tristate::True,
                    Tristate::Indeterminate => result = Tristate::Indeterminate,
                    Tristate::False => {}
                }
            }
            result
        }
        "not" => match args.first().map(|arg| evaluate(data, arg)) {
            Some(Tristate::True) => Tristate::False,
            Some(Tristate::False) => Tristate::True,
            _ => Tristate::Indeterminate,
        },
        "eq" => compare(data, args, |ordering| ordering == std::cmp::Ordering::Equal),
        "ne" => compare(data, args, |ordering| ordering != std::cmp::Ordering::Equal),
        "gt" => compare(data, args, |ordering| ordering == std::cmp::Ordering::Greater),
        "ge" => compare(data, args, |ordering| ordering != std::cmp::Ordering::Less),
        "lt" => compare(data, args, |ordering| ordering == std::cmp::Ordering::Less),
        "le" => compare(data, args, |ordering| ordering != std::cmp::Ordering::Greater),
        "in" => {
            let [RqlExpr::Scalar(RqlValue::Plain(path)), values] = &args[..] else {
                return Tristate::Indeterminate;
            };
            let Some(property) = extract(data, path) else {
                return Tristate::Indeterminate;
            };
            let candidates: &[RqlValue] = match values {
                RqlExpr::Group(values) => values,
                RqlExpr::Scalar(value) => std::slice::from_ref(value),
                RqlExpr::Call { .. } => return Tristate::Indeterminate,
            };
            Tristate::from_bool(candidates.iter().any(|candidate| {
                compare_values(property, candidate) == Some(std::cmp::Ordering::Equal)
            }))
        }
        "contains" => {
            let [RqlExpr::Scalar(RqlValue::Plain(path)), RqlExpr::Scalar(value)] = &args[..]
            else {
                return Tristate::Indeterminate;
            };
            match extract(data, path) {
                Some(Value::Array(elements)) => Tristate::from_bool(elements.iter().any(
                    |element| compare_values(element, value) == Some(std::cmp::Ordering::Equal),
                )),
                Some(Value::String(haystack)) => match value {
                    RqlValue::Plain(needle) | RqlValue::String(needle) => {
                        Tristate::from_bool(haystack.contains(needle))
                    }
                    _ => Tristate::Indeterminate,
                },
                _ => Tristate::Indeterminate,
            }
        }
        "matches" => {
            let [RqlExpr::Scalar(RqlValue::Plain(path)), RqlExpr::Scalar(value)] = &args[..]
            else {
                return Tristate::Indeterminate;
            };
            match (extract(data, path), value) {
                (Some(Value::String(haystack)), RqlValue::Plain(needle))
                | (Some(Value::String(haystack)), RqlValue::String(needle)) => {
                    Tristate::from_bool(haystack.contains(needle.as_str()))
                }
                _ => Tristate::Indeterminate,
            }
        }
        _ => Tristate::Indeterminate,
    }
}

fn compare(
    data: &Value,
    args: &[RqlExpr],
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Tristate {
    let [RqlExpr::Scalar(RqlValue::Plain(path)), RqlExpr::Scalar(value)] = args else {
        return Tristate::Indeterminate;
    };
    let Some(property) = extract(data, path) else {
        return Tristate::Indeterminate;
    };
    match compare_values(property, value) {
        Some(ordering) => Tristate::from_bool(accept(ordering)),
        None => Tristate::Indeterminate,
    }
}

/// Compare a JSON property against an RQL value, coercing where the types
/// allow. `None` when the two are incomparable.
fn compare_values(property: &Value, value: &RqlValue) -> Option<std::cmp::Ordering> {
    match value {
        RqlValue::Plain(text) | RqlValue::String(text) => match property {
            Value::String(property) => Some(property.as_str().cmp(text.as_str())),
            Value::Number(property) => {
                let number: f64 = text.parse().ok()?;
                property.as_f64()?.partial_cmp(&number)
            }
            Value::Bool(property) => {
                let boolean: bool = text.parse().ok()?;
                Some(property.cmp(&boolean))
            }
            _ => None,
        },
        RqlValue::Number(number) => property.as_f64()?.partial_cmp(number),
        RqlValue::Boolean(boolean) => Some(property.as_bool()?.cmp(boolean)),
        RqlValue::ApiVersion(version) => {
            let property: ApiVersion = property.as_str()?.parse().ok()?;
            Some(property.cmp(version))
        }
        RqlValue::Version(tai) => {
            let property: Tai = property.as_str()?.parse().ok()?;
            Some(property.cmp(tai))
        }
    }
}

// dotted-path property extraction, e.g. "tags.location"
fn extract<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> Value {
        json!({
            "id": "a1b2",
            "label": "Camera 1 Video",
            "transport": "urn:x-nmos:transport:rtp.mcast",
            "tags": { "location": ["Salford"] },
            "version": "1441704616:890020960",
            "enabled": true,
            "priority": 100
        })
    }

    #[test]
    fn test_eq_with_urn_value() {
        let query = parse_query("eq(transport,urn:x-nmos:transport:rtp.mcast)").unwrap();
        assert!(matches(&sender(), &query));

        let query = parse_query("eq(transport,urn:x-nmos:transport:rtp.ucast)").unwrap();
        assert!(!matches(&sender(), &query));
    }

    #[test]
    fn test_missing_property_is_indeterminate() {
        let query = parse_query("eq(no.such.path,value)").unwrap();
        assert!(!matches(&sender(), &query));
        // and not(indeterminate) is still not a match
        let query = parse_query("not(eq(no.such.path,value))").unwrap();
        assert!(!matches(&sender(), &query));
    }

    #[test]
    fn test_logical_operators() {
        let query =
            parse_query("and(eq(enabled,boolean:true),or(eq(priority,number:100),eq(priority,number:200)))")
                .unwrap();
        assert!(matches(&sender(), &query));

        let query = parse_query("not(eq(enabled,boolean:true))").unwrap();
        assert!(!matches(&sender(), &query));
    }

    #[test]
    fn test_numeric_coercion() {
        // untyped comparisons coerce to the property's type
        let query = parse_query("gt(priority,50)").unwrap();
        assert!(matches(&sender(), &query));
        let query = parse_query("le(priority,99)").unwrap();
        assert!(!matches(&sender(), &query));
    }

    #[test]
    fn test_in_group() {
        let query = parse_query("in(label,(Camera 1 Video,Camera 2 Video))").unwrap();
        assert!(matches(&sender(), &query));
        let query = parse_query("in(label,(Camera 2 Video,Camera 3 Video))").unwrap();
        assert!(!matches(&sender(), &query));
    }

    #[test]
    fn test_contains_array() {
        let query = parse_query("contains(tags.location,Salford)").unwrap();
        assert!(matches(&sender(), &query));
        let query = parse_query("contains(tags.location,London)").unwrap();
        assert!(!matches(&sender(), &query));
    }

    #[test]
    fn test_matches_substring() {
        let query = parse_query("matches(label,Camera)").unwrap();
        assert!(matches(&sender(), &query));
        let query = parse_query("matches(label,Microphone)").unwrap();
        assert!(!matches(&sender(), &query));
    }

    #[test]
    fn test_typed_version_comparison() {
        // component-wise, not lexicographic on the string form
        let query = parse_query("gt(version,version:1441704616:9)").unwrap();
        assert!(matches(&sender(), &query));
        let query = parse_query("eq(version,version:1441704616:890020960)").unwrap();
        assert!(matches(&sender(), &query));
    }

    #[test]
    fn test_typed_api_version_comparison() {
        let device = json!({ "api": "v1.3" });
        let query = parse_query("ge(api,api_version:v1.2)").unwrap();
        assert!(matches(&device, &query));
        let query = parse_query("lt(api,api_version:v1.10)").unwrap();
        // v1.3 < v1.10 by component comparison
        assert!(matches(&device, &query));
    }

    #[test]
    fn test_percent_decoded_values() {
        let data = json!({ "label": "a,b" });
        let query = parse_query("eq(label,a%2Cb)").unwrap();
        assert!(matches(&data, &query));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_query("eq(label,").is_err());
        assert!(parse_query("eq(label,x))").is_err());
    }
}
