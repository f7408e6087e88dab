//! Body and query decoding strategies.
//!
//! Both strategies decode into a `serde_json::Value`; the context then
//! deserializes that into the caller's type, so one `#[derive(Deserialize)]`
//! covers JSON, XML and form bodies and query strings alike.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};

use crate::error::Error;

/// Largest body the default parser accepts: 2 MiB.
pub const DEFAULT_MAX_BYTES: usize = 2 << 20;

const JSON: &str = "application/json";
const XML: &str = "application/xml";
const FORM: &str = "application/x-www-form-urlencoded";

/// Decodes request bodies.
///
/// The context calls [`parse`](BodyParser::parse) only for a non-empty body
/// no larger than [`max_bytes`](BodyParser::max_bytes), whose media type is
/// JSON, XML or form encoding.
pub trait BodyParser: Send + Sync + 'static {
    fn max_bytes(&self) -> usize;

    fn parse(&self, body: &[u8], media_type: &str, charset: Option<&str>) -> Result<Value, Error>;
}

/// Binds query or form values.
pub trait UrlBinder: Send + Sync + 'static {
    fn bind(&self, values: &HashMap<String, Vec<String>>) -> Result<Value, Error>;
}

// ── Defaults ─────────────────────────────────────────────────────────────────

/// JSON, XML and form bodies, UTF-8 only.
///
/// XML and form values arrive as text, so their scalars are inferred the
/// same way [`DefaultUrlBinder`] infers them. The root XML element becomes
/// the object; attributes appear under `@name` keys.
#[derive(Clone, Copy, Debug)]
pub struct DefaultBodyParser {
    max_bytes: usize,
}

impl DefaultBodyParser {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Default for DefaultBodyParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

impl BodyParser for DefaultBodyParser {
    fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn parse(&self, body: &[u8], media_type: &str, charset: Option<&str>) -> Result<Value, Error> {
        if let Some(charset) = charset {
            if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("utf8") {
                return Err(Error::UNSUPPORTED_MEDIA_TYPE
                    .with_message(format!("unsupported charset: {charset}")));
            }
        }
        match media_type {
            JSON => serde_json::from_slice(body).map_err(|e| Error::BAD_REQUEST.from_cause(&e)),
            XML => {
                let raw: Value = quick_xml::de::from_reader(body)
                    .map_err(|e| Error::BAD_REQUEST.from_cause(&e))?;
                Ok(infer(raw))
            }
            FORM => {
                let values = collect(url::form_urlencoded::parse(body));
                Ok(to_value(&values))
            }
            other => Err(Error::UNSUPPORTED_MEDIA_TYPE
                .with_message(format!("no decoder for {other}"))),
        }
    }
}

/// Binds each key to a scalar, or to an array when it repeats. Scalars are
/// inferred: `true`/`false`, integers and finite floats become JSON
/// booleans and numbers, everything else stays a string.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultUrlBinder;

impl UrlBinder for DefaultUrlBinder {
    fn bind(&self, values: &HashMap<String, Vec<String>>) -> Result<Value, Error> {
        Ok(to_value(values))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Splits a `Content-Type` into its lowercase essence and `charset`.
pub(crate) fn media_type(header: &str) -> (String, Option<String>) {
    let mut parts = header.split(';');
    let essence = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let charset = parts.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_owned())
    });
    (essence, charset)
}

pub(crate) fn is_supported(media_type: &str) -> bool {
    matches!(media_type, JSON | XML | FORM)
}

/// Decodes a query string into a multimap.
pub(crate) fn values(query: &str) -> HashMap<String, Vec<String>> {
    collect(url::form_urlencoded::parse(query.as_bytes()))
}

fn collect(pairs: url::form_urlencoded::Parse<'_>) -> HashMap<String, Vec<String>> {
    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in pairs {
        values.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    values
}

fn to_value(values: &HashMap<String, Vec<String>>) -> Value {
    let object: Map<String, Value> = values
        .iter()
        .map(|(k, vs)| {
            let v = match vs.as_slice() {
                [one] => scalar(one),
                many => Value::Array(many.iter().map(|s| scalar(s)).collect()),
            };
            (k.clone(), v)
        })
        .collect();
    Value::Object(object)
}

/// Infers scalars in decoded XML and collapses text-only elements.
fn infer(value: Value) -> Value {
    match value {
        Value::String(s) => scalar(&s),
        Value::Array(items) => Value::Array(items.into_iter().map(infer).collect()),
        Value::Object(map) => {
            if map.len() == 1 && (map.contains_key("$text") || map.contains_key("$value")) {
                return map.into_iter().next().map_or(Value::Null, |(_, v)| infer(v));
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, infer(v))).collect())
        }
        other => other,
    }
}

fn scalar(s: &str) -> Value {
    match s {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = s.parse::<i64>() {
        return Value::Number(n.into());
    }
    match s.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) if s.contains('.') => Value::Number(n),
        _ => Value::String(s.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_media_type_split() {
        assert_eq!(
            media_type("Application/JSON; charset=\"UTF-8\""),
            ("application/json".to_owned(), Some("UTF-8".to_owned()))
        );
        assert_eq!(media_type(""), (String::new(), None));
        assert!(is_supported("application/xml"));
        assert!(!is_supported("text/csv"));
    }

    #[test]
    fn test_scalar_inference() {
        let values = values("n=42&f=1.5&b=true&s=hello&inf=inf&tag=a&tag=b");
        let v = DefaultUrlBinder.bind(&values).unwrap();
        assert_eq!(v["n"], json!(42));
        assert_eq!(v["f"], json!(1.5));
        assert_eq!(v["b"], json!(true));
        assert_eq!(v["s"], json!("hello"));
        assert_eq!(v["inf"], json!("inf"));
        assert_eq!(v["tag"], json!(["a", "b"]));
    }

    #[test]
    fn test_xml_bodies() {
        let p = DefaultBodyParser::default();
        let v = p.parse(b"<user><name>ada</name><age>36</age></user>", XML, None).unwrap();
        assert_eq!(v["name"], json!("ada"));
        assert_eq!(v["age"], json!(36));

        assert_eq!(p.parse(b"<a><b>1</b></a>", XML, Some("utf-8")).unwrap(), json!({"b": 1}));
        assert_eq!(p.parse(b"<a><b>1</a>", XML, None).unwrap_err().code(), 400);
    }

    #[test]
    fn test_default_parser() {
        let p = DefaultBodyParser::default();
        assert_eq!(p.max_bytes(), 2 * 1024 * 1024);
        assert_eq!(p.parse(br#"{"a":1}"#, JSON, None).unwrap(), json!({"a": 1}));
        assert_eq!(p.parse(b"a=1&b=x", FORM, Some("utf-8")).unwrap(), json!({"a": 1, "b": "x"}));
        assert_eq!(p.parse(b"{", JSON, None).unwrap_err().code(), 400);
        assert_eq!(p.parse(b"a,b", "text/csv", None).unwrap_err().code(), 415);
        assert_eq!(p.parse(b"{}", JSON, Some("latin1")).unwrap_err().code(), 415);
    }
}
