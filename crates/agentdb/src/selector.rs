//! Typed selectors over record attributes.
//!
//! A query arrives as `attribute -> [raw string]`, usually straight from a
//! query string. Each raw string becomes a [`Selector`]: an operator and a
//! typed value. A record matches when every selector of every attribute holds.
//!
//! Comparison is driven by the selector's type, not the attribute's: numeric
//! selectors coerce the attribute to `f64`, text selectors stringify it and
//! boolean selectors only accept boolean attributes.

use std::collections::HashMap;
use std::fmt;

/// Attribute names shared by every event log regardless of its source.
pub const BASE_SELECTORS: [&str; 6] = [
    "source_type",
    "severity",
    "message",
    "event_code",
    "record_id",
    "timestamp",
];

pub type SelectorMap = HashMap<String, Vec<Selector>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Contains,
    Gt,
    Lt,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Eq => "=",
            Op::Contains => "~",
            Op::Gt => ">",
            Op::Lt => "<",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectorValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub op: Op,
    pub value: SelectorValue,
}

impl Selector {
    pub fn new(op: Op, value: SelectorValue) -> Self {
        Self { op, value }
    }

    /// Parse one raw query value.
    ///
    /// `~x` is substring containment. `>x` and `<x` compare numerically when
    /// `x` parses as a number and lexicographically otherwise. Anything else
    /// is an equality test against a boolean, a number or, failing both, text.
    /// A lone operator character is plain text.
    pub fn parse(raw: &str) -> Self {
        if raw.len() > 1 {
            if let Some(rest) = raw.strip_prefix('~') {
                return Self::new(Op::Contains, SelectorValue::Text(rest.to_string()));
            }
            for (prefix, op) in [('>', Op::Gt), ('<', Op::Lt)] {
                if let Some(rest) = raw.strip_prefix(prefix) {
                    let value = match rest.parse::<f64>() {
                        Ok(n) => SelectorValue::Number(n),
                        Err(_) => SelectorValue::Text(rest.to_string()),
                    };
                    return Self::new(op, value);
                }
            }
        }

        let value = if raw.eq_ignore_ascii_case("true") {
            SelectorValue::Bool(true)
        } else if raw.eq_ignore_ascii_case("false") {
            SelectorValue::Bool(false)
        } else if let Ok(n) = raw.parse::<f64>() {
            SelectorValue::Number(n)
        } else {
            SelectorValue::Text(raw.to_string())
        };
        Self::new(Op::Eq, value)
    }
}

/// Convert a pre-parsed query string into selectors.
pub fn convert_to_selectors(raw: &HashMap<String, Vec<String>>) -> SelectorMap {
    raw.iter()
        .map(|(attr, values)| {
            let selectors = values.iter().map(|v| Selector::parse(v)).collect();
            (attr.clone(), selectors)
        })
        .collect()
}

/// Split a query into (base, source-specific) parts.
pub fn group_selectors(selectors: &SelectorMap) -> (SelectorMap, SelectorMap) {
    selectors
        .iter()
        .map(|(attr, s)| (attr.clone(), s.clone()))
        .partition(|(attr, _)| BASE_SELECTORS.contains(&attr.as_str()))
}

// ── Attribute values ───────────────────────────────────────────────

/// A record attribute as seen by the selector engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl AttributeValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::UInt(n) => Some(*n as f64),
            AttributeValue::Int(n) => Some(*n as f64),
            AttributeValue::Float(n) => Some(*n),
            AttributeValue::Text(s) => s.trim().parse().ok(),
            AttributeValue::Bool(_) | AttributeValue::List(_) => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(s) => f.write_str(s),
            AttributeValue::UInt(n) => write!(f, "{n}"),
            AttributeValue::Int(n) => write!(f, "{n}"),
            AttributeValue::Float(n) => write!(f, "{n}"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::List(items) => write!(f, "[{}]", items.join(" ")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<&String> for AttributeValue {
    fn from(s: &String) -> Self {
        AttributeValue::Text(s.clone())
    }
}

impl From<u64> for AttributeValue {
    fn from(n: u64) -> Self {
        AttributeValue::UInt(n)
    }
}

impl From<&[String]> for AttributeValue {
    fn from(items: &[String]) -> Self {
        AttributeValue::List(items.to_vec())
    }
}

// ── Evaluation ─────────────────────────────────────────────────────

/// True when every selector holds for the attribute.
pub fn match_attribute_value(attr: &AttributeValue, selectors: &[Selector]) -> bool {
    selectors.iter().all(|s| match_one(attr, s))
}

fn match_one(attr: &AttributeValue, selector: &Selector) -> bool {
    match &selector.value {
        SelectorValue::Number(want) => {
            let Some(have) = attr.as_f64() else {
                return false;
            };
            match selector.op {
                Op::Eq => have == *want,
                Op::Gt => have > *want,
                Op::Lt => have < *want,
                Op::Contains => false,
            }
        }
        SelectorValue::Text(want) => {
            let have = attr.to_string();
            match selector.op {
                Op::Eq => have == *want,
                Op::Contains => have.contains(want.as_str()),
                Op::Gt => have.as_str() > want.as_str(),
                Op::Lt => have.as_str() < want.as_str(),
            }
        }
        SelectorValue::Bool(want) => match (attr, selector.op) {
            (AttributeValue::Bool(have), Op::Eq) => have == want,
            _ => false,
        },
    }
}

/// A record whose named attributes can be queried.
pub trait Selectable {
    /// The attribute's value, or `None` when the record has no such attribute.
    fn attribute(&self, name: &str) -> Option<AttributeValue>;

    /// Every attribute in `selectors` must exist and match. Unknown
    /// attribute names fail the whole match.
    fn matches(&self, selectors: &SelectorMap) -> bool {
        selectors.iter().all(|(name, sels)| match self.attribute(name) {
            Some(value) => match_attribute_value(&value, sels),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(raw: &str) -> Selector {
        Selector::parse(raw)
    }

    fn query(pairs: &[(&str, &[&str])]) -> SelectorMap {
        let raw: HashMap<String, Vec<String>> = pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect();
        convert_to_selectors(&raw)
    }

    struct Row {
        name: String,
        count: u64,
        ratio: f64,
        enabled: bool,
    }

    impl Selectable for Row {
        fn attribute(&self, name: &str) -> Option<AttributeValue> {
            match name {
                "name" => Some((&self.name).into()),
                "count" => Some(self.count.into()),
                "ratio" => Some(AttributeValue::Float(self.ratio)),
                "enabled" => Some(AttributeValue::Bool(self.enabled)),
                _ => None,
            }
        }
    }

    fn row() -> Row {
        Row {
            name: "agreement-one".into(),
            count: 12,
            ratio: 10.5,
            enabled: true,
        }
    }

    #[test]
    fn parse_prefixes() {
        assert_eq!(sel("~abc"), Selector::new(Op::Contains, SelectorValue::Text("abc".into())));
        assert_eq!(sel(">10"), Selector::new(Op::Gt, SelectorValue::Number(10.0)));
        assert_eq!(sel("<abc"), Selector::new(Op::Lt, SelectorValue::Text("abc".into())));
        assert_eq!(sel("~"), Selector::new(Op::Eq, SelectorValue::Text("~".into())));
    }

    #[test]
    fn parse_literals() {
        assert_eq!(sel("TRUE"), Selector::new(Op::Eq, SelectorValue::Bool(true)));
        assert_eq!(sel("False"), Selector::new(Op::Eq, SelectorValue::Bool(false)));
        assert_eq!(sel("3.5"), Selector::new(Op::Eq, SelectorValue::Number(3.5)));
        assert_eq!(sel("error"), Selector::new(Op::Eq, SelectorValue::Text("error".into())));
    }

    #[test]
    fn numeric_coercion_ignores_storage_type() {
        let r = row();
        assert!(r.matches(&query(&[("count", &[">10"])])));
        assert!(r.matches(&query(&[("ratio", &[">10"])])));
        assert!(!r.matches(&query(&[("count", &[">12"])])));
        assert!(r.matches(&query(&[("count", &["12"])])));
        // text that is not a number never satisfies a numeric selector
        assert!(!r.matches(&query(&[("name", &[">1"])])));
    }

    #[test]
    fn text_operators() {
        let r = row();
        assert!(r.matches(&query(&[("name", &["~agree", "~one"])])));
        assert!(!r.matches(&query(&[("name", &["~agree", "~two"])])));
        assert!(r.matches(&query(&[("name", &[">a", "<b"])])));
        assert!(r.matches(&query(&[("count", &["~1"])])));
    }

    #[test]
    fn booleans_only_match_booleans() {
        let r = row();
        assert!(r.matches(&query(&[("enabled", &["true"])])));
        assert!(!r.matches(&query(&[("enabled", &["false"])])));
        assert!(!r.matches(&query(&[("name", &["true"])])));
    }

    #[test]
    fn unknown_attribute_fails_closed() {
        assert!(!row().matches(&query(&[("missing", &["x"])])));
    }

    #[test]
    fn conjunction_of_maps() {
        let r = row();
        let a = query(&[("name", &["~agree"])]);
        let b = query(&[("count", &["<5"])]);
        let mut both = a.clone();
        both.extend(b.clone());
        assert_eq!(r.matches(&both), r.matches(&a) && r.matches(&b));
    }

    #[test]
    fn grouping_splits_base_attributes() {
        let q = query(&[("severity", &["error"]), ("agreement_id", &["~ag1"])]);
        let (base, source) = group_selectors(&q);
        assert!(base.contains_key("severity"));
        assert!(source.contains_key("agreement_id"));
        assert_eq!(base.len() + source.len(), 2);
    }

    #[test]
    fn list_attributes_stringify() {
        let list = AttributeValue::List(vec!["a".into(), "b".into()]);
        assert!(match_attribute_value(&list, &[sel("~a b")]));
    }
}
