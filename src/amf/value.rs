//! AMF0 value model
//!
//! Command and data messages carry a sequence of self-describing values.
//! Objects keep their keys in insertion order (clients such as FMLE
//! compare property order when parsing `_result`), keys are unique and a
//! later insert replaces the earlier value in place.

use indexmap::IndexMap;

/// Ordered property map used by objects and ECMA arrays
pub type AmfObject = IndexMap<String, AmfValue>;

/// A single AMF0 value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmfValue {
    /// IEEE 754 double (0x00)
    Number(f64),

    /// 0x01
    Boolean(bool),

    /// UTF-8 string; short (0x02) or long (0x0C) on the wire
    String(String),

    /// Anonymous object (0x03)
    Object(AmfObject),

    /// 0x05
    #[default]
    Null,

    /// 0x06
    Undefined,

    /// Associative array (0x08). The wire count field is only a hint.
    EcmaArray(AmfObject),

    /// Dense array (0x0A)
    StrictArray(Vec<AmfValue>),

    /// Milliseconds since the Unix epoch plus a timezone offset in minutes (0x0B)
    Date { millis: f64, timezone: i16 },
}

impl AmfValue {
    /// Empty anonymous object
    pub fn object() -> Self {
        AmfValue::Object(AmfObject::new())
    }

    /// Empty ECMA array
    pub fn ecma_array() -> Self {
        AmfValue::EcmaArray(AmfObject::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Properties of an object or ECMA array
    pub fn as_object(&self) -> Option<&AmfObject> {
        match self {
            AmfValue::Object(m) | AmfValue::EcmaArray(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut AmfObject> {
        match self {
            AmfValue::Object(m) | AmfValue::EcmaArray(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AmfValue]> {
        match self {
            AmfValue::StrictArray(a) => Some(a),
            _ => None,
        }
    }

    /// Property lookup; `None` for non-objects and missing keys
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    /// String property, `None` when missing or not a string
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Number property, `None` when missing or not a number
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    /// Boolean property, `None` when missing or not a boolean
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    /// Insert or replace a property; no-op on non-object values.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AmfValue>) {
        if let Some(map) = self.as_object_mut() {
            map.insert(key.into(), value.into());
        }
    }

    /// Builder form of [`set`](Self::set)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AmfValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Independent copy of this value and everything nested in it.
    ///
    /// Every variant owns its data, so this is a plain clone; it exists so
    /// call sites that need a detached copy read as such.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Exact number of bytes [`Amf0Encoder`](super::amf0::Amf0Encoder) writes
    pub fn encoded_size(&self) -> usize {
        match self {
            AmfValue::Number(_) => 1 + 8,
            AmfValue::Boolean(_) => 1 + 1,
            AmfValue::String(s) => 1 + string_size(s),
            AmfValue::Object(props) => 1 + properties_size(props),
            AmfValue::Null | AmfValue::Undefined => 1,
            AmfValue::EcmaArray(props) => 1 + 4 + properties_size(props),
            AmfValue::StrictArray(elems) => {
                1 + 4 + elems.iter().map(AmfValue::encoded_size).sum::<usize>()
            }
            AmfValue::Date { .. } => 1 + 8 + 2,
        }
    }
}

/// Length prefix plus bytes; strings over 64 KiB need the 4-byte prefix
fn string_size(s: &str) -> usize {
    if s.len() > u16::MAX as usize {
        4 + s.len()
    } else {
        2 + s.len()
    }
}

fn properties_size(props: &AmfObject) -> usize {
    props
        .iter()
        .map(|(k, v)| 2 + k.len().min(u16::MAX as usize) + v.encoded_size())
        .sum::<usize>()
        + 3
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<i32> for AmfValue {
    fn from(v: i32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<AmfObject> for AmfValue {
    fn from(v: AmfObject) -> Self {
        AmfValue::Object(v)
    }
}

impl<V: Into<AmfValue>> From<Vec<V>> for AmfValue {
    fn from(v: Vec<V>) -> Self {
        AmfValue::StrictArray(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let obj = AmfValue::object()
            .with("app", "live")
            .with("objectEncoding", 0.0)
            .with("fpad", false);

        assert_eq!(obj.get_string("app"), Some("live"));
        assert_eq!(obj.get_number("objectEncoding"), Some(0.0));
        assert_eq!(obj.get_bool("fpad"), Some(false));
    }

    #[test]
    fn test_lookup_missing_and_wrong_type_are_both_absent() {
        let obj = AmfValue::object().with("tcUrl", 42.0);

        assert_eq!(obj.get_string("tcUrl"), None);
        assert_eq!(obj.get_string("swfUrl"), None);
        assert_eq!(AmfValue::Null.get_string("tcUrl"), None);
    }

    #[test]
    fn test_insertion_order_and_last_write_wins() {
        let mut obj = AmfValue::object()
            .with("a", 1.0)
            .with("b", 2.0)
            .with("c", 3.0);
        obj.set("a", 10.0);

        let keys: Vec<&str> = obj.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert_eq!(obj.get_number("a"), Some(10.0));
    }

    #[test]
    fn test_set_on_non_object_is_noop() {
        let mut v = AmfValue::Number(1.0);
        v.set("key", "value");
        assert_eq!(v, AmfValue::Number(1.0));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let original = AmfValue::object()
            .with(
                "nested",
                AmfValue::ecma_array().with("list", vec![AmfValue::Number(1.0)]),
            )
            .with("name", "stream");

        let mut copy = original.deep_copy();
        copy.set("name", "other");
        if let Some(AmfValue::EcmaArray(inner)) = copy.as_object_mut().unwrap().get_mut("nested")
        {
            inner.insert("list".into(), AmfValue::StrictArray(vec![]));
            inner.insert("extra".into(), AmfValue::Boolean(true));
        }

        assert_eq!(original.get_string("name"), Some("stream"));
        let nested = original.get("nested").unwrap();
        assert_eq!(nested.get("list").unwrap().as_array().unwrap().len(), 1);
        assert!(nested.get("extra").is_none());
        assert_ne!(original, copy);
    }

    #[test]
    fn test_deep_copy_every_variant() {
        let values = vec![
            AmfValue::Number(1.5),
            AmfValue::Boolean(true),
            AmfValue::String("s".into()),
            AmfValue::object().with("k", "v"),
            AmfValue::Null,
            AmfValue::Undefined,
            AmfValue::ecma_array().with("k", 1.0),
            AmfValue::StrictArray(vec![AmfValue::Null]),
            AmfValue::Date {
                millis: 1.0,
                timezone: 60,
            },
        ];
        for v in values {
            assert_eq!(v.deep_copy(), v);
        }
    }

    #[test]
    fn test_encoded_size() {
        assert_eq!(AmfValue::Number(0.0).encoded_size(), 9);
        assert_eq!(AmfValue::String("connect".into()).encoded_size(), 10);
        assert_eq!(AmfValue::Null.encoded_size(), 1);
        // marker + ("a" key + number) + end marker
        assert_eq!(AmfValue::object().with("a", 1.0).encoded_size(), 1 + 3 + 9 + 3);
        assert_eq!(AmfValue::ecma_array().encoded_size(), 1 + 4 + 3);
        assert_eq!(
            AmfValue::Date {
                millis: 0.0,
                timezone: 0
            }
            .encoded_size(),
            11
        );
        assert_eq!(AmfValue::String("x".repeat(70000)).encoded_size(), 70005);
    }

    #[test]
    fn test_from_conversions() {
        let v: AmfValue = "test".into();
        assert!(matches!(v, AmfValue::String(_)));

        let v: AmfValue = 42i32.into();
        assert_eq!(v, AmfValue::Number(42.0));

        let v: AmfValue = vec![1.0, 2.0].into();
        assert_eq!(v.as_array().map(<[AmfValue]>::len), Some(2));

        assert_eq!(AmfValue::default(), AmfValue::Null);
    }
}
