//! Host-side values exchanged with a program.
//!
//! A [`Value`] is independent of any interpreter instance. Caller bindings are
//! converted into interpreter objects when a program starts and the program's
//! globals are converted back when it stops, so nothing a program creates
//! outlives its run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Exception, kind};

/// Signature of a host function callable from programs.
///
/// Receives positional and keyword arguments; an `Err` is raised inside the
/// program as an ordinary (catchable) exception of the same kind.
pub type HostFn = dyn Fn(&[Value], &[(String, Value)]) -> Result<Value, Exception> + Send + Sync;

/// A value crossing the sandbox boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// An integer that fits in 64 bits.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(String),
    /// A list.
    List(Vec<Value>),
    /// A tuple.
    Tuple(Vec<Value>),
    /// A dict, in insertion order.
    Dict(Vec<(Value, Value)>),
    /// A named bag of attributes, seen by programs as a module object.
    Namespace(Namespace),
    /// A host function.
    Function(HostFunction),
    /// Anything else a program left behind (functions, classes, instances,
    /// modules, big integers). Not rebound on later runs.
    Opaque(Opaque),
}

/// Attribute namespace exposed to programs as a module object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Namespace {
    name: String,
    attrs: BTreeMap<String, Value>,
}

impl Namespace {
    /// An empty namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// The namespace's `__name__`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an attribute.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// Set an attribute.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attrs.remove(name)
    }

    /// Attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A named host function. Compares by identity.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    func: Arc<HostFn>,
}

impl HostFunction {
    /// Wrap `func`.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value], &[(String, Value)]) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// The function's name, used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function.
    pub fn call(&self, args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, Exception> {
        (self.func)(args, kwargs)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish_non_exhaustive()
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

/// A program object with no host representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opaque {
    /// The object's type name.
    pub type_name: String,
    /// A printable rendering.
    pub repr: String,
}

impl Value {
    /// A string value.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// A host function value.
    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value], &[(String, Value)]) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        Value::Function(HostFunction::new(name, func))
    }

    /// The type name a program would see.
    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Namespace(_) => "module",
            Value::Function(_) => "builtin_function_or_method",
            Value::Opaque(o) => &o.type_name,
        }
    }

    /// The integer, if this is one. Bools count, as in Python.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// The float, widening integers.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// The string slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Dict lookup by string key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            Value::Namespace(ns) => ns.get(key),
            _ => None,
        }
    }

    /// Python truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Dict(pairs) => !pairs.is_empty(),
            Value::Namespace(_) | Value::Function(_) | Value::Opaque(_) => true,
        }
    }

    /// `repr(value)`
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => quote(s),
            other => other.to_string(),
        }
    }

    /// Convert JSON into a value. Objects become dicts with string keys.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (Value::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into JSON the way `json.dumps` would.
    pub fn to_json(&self) -> Result<serde_json::Value, Exception> {
        Ok(match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Exception::value_error("Out of range float values are not JSON compliant"))?,
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) | Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect::<Result<_, _>>()?)
            }
            Value::Dict(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    map.insert(json_key(k)?, v.to_json()?);
                }
                serde_json::Value::Object(map)
            }
            other => {
                return Err(Exception::type_error(format!(
                    "Object of type {} is not JSON serializable",
                    other.type_name()
                )));
            }
        })
    }
}

fn json_key(key: &Value) -> Result<String, Exception> {
    match key {
        Value::Str(s) => Ok(s.clone()),
        Value::None => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(_) => Ok(key.to_string()),
        other => Err(Exception::new(
            kind::TYPE_ERROR,
            format!("keys must be str, int, float, bool or None, not {}", other.type_name()),
        )),
    }
}

/// Python's string quoting: single quotes unless the text contains only `'`.
fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delim);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

fn join(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        f.write_str(&item.repr())?;
    }
    Ok(())
}

/// `str(value)`
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 => write!(f, "{x:.1}"),
            Value::Float(x) if x.is_nan() => f.write_str("nan"),
            Value::Float(x) if x.is_infinite() => f.write_str(if *x > 0.0 { "inf" } else { "-inf" }),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                join(f, items)?;
                f.write_str("]")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                join(f, items)?;
                f.write_str(if items.len() == 1 { ",)" } else { ")" })
            }
            Value::Dict(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k.repr(), v.repr())?;
                }
                f.write_str("}")
            }
            Value::Namespace(ns) => write!(f, "<module '{}'>", ns.name),
            Value::Function(func) => write!(f, "<built-in function {}>", func.name),
            Value::Opaque(o) => f.write_str(&o.repr),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Namespace> for Value {
    fn from(ns: Namespace) -> Self {
        Value::Namespace(ns)
    }
}

impl From<HostFunction> for Value {
    fn from(f: HostFunction) -> Self {
        Value::Function(f)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_conversion() {
        let v = Value::from_json(&json!({"n": 1, "xs": [1.5, "a", null], "ok": true}));
        assert_eq!(v.get("n"), Some(&Value::Int(1)));
        assert_eq!(v.to_json().unwrap(), json!({"n": 1, "xs": [1.5, "a", null], "ok": true}));
    }

    #[test]
    fn test_json_keys_follow_dumps() {
        let v = Value::Dict(vec![(Value::Int(1), Value::None), (Value::Bool(true), Value::Int(2))]);
        assert_eq!(v.to_json().unwrap(), json!({"1": null, "true": 2}));

        let bad = Value::Dict(vec![(Value::Tuple(vec![]), Value::None)]);
        assert_eq!(bad.to_json().unwrap_err().kind(), "TypeError");
    }

    #[test]
    fn test_non_json_values_are_type_errors() {
        let f = Value::function("f", |_, _| Ok(Value::None));
        let err = f.to_json().unwrap_err();
        assert_eq!(err.message(), "Object of type builtin_function_or_method is not JSON serializable");
        assert!(Value::Float(f64::NAN).to_json().is_err());
    }

    #[test]
    fn test_display_matches_python() {
        let v = Value::List(vec![Value::str("a"), Value::Float(2.0), Value::None]);
        assert_eq!(v.to_string(), "['a', 2.0, None]");
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
        assert_eq!(Value::str("a\nb").repr(), "'a\\nb'");
    }

    #[test]
    fn test_host_functions_compare_by_identity() {
        let f = HostFunction::new("f", |_, _| Ok(Value::None));
        let g = HostFunction::new("f", |_, _| Ok(Value::None));
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
        assert_eq!(f.call(&[], &[]).unwrap(), Value::None);
    }
}
