use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::value::{Str, Value};

/// The associative array primitive.
///
/// An array maps keys to values. Keys may be nil, booleans, numbers
/// (excluding NaN), strings, or heap values; a float key with an integral
/// value collapses to the integer key, so `a[1]` and `a[1.0]` are the same
/// slot. Strings are keyed by content, other heap values by identity.
///
/// Reading a missing key yields nil; storing nil removes the entry. The VM
/// rejects NaN keys before they reach this type.
#[derive(Debug, Default)]
pub struct Array {
    items: RefCell<FxHashMap<ArrayKey, Value>>,
}

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Fetch the value for `key`, or nil if absent (or if the key is not
    /// representable, e.g. NaN).
    pub fn get(&self, key: &Value) -> Value {
        match ArrayKey::from_value(key) {
            Some(k) => self.items.borrow().get(&k).cloned().unwrap_or(Value::Nil),
            None => Value::Nil,
        }
    }

    /// Store `key -> value`. Storing nil removes the entry.
    pub fn set(&self, key: &Value, value: Value) {
        let Some(k) = ArrayKey::from_value(key) else {
            return;
        };
        if value.is_nil() {
            self.items.borrow_mut().remove(&k);
        } else {
            self.items.borrow_mut().insert(k, value);
        }
    }

    /// String-keyed fetch, used for symbol tables and library registration.
    pub fn get_str(&self, name: &str) -> Value {
        self.items
            .borrow()
            .get(&ArrayKey::Str(Rc::new(Str::from(name))))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    /// String-keyed store.
    pub fn set_str(&self, name: &str, value: Value) {
        let key = ArrayKey::Str(Rc::new(Str::from(name)));
        if value.is_nil() {
            self.items.borrow_mut().remove(&key);
        } else {
            self.items.borrow_mut().insert(key, value);
        }
    }

    /// Snapshot of the entries, for hosts inspecting an array (or the
    /// globals table). Order is unspecified.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.items
            .borrow()
            .iter()
            .map(|(k, v)| (k.to_value(), v.clone()))
            .collect()
    }
}

/// Hashable key form of a `Value`.
///
/// `Bits` holds the bit pattern of a non-integral, non-NaN float. `Obj`
/// keys a heap value by address while keeping it alive.
#[derive(Debug, Clone)]
enum ArrayKey {
    Nil,
    Bool(bool),
    Int(i64),
    Bits(u64),
    Str(Rc<Str>),
    Obj(ObjKey),
}

#[derive(Debug, Clone)]
struct ObjKey {
    addr: usize,
    keep: Value,
}

impl ArrayKey {
    /// Returns `None` only for NaN floats, which cannot be keys.
    fn from_value(v: &Value) -> Option<ArrayKey> {
        match v {
            Value::Nil => Some(ArrayKey::Nil),
            Value::Bool(b) => Some(ArrayKey::Bool(*b)),
            Value::Int(i) => Some(ArrayKey::Int(*i)),
            Value::Float(f) => {
                if f.is_nan() {
                    None
                } else if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(ArrayKey::Int(*f as i64))
                } else {
                    Some(ArrayKey::Bits(f.to_bits()))
                }
            }
            Value::String(s) => Some(ArrayKey::Str(Rc::clone(s))),
            Value::Array(a) => Some(ArrayKey::Obj(ObjKey {
                addr: Rc::as_ptr(a) as usize,
                keep: v.clone(),
            })),
            Value::Function(f) => Some(ArrayKey::Obj(ObjKey {
                addr: Rc::as_ptr(f) as usize,
                keep: v.clone(),
            })),
            Value::UserInfo(u) => Some(ArrayKey::Obj(ObjKey {
                addr: Rc::as_ptr(u) as *const () as usize,
                keep: v.clone(),
            })),
            Value::SymStub(name) => Some(ArrayKey::Str(Rc::new(Str::from(name.as_ref())))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ArrayKey::Nil => Value::Nil,
            ArrayKey::Bool(b) => Value::Bool(*b),
            ArrayKey::Int(i) => Value::Int(*i),
            ArrayKey::Bits(bits) => Value::Float(f64::from_bits(*bits)),
            ArrayKey::Str(s) => Value::String(Rc::clone(s)),
            ArrayKey::Obj(o) => o.keep.clone(),
        }
    }
}

impl PartialEq for ArrayKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ArrayKey::Nil, ArrayKey::Nil) => true,
            (ArrayKey::Bool(a), ArrayKey::Bool(b)) => a == b,
            (ArrayKey::Int(a), ArrayKey::Int(b)) => a == b,
            (ArrayKey::Bits(a), ArrayKey::Bits(b)) => a == b,
            (ArrayKey::Str(a), ArrayKey::Str(b)) => a.as_bytes() == b.as_bytes(),
            (ArrayKey::Obj(a), ArrayKey::Obj(b)) => a.addr == b.addr,
            _ => false,
        }
    }
}

impl Eq for ArrayKey {}

impl Hash for ArrayKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ArrayKey::Nil => 0u8.hash(state),
            ArrayKey::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            ArrayKey::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            ArrayKey::Bits(bits) => {
                3u8.hash(state);
                bits.hash(state);
            }
            ArrayKey::Str(s) => {
                4u8.hash(state);
                s.as_bytes().hash(state);
            }
            ArrayKey::Obj(o) => {
                5u8.hash(state);
                o.addr.hash(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_reads_nil() {
        let a = Array::new();
        assert!(a.get(&Value::Int(1)).is_nil());
    }

    #[test]
    fn set_get_roundtrip() {
        let a = Array::new();
        a.set(&Value::Int(7), Value::string("seven"));
        assert!(crate::value::values_equal(
            &a.get(&Value::Int(7)),
            &Value::string("seven"),
        ));
    }

    #[test]
    fn integral_float_key_aliases_int_key() {
        let a = Array::new();
        a.set(&Value::Float(2.0), Value::Int(42));
        assert!(matches!(a.get(&Value::Int(2)), Value::Int(42)));
    }

    #[test]
    fn storing_nil_removes() {
        let a = Array::new();
        a.set(&Value::Int(1), Value::Int(10));
        assert_eq!(a.len(), 1);
        a.set(&Value::Int(1), Value::Nil);
        assert_eq!(a.len(), 0);
        assert!(a.get(&Value::Int(1)).is_nil());
    }

    #[test]
    fn nan_key_is_rejected() {
        let a = Array::new();
        a.set(&Value::Float(f64::NAN), Value::Int(1));
        assert_eq!(a.len(), 0);
        assert!(a.get(&Value::Float(f64::NAN)).is_nil());
    }

    #[test]
    fn string_keys_by_content() {
        let a = Array::new();
        a.set_str("answer", Value::Int(42));
        assert!(matches!(a.get(&Value::string("answer")), Value::Int(42)));
        assert!(matches!(a.get_str("answer"), Value::Int(42)));
    }
}
