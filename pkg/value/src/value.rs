use std::any::Any;
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Type descriptor for an abstract value. Host subsystems declare one static
/// instance per opaque type they hand to the runtime (e.g.
/// `core/socket-address`); descriptors are compared by address.
pub struct AbstractType {
    pub name: &'static str,
}

/// An opaque host value: a type descriptor plus a shared payload that the
/// owning subsystem can downcast back out.
#[derive(Clone)]
pub struct AbstractValue {
    ty: &'static AbstractType,
    data: Rc<dyn Any>,
}

impl AbstractValue {
    pub fn new(ty: &'static AbstractType, data: Rc<dyn Any>) -> Self {
        Self { ty, data }
    }

    pub fn type_name(&self) -> &'static str {
        self.ty.name
    }

    pub fn is_type(&self, ty: &'static AbstractType) -> bool {
        std::ptr::eq(self.ty, ty)
    }

    pub fn downcast<T: 'static>(&self) -> Option<Rc<T>> {
        self.data.clone().downcast::<T>().ok()
    }
}

/// Tagged runtime value.
///
/// Immutable variants compare by content; `Array`, `Table` and `Abstract`
/// compare by identity, so a mutable value used as a map key stays findable
/// after mutation.
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(Rc<Vec<u8>>),
    Symbol(Rc<Vec<u8>>),
    Keyword(Rc<Vec<u8>>),
    Tuple(Rc<Vec<Value>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Struct(Rc<HashMap<Value, Value>>),
    Table(Rc<RefCell<HashMap<Value, Value>>>),
    Abstract(AbstractValue),
}

impl Value {
    pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
        Value::String(Rc::new(bytes.into()))
    }

    pub fn symbol(name: impl Into<Vec<u8>>) -> Self {
        Value::Symbol(Rc::new(name.into()))
    }

    /// Keyword from its name, without the leading ':'.
    pub fn keyword(name: impl Into<Vec<u8>>) -> Self {
        Value::Keyword(Rc::new(name.into()))
    }

    pub fn tuple(elements: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(elements))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn struct_of(pairs: Vec<(Value, Value)>) -> Self {
        Value::Struct(Rc::new(pairs.into_iter().collect()))
    }

    pub fn table_of(pairs: Vec<(Value, Value)>) -> Self {
        Value::Table(Rc::new(RefCell::new(pairs.into_iter().collect())))
    }

    pub fn abstract_of(ty: &'static AbstractType, data: Rc<dyn Any>) -> Self {
        Value::Abstract(AbstractValue::new(ty, data))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            // Bitwise so that reals (NaN included) are stable map keys.
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Abstract(a), Value::Abstract(b)) => Rc::ptr_eq(&a.data, &b.data),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil => {}
            Value::Boolean(v) => v.hash(state),
            Value::Integer(v) => v.hash(state),
            Value::Real(v) => v.to_bits().hash(state),
            Value::String(v) | Value::Symbol(v) | Value::Keyword(v) => v.hash(state),
            Value::Tuple(v) => {
                for el in v.iter() {
                    el.hash(state);
                }
            }
            Value::Array(v) => (Rc::as_ptr(v) as usize).hash(state),
            Value::Struct(v) => hash_entries(v, state),
            Value::Table(v) => (Rc::as_ptr(v) as usize).hash(state),
            Value::Abstract(v) => (Rc::as_ptr(&v.data) as *const () as usize).hash(state),
        }
    }
}

/// Order independent combination of per-entry hashes so that two structs with
/// the same contents hash identically regardless of internal map order.
fn hash_entries<H: Hasher>(map: &HashMap<Value, Value>, state: &mut H) {
    let mut combined: u64 = 0;
    for (k, v) in map.iter() {
        let mut entry_hasher = DefaultHasher::new();
        k.hash(&mut entry_hasher);
        v.hash(&mut entry_hasher);
        combined = combined.wrapping_add(entry_hasher.finish());
    }
    combined.hash(state);
    map.len().hash(state);
}

/// Structural equality that ignores mutability: a tuple equals an array with
/// the same elements and a struct equals a table with the same entries.
/// Atoms and abstracts compare exactly as `==`.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Tuple(_) | Value::Array(_), Value::Tuple(_) | Value::Array(_)) => {
            with_elements(a, |ea| {
                with_elements(b, |eb| {
                    ea.len() == eb.len() && ea.iter().zip(eb.iter()).all(|(x, y)| deep_equal(x, y))
                })
            })
        }
        (Value::Struct(_) | Value::Table(_), Value::Struct(_) | Value::Table(_)) => {
            with_entries(a, |ma| {
                with_entries(b, |mb| {
                    ma.len() == mb.len()
                        && ma
                            .iter()
                            .all(|(k, v)| mb.get(k).map(|w| deep_equal(v, w)).unwrap_or(false))
                })
            })
        }
        _ => a == b,
    }
}

fn with_elements<R>(v: &Value, f: impl FnOnce(&[Value]) -> R) -> R {
    match v {
        Value::Tuple(t) => f(t),
        Value::Array(a) => f(&a.borrow()),
        _ => unreachable!(),
    }
}

fn with_entries<R>(v: &Value, f: impl FnOnce(&HashMap<Value, Value>) -> R) -> R {
    match v {
        Value::Struct(s) => f(s),
        Value::Table(t) => f(&t.borrow()),
        _ => unreachable!(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(true) => write!(f, "true"),
            Value::Boolean(false) => write!(f, "false"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => {
                // Keep a trailing ".0" so the text re-scans as a real.
                if v.is_finite() && *v == v.trunc() {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Value::String(bytes) => write_quoted(f, bytes),
            Value::Symbol(name) => write!(f, "{}", String::from_utf8_lossy(name)),
            Value::Keyword(name) => write!(f, ":{}", String::from_utf8_lossy(name)),
            Value::Tuple(elements) => write_sequence(f, "(", elements, ")"),
            Value::Array(elements) => write_sequence(f, "[", &elements.borrow(), "]"),
            Value::Struct(entries) => write_associative(f, "{", entries, "}"),
            Value::Table(entries) => write_associative(f, "@{", &entries.borrow(), "}"),
            Value::Abstract(v) => write!(f, "<{}>", v.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    write!(f, "\"")?;
    for &b in bytes {
        match b {
            b'"' => write!(f, "\\\"")?,
            b'\n' => write!(f, "\\n")?,
            b'\r' => write!(f, "\\r")?,
            b'\t' => write!(f, "\\t")?,
            0x0C => write!(f, "\\f")?,
            0 => write!(f, "\\0")?,
            0x1B => write!(f, "\\e")?,
            // The reader has no "\\" escape; a backslash round-trips as hex.
            0x20..=0x7E if b != b'\\' => write!(f, "{}", b as char)?,
            _ => write!(f, "\\h{:02x}", b)?,
        }
    }
    write!(f, "\"")
}

fn write_sequence(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    elements: &[Value],
    close: &str,
) -> fmt::Result {
    write!(f, "{}", open)?;
    for (i, el) in elements.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}", el)?;
    }
    write!(f, "{}", close)
}

fn write_associative(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    entries: &HashMap<Value, Value>,
    close: &str,
) -> fmt::Result {
    write!(f, "{}", open)?;
    for (i, (k, v)) in entries.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{} {}", k, v)?;
    }
    write!(f, "{}", close)
}
