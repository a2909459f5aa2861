//! Symbolic register values and heap objects.
//!
//! A register holds a [`Value`]: either a concrete value the executor could compute, a
//! reference to a [`HeapObject`], or [`Value::Unknown`] carrying only the static type.
//! Unknown values are what makes the execution symbolic: a branch on an unknown value
//! follows both edges.

use std::{fmt, sync::Arc};

use rustc_hash::FxHashMap;

/// Reference to an object allocated during symbolic execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef(pub(crate) u64);

impl HeapRef {
    /// Creates a heap reference with the given id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        HeapRef(id)
    }

    /// Returns the id of this reference.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({})", self.0)
    }
}

/// A symbolic register value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A known 32 bit integer (also used for booleans, chars and shorts).
    Int(i32),
    /// A known string constant.
    Str(Arc<str>),
    /// A reference to an object allocated by this execution.
    Ref(HeapRef),
    /// A value of the given type descriptor whose content is not known.
    Unknown(Arc<str>),
}

impl Value {
    /// Creates an unknown value of type `descriptor`.
    #[must_use]
    pub fn unknown(descriptor: &str) -> Self {
        Value::Unknown(descriptor.into())
    }

    /// Returns the integer if this value is a known integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns `true` if the content of this value is known.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Value::Unknown(_))
    }

    /// Returns the heap reference, if this is one.
    #[must_use]
    pub fn as_heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::Ref(reference) => Some(*reference),
            _ => None,
        }
    }

    /// Returns the type descriptor of this value.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Value::Int(_) => "I",
            Value::Str(_) => "Ljava/lang/String;",
            Value::Ref(_) => "Ljava/lang/Object;",
            Value::Unknown(descriptor) => descriptor,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "\"{value}\""),
            Value::Ref(reference) => write!(f, "{reference}"),
            Value::Unknown(descriptor) => write!(f, "?{descriptor}"),
        }
    }
}

/// An object instance with its field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapObject {
    /// Class descriptor of the instance.
    pub class: Arc<str>,
    /// Field values by field reference, unknown fields are absent.
    pub fields: FxHashMap<Arc<str>, Value>,
}

impl HeapObject {
    /// Creates an instance with no known fields.
    #[must_use]
    pub fn new(class: &str) -> Self {
        HeapObject {
            class: class.into(),
            fields: FxHashMap::default(),
        }
    }
}
