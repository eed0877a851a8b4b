//! The primitive-formatter hook: decides which values are small enough to persist as a
//! human-inspectable scalar payload rather than going through the full pickle path, and
//! renders that payload.

use bytes::Bytes;
use varstate_dispatch::Object;

use crate::value::Scalar;

/// A pluggable formatter for primitive (singleton, leaf) values. The default implementation
/// covers the built-in [`Scalar`] kind; an embedder with its own lightweight value types can
/// supply a different one.
pub trait PrimitiveFormatter {
    /// Whether `value` should be treated as primitive for the purposes of dump policy.
    fn is_primitive(&self, value: &Object) -> bool;

    /// Render `value`'s payload and runtime type name. Only ever called when
    /// [`Self::is_primitive`] returned `true` for the same value.
    fn primitive_var_repr(&self, value: &Object) -> (Bytes, &'static str);
}

/// Formats [`Scalar`] values as a small tagged encoding; anything else is not primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPrimitiveFormatter;

impl PrimitiveFormatter for DefaultPrimitiveFormatter {
    fn is_primitive(&self, value: &Object) -> bool {
        value.as_any().downcast_ref::<Scalar>().is_some()
    }

    fn primitive_var_repr(&self, value: &Object) -> (Bytes, &'static str) {
        let scalar = value
            .as_any()
            .downcast_ref::<Scalar>()
            .expect("primitive_var_repr called on a non-primitive value");
        let mut buf = Vec::new();
        match scalar {
            Scalar::None => buf.push(0),
            Scalar::Bool(b) => {
                buf.push(1);
                buf.push(u8::from(*b));
            }
            Scalar::Int(i) => {
                buf.push(2);
                buf.extend_from_slice(&i.to_le_bytes());
            }
            Scalar::Float(f) => {
                buf.push(3);
                buf.extend_from_slice(&f.to_le_bytes());
            }
            Scalar::Bytes(b) => {
                buf.push(4);
                buf.extend_from_slice(b);
            }
            Scalar::Str(s) => {
                buf.push(5);
                buf.extend_from_slice(s.as_bytes());
            }
        }
        (Bytes::from(buf), scalar.type_name_for_formatter())
    }
}

impl Scalar {
    fn type_name_for_formatter(&self) -> &'static str {
        use varstate_dispatch::Reduce;
        self.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use crate::value::List;
    use std::cell::RefCell;

    #[test]
    fn scalar_is_primitive() {
        let fmt = DefaultPrimitiveFormatter;
        let value: Object = Rc::new(Scalar::Int(42));
        assert!(fmt.is_primitive(&value));
        let (bytes, type_name) = fmt.primitive_var_repr(&value);
        assert_eq!(type_name, "int");
        assert!(!bytes.is_empty());
    }

    #[test]
    fn container_is_not_primitive() {
        let fmt = DefaultPrimitiveFormatter;
        let value: Object = Rc::new(List(RefCell::new(vec![])));
        assert!(!fmt.is_primitive(&value));
    }
}
