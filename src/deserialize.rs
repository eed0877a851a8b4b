//! The deserializer: the inverse of [`crate::serializer::Pickler`], turning a component's
//! wire-format bytes back into live objects. One `Deserializer` is shared across every
//! variable of a single component, mirroring the shared [`varstate_dispatch::TransactionalMemo`]
//! the `Pickler` side uses, so a `MEMO_REF` written while encoding one variable still
//! resolves when decoding a later variable in the same component.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use varstate_dispatch::Object;

use crate::error::ChangeError;
use crate::serializer::tag;
use crate::value::{
    DictValue, FrozenSetValue, FunctionValue, List, ModuleValue, NamespaceHandle, OpaqueValue,
    Scalar, SetValue, Tuple, WeakRefValue,
};

/// Resolves a `(module, name)` global reference back into a live object, the inverse of a
/// `Reduce` impl returning `Reduction::GlobalRef`. An embedder with a real module/import
/// system supplies its own; the default only understands the module-itself case the
/// built-in [`ModuleValue`] reducer produces.
pub trait GlobalResolver {
    fn resolve(&self, module: &str, name: &str) -> Option<Object>;
}

/// Resolves `module == name` references (the shape `ModuleValue::reduce` emits) to a fresh
/// `ModuleValue`; anything else is left unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultGlobalResolver;

impl GlobalResolver for DefaultGlobalResolver {
    fn resolve(&self, module: &str, name: &str) -> Option<Object> {
        if module == name {
            Some(Rc::new(ModuleValue { name: module.to_string() }))
        } else {
            None
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn malformed(var: &str, reason: &str) -> ChangeError {
        ChangeError::Malformed { var: var.to_string(), reason: reason.to_string() }
    }

    fn take(&mut self, n: usize, var: &str) -> Result<&'a [u8], ChangeError> {
        if self.pos + n > self.bytes.len() {
            return Err(Self::malformed(var, "truncated payload"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self, var: &str) -> Result<u8, ChangeError> {
        Ok(self.take(1, var)?[0])
    }

    fn read_u32(&mut self, var: &str) -> Result<u32, ChangeError> {
        let bytes = self.take(4, var)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("checked 4-byte slice")))
    }

    fn read_u64(&mut self, var: &str) -> Result<u64, ChangeError> {
        let bytes = self.take(8, var)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("checked 8-byte slice")))
    }

    fn read_i64(&mut self, var: &str) -> Result<i64, ChangeError> {
        let bytes = self.take(8, var)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("checked 8-byte slice")))
    }

    fn read_f64(&mut self, var: &str) -> Result<f64, ChangeError> {
        let bytes = self.take(8, var)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("checked 8-byte slice")))
    }

    fn read_len_prefixed(&mut self, var: &str) -> Result<&'a [u8], ChangeError> {
        let len = self.read_u32(var)? as usize;
        self.take(len, var)
    }

    fn read_string(&mut self, var: &str) -> Result<String, ChangeError> {
        let bytes = self.read_len_prefixed(var)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Self::malformed(var, "invalid utf8"))
    }
}

/// The decoded pieces of one `VALUE` payload, prior to being assembled into a concrete
/// object. Mirrors the constructor/args/state/list-items/dict-items shape
/// `serializer::Pickler::dump` writes.
struct Members {
    args: Vec<Object>,
    state: Option<Object>,
    list_items: Vec<Object>,
    dict_items: Vec<(Object, Object)>,
}

/// Reconstructs objects from wire-format bytes written by `serializer::Pickler`. Scoped to
/// one component: the memo table lives only as long as that component's variables do.
pub struct Deserializer<'r> {
    resolver: &'r dyn GlobalResolver,
    memo: HashMap<u64, Object>,
}

impl<'r> Deserializer<'r> {
    pub fn new(resolver: &'r dyn GlobalResolver) -> Self {
        Self { resolver, memo: HashMap::new() }
    }

    /// Decode one variable's chunk into a live object.
    pub fn decode(&mut self, var: &str, bytes: &Bytes) -> Result<Object, ChangeError> {
        let mut cursor = Cursor::new(bytes);
        self.decode_value(var, &mut cursor)
    }

    fn decode_value(&mut self, var: &str, cursor: &mut Cursor) -> Result<Object, ChangeError> {
        let t = cursor.read_u8(var)?;
        match t {
            tag::NS_REF => Ok(Rc::new(NamespaceHandle)),
            tag::MEMO_REF => {
                let id = cursor.read_u64(var)?;
                self.memo.get(&id).cloned().ok_or_else(|| {
                    Cursor::malformed(var, &format!("unresolved memo reference {id}"))
                })
            }
            tag::NONE => Ok(Rc::new(Scalar::None)),
            tag::BOOL => Ok(Rc::new(Scalar::Bool(cursor.read_u8(var)? != 0))),
            tag::INT => Ok(Rc::new(Scalar::Int(cursor.read_i64(var)?))),
            tag::FLOAT => Ok(Rc::new(Scalar::Float(cursor.read_f64(var)?))),
            tag::BYTES => {
                let bytes = cursor.read_len_prefixed(var)?;
                Ok(Rc::new(Scalar::Bytes(Bytes::copy_from_slice(bytes))))
            }
            tag::STR => Ok(Rc::new(Scalar::Str(cursor.read_string(var)?))),
            tag::GLOBAL_REF => {
                let module = cursor.read_string(var)?;
                let name = cursor.read_string(var)?;
                match self.resolver.resolve(&module, &name) {
                    Some(obj) => Ok(obj),
                    None => Err(ChangeError::Import { module, name }),
                }
            }
            tag::VALUE => self.decode_container(var, cursor),
            other => Err(Cursor::malformed(var, &format!("unknown wire tag {other}"))),
        }
    }

    fn decode_members(&mut self, var: &str, cursor: &mut Cursor) -> Result<Members, ChangeError> {
        let arg_count = cursor.read_u32(var)? as usize;
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(self.decode_value(var, cursor)?);
        }

        let state = if cursor.read_u8(var)? != 0 {
            Some(self.decode_value(var, cursor)?)
        } else {
            None
        };

        let list_count = cursor.read_u32(var)? as usize;
        let mut list_items = Vec::with_capacity(list_count);
        for _ in 0..list_count {
            list_items.push(self.decode_value(var, cursor)?);
        }

        let dict_count = cursor.read_u32(var)? as usize;
        let mut dict_items = Vec::with_capacity(dict_count);
        for _ in 0..dict_count {
            let k = self.decode_value(var, cursor)?;
            let v = self.decode_value(var, cursor)?;
            dict_items.push((k, v));
        }

        Ok(Members { args, state, list_items, dict_items })
    }

    fn decode_container(&mut self, var: &str, cursor: &mut Cursor) -> Result<Object, ChangeError> {
        let memo_id = cursor.read_u64(var)?;
        let ctor_tag = cursor.read_u8(var)?;
        let custom_name =
            if ctor_tag == 9 { Some(cursor.read_string(var)?) } else { None };

        // List/Set/Dict are `RefCell`-backed, so the empty shell can be memoized *before*
        // its members are decoded. This is the only way a self-referential value (e.g. a
        // list containing itself) can round-trip, mirroring `Pickler::dump`'s
        // install-then-recurse order for the same cyclic case.
        match ctor_tag {
            1 => {
                let shell = Rc::new(List(RefCell::new(Vec::new())));
                self.memo.insert(memo_id, shell.clone() as Object);
                let members = self.decode_members(var, cursor)?;
                *shell.0.borrow_mut() = members.list_items;
                Ok(shell as Object)
            }
            2 => {
                let shell = Rc::new(SetValue(RefCell::new(Vec::new())));
                self.memo.insert(memo_id, shell.clone() as Object);
                let members = self.decode_members(var, cursor)?;
                *shell.0.borrow_mut() = members.list_items;
                Ok(shell as Object)
            }
            4 => {
                let shell = Rc::new(DictValue(RefCell::new(Vec::new())));
                self.memo.insert(memo_id, shell.clone() as Object);
                let members = self.decode_members(var, cursor)?;
                *shell.0.borrow_mut() = members.dict_items;
                Ok(shell as Object)
            }
            0 | 3 | 5 | 8 | 9 => {
                let members = self.decode_members(var, cursor)?;
                let value: Object = match ctor_tag {
                    0 => Rc::new(Tuple(members.args)),
                    3 => Rc::new(FrozenSetValue(members.list_items)),
                    5 => {
                        let mut args = members.args.into_iter();
                        let code = args
                            .next()
                            .ok_or_else(|| Cursor::malformed(var, "function payload missing code"))?;
                        Rc::new(FunctionValue { code, env: args.collect() })
                    }
                    8 => {
                        let target = members
                            .args
                            .into_iter()
                            .next()
                            .ok_or_else(|| Cursor::malformed(var, "weakref payload missing target"))?;
                        Rc::new(WeakRefValue { target })
                    }
                    9 => Rc::new(OpaqueValue {
                        type_name: custom_name.unwrap_or_default(),
                        args: members.args,
                        state: members.state,
                        list_items: members.list_items,
                        dict_items: members.dict_items,
                    }),
                    _ => unreachable!("matched above"),
                };
                self.memo.insert(memo_id, value.clone());
                Ok(value)
            }
            6 | 7 => Err(Cursor::malformed(
                var,
                "code/module values reduce to CONSTANT or GLOBAL_REF and are never written as a reconstructable container",
            )),
            other => Err(Cursor::malformed(var, &format!("unknown constructor tag {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::persist::DefaultPrimitiveFormatter;
    use crate::serializer::Serializer;
    use std::collections::HashSet;
    use varstate_dispatch::Dispatch;

    fn scalar(n: i64) -> Object {
        Rc::new(Scalar::Int(n))
    }

    fn dump_one(ns: &Namespace, names: &[&str]) -> crate::serializer::Dump {
        let dispatch = Dispatch::new();
        let formatter = DefaultPrimitiveFormatter;
        let serializer = Serializer::new(&dispatch, &formatter);
        let dirty: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
        let component: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
        let components = vec![component];
        serializer.dump(ns, &dirty, &[], &components).next().unwrap()
    }

    #[test]
    fn round_trips_a_list_component() {
        let mut ns = Namespace::new();
        ns.set("xs", Rc::new(List(RefCell::new(vec![scalar(1), scalar(2), scalar(3)]))));

        let dump = dump_one(&ns, &["xs"]);
        let serialized_vars = match dump {
            crate::serializer::Dump::Component { serialized_vars, .. } => serialized_vars,
            other => panic!("expected a component dump, got {other:?}"),
        };
        assert_eq!(serialized_vars.len(), 1);

        let resolver = DefaultGlobalResolver;
        let mut de = Deserializer::new(&resolver);
        let (name, bytes) = &serialized_vars[0];
        let value = de.decode(name, bytes).unwrap();

        let list = value.as_any().downcast_ref::<List>().expect("expected a List");
        let items = list.0.borrow();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn round_trips_shared_substructure_across_two_variables() {
        let mut ns = Namespace::new();
        let shared: Object = Rc::new(List(RefCell::new(vec![scalar(1)])));
        ns.set("a", shared.clone());
        ns.set("wrapper", Rc::new(List(RefCell::new(vec![shared]))));

        let dump = dump_one(&ns, &["a", "wrapper"]);
        let serialized_vars = match dump {
            crate::serializer::Dump::Component { serialized_vars, .. } => serialized_vars,
            other => panic!("expected a component dump, got {other:?}"),
        };
        assert_eq!(serialized_vars.len(), 2);

        let resolver = DefaultGlobalResolver;
        let mut de = Deserializer::new(&resolver);
        let mut decoded = HashMap::new();
        for (name, bytes) in &serialized_vars {
            decoded.insert(name.clone(), de.decode(name, bytes).unwrap());
        }

        let wrapper = decoded["wrapper"].as_any().downcast_ref::<List>().unwrap();
        let inner = wrapper.0.borrow()[0].clone();
        let identity = |obj: &Object| Rc::as_ptr(obj) as *const () as usize;
        assert_eq!(
            identity(&inner),
            identity(&decoded["a"]),
            "a MEMO_REF within one component must resolve to the same object instance"
        );
    }

    #[test]
    fn unregistered_global_ref_errors_with_import() {
        let mut ns = Namespace::new();
        ns.set("m", Rc::new(ModuleValue { name: "os".to_string() }));
        let dump = dump_one(&ns, &["m"]);
        let serialized_vars = match dump {
            crate::serializer::Dump::Component { serialized_vars, .. } => serialized_vars,
            other => panic!("expected a component dump, got {other:?}"),
        };

        struct NeverResolves;
        impl GlobalResolver for NeverResolves {
            fn resolve(&self, _module: &str, _name: &str) -> Option<Object> {
                None
            }
        }

        let resolver = NeverResolves;
        let mut de = Deserializer::new(&resolver);
        let (name, bytes) = &serialized_vars[0];
        let err = de.decode(name, bytes).unwrap_err();
        assert!(matches!(err, ChangeError::Import { .. }));
    }

    #[test]
    fn default_resolver_reconstructs_modules() {
        let mut ns = Namespace::new();
        ns.set("m", Rc::new(ModuleValue { name: "os".to_string() }));
        let dump = dump_one(&ns, &["m"]);
        let serialized_vars = match dump {
            crate::serializer::Dump::Component { serialized_vars, .. } => serialized_vars,
            other => panic!("expected a component dump, got {other:?}"),
        };

        let resolver = DefaultGlobalResolver;
        let mut de = Deserializer::new(&resolver);
        let (name, bytes) = &serialized_vars[0];
        let value = de.decode(name, bytes).unwrap();
        let module = value.as_any().downcast_ref::<ModuleValue>().expect("expected a ModuleValue");
        assert_eq!(module.name, "os");
    }
}
