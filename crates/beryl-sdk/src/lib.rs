//! Native type contract for embedding hosts.
//!
//! A native type exposes one procedure to the runtime: [`NativeType::
//! dispatch`], which receives every lifecycle and call message. The
//! informational queries (class name, declaration string, authorship)
//! are plain trait methods because they are pure reads.
//!
//! The declaration string is a Beryl class declaration; the runtime
//! compiles it exactly like a source file when the type is registered,
//! resolving referenced classes through the package list. A type whose
//! declaration fails to compile is not registered.
//!
//! This crate deliberately knows nothing about the VM internals, so
//! native modules build against it alone.

#![warn(missing_docs)]

use std::any::Any;
use thiserror::Error;

/// Interface version the runtime checks at registration. Bumped when the
/// message contract changes incompatibly.
pub const NTL_INTERFACE_VERSION: u32 = 3;

/// Opaque reference to a runtime handle.
///
/// Index 0 is always the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRef(pub u32);

impl HandleRef {
    /// The null handle.
    pub const NULL: HandleRef = HandleRef(0);

    /// True for the null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Payload of one native object, owned by the handle that wraps it.
pub type NativeObject = Box<dyn Any>;

/// Errors a native type may report back to the runtime.
#[derive(Debug, Clone, Error)]
pub enum NativeError {
    /// An argument slot held a different type than requested.
    #[error("argument {slot}: expected {expected}")]
    TypeMismatch {
        /// Argument slot index.
        slot: usize,
        /// Expected type name.
        expected: &'static str,
    },

    /// Argument slot out of range.
    #[error("argument slot {0} out of range")]
    BadSlot(usize),

    /// The function index is not one the type declares.
    #[error("unknown native function index {0}")]
    UnknownFunction(u32),

    /// The message is not supported by this type.
    #[error("unsupported native message")]
    Unsupported,

    /// Free-form failure raised by native code.
    #[error("{0}")]
    Custom(String),
}

/// Typed argument for the variadic native-to-script call bridge.
///
/// Hosts build the argument list explicitly; the bridge validates each
/// tag against the callee signature instead of converting silently.
#[derive(Debug, Clone)]
pub enum CallArg {
    /// Integer argument.
    Int(i64),
    /// Float argument.
    Float(f64),
    /// String argument.
    Str(String),
    /// Pre-existing handle argument.
    Handle(HandleRef),
}

/// Argument and return-value access for one native call.
///
/// Implemented by the VM; handed to the native type with `CallStatic`
/// and `CallMember` messages. Slots are 0-based in declaration order.
pub trait CallFrame {
    /// Number of argument slots.
    fn arg_count(&self) -> usize;
    /// Read an integer argument.
    fn arg_int(&self, slot: usize) -> Result<i64, NativeError>;
    /// Read a float argument.
    fn arg_float(&self, slot: usize) -> Result<f64, NativeError>;
    /// Read a string argument.
    fn arg_string(&self, slot: usize) -> Result<String, NativeError>;
    /// Read any argument as a handle reference.
    fn arg_handle(&self, slot: usize) -> Result<HandleRef, NativeError>;
    /// Return an integer.
    fn ret_int(&mut self, value: i64);
    /// Return a float.
    fn ret_float(&mut self, value: f64);
    /// Return a string.
    fn ret_string(&mut self, value: &str);
    /// Return an existing handle.
    fn ret_handle(&mut self, value: HandleRef);
}

/// Receives handle references during a garbage-collection mark pass.
pub trait HandleMarker {
    /// Mark one handle as reachable.
    fn mark(&mut self, handle: HandleRef);
}

/// Lifecycle and call messages delivered to a native type procedure.
pub enum NativeMessage<'a> {
    /// Type is being registered with a runtime.
    Register,
    /// Runtime initialization; the type table is final.
    Initialize,
    /// Produce a new object instance.
    NewObject {
        /// Receives the created object.
        out: &'a mut Option<NativeObject>,
    },
    /// The wrapping handle is going away; release the object.
    DestroyObject {
        /// The object being destroyed.
        object: NativeObject,
    },
    /// GC mark pass: report every handle the object owns.
    MarkHandles {
        /// Object being scanned.
        object: &'a mut NativeObject,
        /// Marker to call once per owned handle.
        marker: &'a mut dyn HandleMarker,
    },
    /// Static method call.
    CallStatic {
        /// Index of the function within the declaration, in order.
        func_idx: u32,
        /// Argument and return-value access.
        frame: &'a mut dyn CallFrame,
    },
    /// Member method call on an instance.
    CallMember {
        /// Index of the function within the declaration, in order.
        func_idx: u32,
        /// The receiver object.
        object: &'a mut NativeObject,
        /// Argument and return-value access.
        frame: &'a mut dyn CallFrame,
    },
    /// Runtime is shutting down.
    Terminate,
    /// Type is being removed from the registry.
    Unregister,
}

/// A native type: one procedure plus informational queries.
pub trait NativeType {
    /// Script-visible class name.
    fn class_name(&self) -> &str;

    /// Full class declaration in Beryl source form, tag comments
    /// included. Compiled verbatim at registration.
    fn declaration(&self) -> &str;

    /// Comma-separated list of imports the declaration needs.
    fn package_list(&self) -> &str {
        ""
    }

    /// Contract version this type was built against.
    fn interface_version(&self) -> u32 {
        NTL_INTERFACE_VERSION
    }

    /// Version of the type itself, for host bookkeeping.
    fn author_version(&self) -> u32 {
        0
    }

    /// Author name.
    fn author_name(&self) -> &str {
        ""
    }

    /// Free-form description.
    fn author_string(&self) -> &str {
        ""
    }

    /// Build time stamp.
    fn build_stamp(&self) -> &str {
        ""
    }

    /// Name of the interface this type implements, if any.
    fn base_name(&self) -> &str {
        ""
    }

    /// The single procedure all lifecycle and call traffic goes through.
    fn dispatch(&mut self, msg: NativeMessage<'_>) -> Result<(), NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        live: usize,
    }

    struct CounterObj {
        value: i64,
    }

    impl NativeType for Counter {
        fn class_name(&self) -> &str {
            "counter"
        }

        fn declaration(&self) -> &str {
            "class counter { method counter(); method int get(); }"
        }

        fn dispatch(&mut self, msg: NativeMessage<'_>) -> Result<(), NativeError> {
            match msg {
                NativeMessage::NewObject { out } => {
                    self.live += 1;
                    *out = Some(Box::new(CounterObj { value: 7 }));
                    Ok(())
                }
                NativeMessage::DestroyObject { .. } => {
                    self.live -= 1;
                    Ok(())
                }
                NativeMessage::CallMember {
                    func_idx: 1,
                    object,
                    frame,
                } => {
                    let obj = object.downcast_ref::<CounterObj>().unwrap();
                    frame.ret_int(obj.value);
                    Ok(())
                }
                NativeMessage::Register
                | NativeMessage::Initialize
                | NativeMessage::Terminate
                | NativeMessage::Unregister => Ok(()),
                _ => Err(NativeError::Unsupported),
            }
        }
    }

    struct FakeFrame {
        ret: Option<i64>,
    }

    impl CallFrame for FakeFrame {
        fn arg_count(&self) -> usize {
            0
        }
        fn arg_int(&self, slot: usize) -> Result<i64, NativeError> {
            Err(NativeError::BadSlot(slot))
        }
        fn arg_float(&self, slot: usize) -> Result<f64, NativeError> {
            Err(NativeError::BadSlot(slot))
        }
        fn arg_string(&self, slot: usize) -> Result<String, NativeError> {
            Err(NativeError::BadSlot(slot))
        }
        fn arg_handle(&self, slot: usize) -> Result<HandleRef, NativeError> {
            Err(NativeError::BadSlot(slot))
        }
        fn ret_int(&mut self, value: i64) {
            self.ret = Some(value);
        }
        fn ret_float(&mut self, _: f64) {}
        fn ret_string(&mut self, _: &str) {}
        fn ret_handle(&mut self, _: HandleRef) {}
    }

    #[test]
    fn test_object_lifecycle() {
        let mut ty = Counter { live: 0 };
        let mut out = None;
        ty.dispatch(NativeMessage::NewObject { out: &mut out }).unwrap();
        assert_eq!(ty.live, 1);
        let mut object = out.unwrap();

        let mut frame = FakeFrame { ret: None };
        ty.dispatch(NativeMessage::CallMember {
            func_idx: 1,
            object: &mut object,
            frame: &mut frame,
        })
        .unwrap();
        assert_eq!(frame.ret, Some(7));

        ty.dispatch(NativeMessage::DestroyObject { object }).unwrap();
        assert_eq!(ty.live, 0);
    }

    #[test]
    fn test_null_handle() {
        assert!(HandleRef::NULL.is_null());
        assert!(!HandleRef(3).is_null());
    }
}
