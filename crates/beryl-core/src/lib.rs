//! Virtual machine and runtime for the Beryl scripting language.
//!
//! A [`Machine`] is one VM state: it owns the program segments, the
//! handle table with its reference-counted lifecycle and mark-sweep
//! collector, the fixed-block memory pools, the native type registry
//! and the compiler that fills the segments. Hosts compile scripts,
//! link, `run`, then call script functions through the call bridge.
//!
//! ```no_run
//! use beryl_core::Machine;
//! use beryl_sdk::CallArg;
//!
//! let mut vm = Machine::new();
//! vm.compile("demo", "function int add(int a, int b) { return a + b; }").unwrap();
//! vm.link().unwrap();
//! vm.run().unwrap();
//! let result = vm.call_function("add", &[CallArg::Int(2), CallArg::Int(3)]).unwrap();
//! ```

pub mod bridge;
pub mod context;
pub mod error;
pub mod fixmem;
pub mod gc;
pub mod handle;
pub mod interpreter;
pub mod machine;
pub mod native;

pub use bridge::FunctionRef;
pub use error::{LibError, Vector, VmError};
pub use fixmem::FixMemStats;
pub use gc::GcStats;
pub use machine::{CallOutcome, Machine};

pub use beryl_sdk::{CallArg, HandleRef};
