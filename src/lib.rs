//! Embeddable ECMAScript 5 bytecode execution core
//!
//! The crate accepts compiled functions (register-based instructions with a
//! constant pool and inner-function templates) and runs them to completion
//! on cooperative threads.  The compiler front-end is external; functions
//! are assembled through [`FunctionBuilder`].
//!
//! # Example
//!
//! ```
//! use esrun::{FunctionBuilder, Opcode, TVal, Vm};
//!
//! // function add(a, b) { return a + b; }
//! let mut b = FunctionBuilder::new(2);
//! b.binop(Opcode::Add, 2, 0, 1);
//! b.ret(2);
//! let add = b.build();
//!
//! let mut vm = Vm::new();
//! let func = vm.closure(add);
//! let result = vm
//!     .call(func, TVal::Undefined, &[TVal::Number(3.0), TVal::Number(4.0)])
//!     .unwrap();
//! assert_eq!(result.as_number(), Some(7.0));
//! ```

pub mod bytecode;
pub mod call;
pub mod coerce;
pub mod env;
pub mod error;
mod executor;
pub mod heap;
pub mod object;
pub mod stack;
pub mod thread;
pub mod unwind;
pub mod value;

use std::rc::Rc;

pub use bytecode::{CompiledFunction, ExtraOp, FunctionBuilder, Ins, Opcode};
pub use error::JsError;
pub use heap::{Heap, LjType};
pub use object::{JsFunction, JsObject, ObjectRef, Property, PropertyKey};
pub use thread::{ThreadId, ThreadState};
pub use value::{JsBuffer, JsString, LightFunc, NativeFn, TVal};

/// The embedder-facing virtual machine: a heap plus the entry points for
/// calling into compiled code and managing coroutine threads.
pub struct Vm {
    pub heap: Heap,
}

impl Vm {
    pub fn new() -> Self {
        Self { heap: Heap::new() }
    }

    /// Instantiate a closure over `template` with the global environment as
    /// its scope.
    pub fn closure(&mut self, template: Rc<CompiledFunction>) -> TVal {
        TVal::Object(object::create_closure(template, None))
    }

    /// Wrap a native Rust function into a callable function object.
    pub fn native_function(&mut self, name: &str, func: NativeFn, arity: usize) -> TVal {
        TVal::Object(object::create_native_function(name, func, arity))
    }

    /// Call a function value.  On normal completion returns the single
    /// result value; a thrown value surfaces as `JsError::Thrown`.
    pub fn call(&mut self, func: TVal, this: TVal, args: &[TVal]) -> Result<TVal, JsError> {
        call::call_value(&mut self.heap, func, this, args)
    }

    /// Constructor invocation (`new func(args...)`).
    pub fn construct(&mut self, func: TVal, args: &[TVal]) -> Result<TVal, JsError> {
        call::construct_value(&mut self.heap, func, args)
    }

    /// Create an INACTIVE coroutine thread whose body is `func`; drive it
    /// with the `resume` builtin.
    pub fn spawn(&mut self, func: TVal) -> Result<TVal, JsError> {
        self.heap.spawn_thread(func)
    }

    /// Install the coroutine builtins (`resume`, `yield`) as globals, the
    /// way an embedder would surface them to compiled code.
    pub fn install_thread_builtins(&mut self) {
        let resume = self.native_function("resume", thread::thread_resume, 3);
        self.heap.define_global("resume", resume);
        let yield_fn = self.native_function("yield", thread::thread_yield, 2);
        self.heap.define_global("yield", yield_fn);
    }

    /// Define a property on the global object.
    pub fn define_global(&mut self, name: &str, value: TVal) {
        self.heap.define_global(name, value);
    }

    /// Bound the number of executed instructions; exceeding the budget
    /// raises a RangeError through the normal throw path.
    pub fn set_step_limit(&mut self, limit: Option<u64>) {
        self.heap.set_step_limit(limit);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
