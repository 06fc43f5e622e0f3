//! Integration tests for the bytecode executor, organized by feature
//!
//! The compiler front-end is an external collaborator, so these tests
//! assemble the bytecode a compiler would emit and drive it through the
//! public Vm API.

mod basics;
mod calls;
mod control_flow;
mod limits;
mod object_ops;

use esrun::{FunctionBuilder, JsError, TVal, Vm};

/// Assemble a zero-argument function and run it to completion.
pub fn run(build: impl FnOnce(&mut FunctionBuilder)) -> TVal {
    try_run(build).expect("execution failed")
}

/// Assemble a zero-argument function and run it, surfacing errors.
pub fn try_run(build: impl FnOnce(&mut FunctionBuilder)) -> Result<TVal, JsError> {
    let mut vm = Vm::new();
    try_run_in(&mut vm, build)
}

/// Same, against a caller-provided Vm (for tests that pre-seed globals).
pub fn try_run_in(
    vm: &mut Vm,
    build: impl FnOnce(&mut FunctionBuilder),
) -> Result<TVal, JsError> {
    let mut b = FunctionBuilder::new(0);
    build(&mut b);
    let func = vm.closure(b.build());
    vm.call(func, TVal::Undefined, &[])
}

/// Extract the thrown value from an error result.
pub fn thrown(result: Result<TVal, JsError>) -> TVal {
    match result {
        Err(JsError::Thrown { value }) => value,
        other => panic!("expected a thrown value, got {:?}", other),
    }
}

/// Read the `name` property of a thrown error object.
pub fn error_name(vm: &mut Vm, value: &TVal) -> String {
    vm.heap
        .get_prop(value, &TVal::from("name"))
        .expect("error name")
        .as_str()
        .unwrap_or("<none>")
        .to_string()
}
