//! Call setup
//!
//! Two call paths exist.  The ecma-to-ecma setup reuses the running executor
//! loop (no host recursion): it installs a new activation, or reuses the
//! current one for a tail call, and reports success so the loop reloads its
//! hot state.  Everything else (natives, lightfuncs, constructors, calls
//! arriving from the embedder) goes through `handle_call`, which recurses on
//! the host stack and therefore prevents yielding through it.
//!
//! Stack layout for a call at absolute index `idx`:
//! `[ ... func this arg1 .. argN ]` with `idx` naming the func slot.  The
//! return value replaces the window at `idx`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::CompiledFunction;
use crate::error::JsError;
use crate::heap::Heap;
use crate::object::{ExoticObject, JsFunction, JsObject};
use crate::stack::{Activation, ACT_FLAG_CONSTRUCT, ACT_FLAG_PREVENT_YIELD};
use crate::thread::ThreadId;
use crate::value::{NativeFn, TVal};

// Flags for ecma_call_setup / handle_call.
pub const CALL_FLAG_TAILCALL: u32 = 1 << 0;
pub const CALL_FLAG_CONSTRUCT: u32 = 1 << 1;
/// Host-recursive entry: the new activation must prevent yield.
pub const CALL_FLAG_PREVENT_YIELD: u32 = 1 << 2;
/// Thread bootstrap via resume of an INACTIVE thread.
pub const CALL_FLAG_IS_RESUME: u32 = 1 << 3;

/// Maximum activations per thread; ecma-to-ecma calls do not consume host
/// stack, so they are bounded separately from the host recursion limit.
pub const CALLSTACK_LIMIT: usize = 10_000;
/// Direct eval call; accepted and forwarded, the core has no eval builtin.
pub const CALL_FLAG_DIRECT_EVAL: u32 = 1 << 4;

/// Flatten a bound-function chain in place.  Each link writes its target
/// into the func slot and prepends its bound arguments; the bound `this` is
/// ignored for constructor calls.  Returns the updated argument count.
pub fn resolve_bound_chain(
    heap: &mut Heap,
    tid: ThreadId,
    idx_func: usize,
    mut nargs: usize,
    construct: bool,
) -> Result<usize, JsError> {
    loop {
        let bound = {
            let thr = heap.thread(tid);
            match thr.at(idx_func) {
                TVal::Object(obj) => match &obj.borrow().exotic {
                    ExoticObject::Function(JsFunction::Bound(b)) => Some((**b).clone()),
                    _ => None,
                },
                _ => None,
            }
        };
        let Some(b) = bound else { return Ok(nargs) };
        let thr = heap.thread_mut(tid);
        thr.put_at(idx_func, b.target);
        if !construct {
            thr.put_at(idx_func + 1, b.this_arg);
        }
        let insert_at = idx_func + 2;
        nargs += b.bound_args.len();
        thr.valstack.splice(insert_at..insert_at, b.bound_args);
    }
}

enum Target {
    Compiled(Rc<CompiledFunction>),
    Native(NativeFn),
    NotCallable,
}

fn classify(func: &TVal) -> Target {
    match func {
        TVal::Object(obj) => match &obj.borrow().exotic {
            ExoticObject::Function(JsFunction::Compiled(c)) => Target::Compiled(c.template.clone()),
            ExoticObject::Function(JsFunction::Native(n)) => Target::Native(n.func),
            // Bound chains are resolved before classification.
            ExoticObject::Function(JsFunction::Bound(_)) => Target::NotCallable,
            _ => Target::NotCallable,
        },
        TVal::Lightfunc(lf) => Target::Native(lf.func),
        _ => Target::NotCallable,
    }
}

/// Effective `this` binding for a compiled callee (E5 Section 10.4.3):
/// strict functions take it verbatim; sloppy functions map null/undefined to
/// the global object and wrap primitives.
fn coerce_this(heap: &mut Heap, tid: ThreadId, idx_func: usize, strict: bool) -> Result<(), JsError> {
    if strict {
        return Ok(());
    }
    let this = heap.thread(tid).at(idx_func + 1);
    let coerced = match this {
        TVal::Null | TVal::Undefined => TVal::Object(heap.global.clone()),
        TVal::String(_) | TVal::Number(_) | TVal::Boolean(_) => {
            TVal::Object(heap.to_object(&this)?)
        }
        other => other,
    };
    heap.thread_mut(tid).put_at(idx_func + 1, coerced);
    Ok(())
}

/// Ecma-to-ecma call setup.
///
/// Resolves the bound chain, rejects non-compiled targets (returns false so
/// the caller falls back to `handle_call`), then pushes a fresh activation or
/// reuses the current one for a tail call.  On success the executor restarts
/// its hot-variable reload and continues inside the callee.
pub fn ecma_call_setup(
    heap: &mut Heap,
    tid: ThreadId,
    idx_func: usize,
    nargs: usize,
    flags: u32,
) -> Result<bool, JsError> {
    let construct = flags & CALL_FLAG_CONSTRUCT != 0;
    let nargs = resolve_bound_chain(heap, tid, idx_func, nargs, construct)?;

    let func_val = heap.thread(tid).at(idx_func);
    let fun = match classify(&func_val) {
        Target::Compiled(fun) => fun,
        _ => return Ok(false),
    };

    coerce_this(heap, tid, idx_func, fun.strict)?;

    let nregs = fun.nregs as usize;
    let mut act_flags = 0;
    if construct {
        act_flags |= ACT_FLAG_CONSTRUCT | ACT_FLAG_PREVENT_YIELD;
    }
    if flags & CALL_FLAG_PREVENT_YIELD != 0 {
        act_flags |= ACT_FLAG_PREVENT_YIELD;
    }

    // A tail call reuses the current activation.  Rejected when the frame
    // has active catchers, prevents yield, or is a constructor call.
    let tailcall_ok = flags & CALL_FLAG_TAILCALL != 0 && act_flags == 0 && {
        let thr = heap.thread(tid);
        match thr.callstack.last() {
            Some(act) => {
                let act_idx = thr.callstack.len() - 1;
                act.compiled().is_some()
                    && act.flags & (ACT_FLAG_CONSTRUCT | ACT_FLAG_PREVENT_YIELD) == 0
                    && !thr
                        .catchstack
                        .iter()
                        .any(|cat| cat.callstack_index == act_idx)
            }
            None => false,
        }
    };

    if tailcall_ok {
        let (dest_bottom, old_lex, old_var, env_owned) = {
            let thr = heap.thread_mut(tid);
            let act = match thr.callstack.last_mut() {
                Some(act) => act,
                None => return Err(JsError::internal("tail call without a frame")),
            };
            let dest_bottom = act.idx_bottom;
            let old_lex = act.lex_env.take();
            let old_var = act.var_env.take();
            let env_owned = act.flags & crate::stack::ACT_FLAG_ENV_OWNED != 0;
            act.func = func_val;
            act.pc = 0;
            act.flags = 0;
            (dest_bottom, old_lex, old_var, env_owned)
        };
        if env_owned {
            if let Some(lex) = old_lex {
                if old_var != Some(lex) {
                    heap.envs.free_if_uncaptured(lex);
                }
            }
            if let Some(var) = old_var {
                heap.envs.free_if_uncaptured(var);
            }
        }
        let thr = heap.thread_mut(tid);
        // Slide func/this/args down over the old frame.  The source window
        // is always at or above the destination, so an ascending copy is
        // safe.
        for i in 0..nargs + 2 {
            let v = thr.at(idx_func + i);
            thr.put_at(dest_bottom - 2 + i, v);
        }
        thr.bottom = dest_bottom;
        if nargs < nregs {
            thr.set_top(dest_bottom + nargs);
        }
        thr.set_top(dest_bottom + nregs);
        return Ok(true);
    }

    let thr = heap.thread_mut(tid);
    if thr.callstack.len() >= CALLSTACK_LIMIT {
        return Err(JsError::range_error("callstack limit"));
    }
    if let Some(caller) = thr.callstack.last_mut() {
        caller.idx_retval = idx_func;
    }
    thr.callstack.push(Activation {
        func: func_val,
        pc: 0,
        idx_bottom: idx_func + 2,
        idx_retval: idx_func,
        lex_env: None,
        var_env: None,
        flags: act_flags,
    });
    if act_flags & ACT_FLAG_PREVENT_YIELD != 0 {
        thr.preventcount += 1;
    }
    thr.bottom = idx_func + 2;
    if nargs < nregs {
        thr.set_top(idx_func + 2 + nargs);
    }
    thr.set_top(idx_func + 2 + nregs);
    Ok(true)
}

/// Host-recursive call path for natives, lightfuncs, constructors and
/// embedder entry.  On success the stack window `[func this args..]` at
/// `idx_func` is replaced by the single return value.
pub fn handle_call(
    heap: &mut Heap,
    idx_func: usize,
    nargs: usize,
    flags: u32,
) -> Result<(), JsError> {
    let tid = heap.current;
    if heap.call_recursion_depth + 1 > heap.call_recursion_limit {
        return Err(JsError::range_error("call recursion depth limit"));
    }
    let construct = flags & CALL_FLAG_CONSTRUCT != 0;
    let nargs = resolve_bound_chain(heap, tid, idx_func, nargs, construct)?;
    let func_val = heap.thread(tid).at(idx_func);

    if construct {
        // Fresh object with the callee's prototype property; becomes `this`
        // and, unless the constructor returns an object, the call result.
        let proto = heap.get_prop(&func_val, &TVal::from("prototype"))?;
        let obj = JsObject::with_prototype(proto.as_object().cloned());
        heap.thread_mut(tid)
            .put_at(idx_func + 1, TVal::Object(Rc::new(RefCell::new(obj))));
    }

    let saved_calls = heap.thread(tid).callstack.len();
    let saved_catch = heap.thread(tid).catchstack.len();
    let saved_bottom = heap.thread(tid).bottom;
    let saved_depth = heap.call_recursion_depth;

    let result = match classify(&func_val) {
        Target::Native(native) => {
            {
                let thr = heap.thread_mut(tid);
                if let Some(caller) = thr.callstack.last_mut() {
                    caller.idx_retval = idx_func;
                }
                thr.callstack.push(Activation {
                    func: func_val.clone(),
                    pc: 0,
                    idx_bottom: idx_func + 2,
                    idx_retval: idx_func,
                    lex_env: None,
                    var_env: None,
                    flags: ACT_FLAG_PREVENT_YIELD
                        | if construct { ACT_FLAG_CONSTRUCT } else { 0 },
                });
                thr.preventcount += 1;
            }
            heap.call_recursion_depth += 1;
            let this = heap.thread(tid).at(idx_func + 1);
            let args: Vec<TVal> = (0..nargs)
                .map(|i| heap.thread(tid).at(idx_func + 2 + i))
                .collect();
            let r = native(heap, this, &args);
            heap.call_recursion_depth = saved_depth;
            r
        }
        Target::Compiled(_) => {
            let setup_flags = CALL_FLAG_PREVENT_YIELD
                | if construct { CALL_FLAG_CONSTRUCT } else { 0 };
            let did = ecma_call_setup(heap, tid, idx_func, nargs, setup_flags)?;
            debug_assert!(did);
            heap.call_recursion_depth += 1;
            let r = crate::executor::execute(heap);
            heap.call_recursion_depth = saved_depth;
            // On normal completion the return value sits on the value-stack
            // top of the entry thread.
            r.map(|()| {
                heap.thread_mut(tid)
                    .valstack
                    .pop()
                    .unwrap_or(TVal::Undefined)
            })
        }
        Target::NotCallable => Err(JsError::type_error("call target not callable")),
    };

    match result {
        Ok(mut retval) => {
            if construct && !retval.is_object() {
                retval = heap.thread(tid).at(idx_func + 1);
            }
            heap.unwind_catchstack(tid, saved_catch);
            heap.unwind_callstack(tid, saved_calls);
            let thr = heap.thread_mut(tid);
            thr.set_top(idx_func);
            thr.push(retval);
            thr.bottom = saved_bottom;
            Ok(())
        }
        // A non-local transfer leaves the stacks exactly as the transfer
        // needs them; the unwinder owns the cleanup.
        Err(JsError::Unwind) => Err(JsError::Unwind),
        Err(e) => {
            heap.unwind_catchstack(tid, saved_catch);
            heap.unwind_callstack(tid, saved_calls);
            let thr = heap.thread_mut(tid);
            thr.set_top(idx_func);
            thr.bottom = saved_bottom;
            Err(e)
        }
    }
}

/// Convenience wrapper used by accessors, coercions and the embedder API:
/// pushes a call window on top of the current frame and runs `handle_call`.
pub fn call_value(
    heap: &mut Heap,
    func: TVal,
    this: TVal,
    args: &[TVal],
) -> Result<TVal, JsError> {
    let tid = heap.current;
    let idx_func = heap.thread(tid).top();
    {
        let thr = heap.thread_mut(tid);
        thr.push(func);
        thr.push(this);
        for a in args {
            thr.push(a.clone());
        }
    }
    match handle_call(heap, idx_func, args.len(), 0) {
        Ok(()) => {
            let thr = heap.thread_mut(tid);
            let v = thr.valstack.pop().unwrap_or(TVal::Undefined);
            debug_assert_eq!(thr.top(), idx_func);
            Ok(v)
        }
        Err(JsError::Unwind) => Err(JsError::Unwind),
        Err(e) => {
            let thr = heap.thread_mut(tid);
            if thr.top() > idx_func {
                thr.set_top(idx_func);
            }
            Err(e)
        }
    }
}

/// Constructor invocation (`new` with host recursion).
pub fn construct_value(
    heap: &mut Heap,
    func: TVal,
    args: &[TVal],
) -> Result<TVal, JsError> {
    let tid = heap.current;
    let idx_func = heap.thread(tid).top();
    {
        let thr = heap.thread_mut(tid);
        thr.push(func);
        thr.push(TVal::Undefined);
        for a in args {
            thr.push(a.clone());
        }
    }
    match handle_call(heap, idx_func, args.len(), CALL_FLAG_CONSTRUCT) {
        Ok(()) => {
            let thr = heap.thread_mut(tid);
            Ok(thr.valstack.pop().unwrap_or(TVal::Undefined))
        }
        Err(JsError::Unwind) => Err(JsError::Unwind),
        Err(e) => {
            let thr = heap.thread_mut(tid);
            if thr.top() > idx_func {
                thr.set_top(idx_func);
            }
            Err(e)
        }
    }
}
