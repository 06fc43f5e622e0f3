//! Bytecode executor
//!
//! The main loop re-derives its hot state (current thread, activation,
//! function, strictness) on every iteration: any operation that allocates,
//! releases a reference or calls back into user code may have moved the
//! stacks or switched threads, so nothing is cached across an instruction.
//!
//! Non-local transfers arm the heap's longjmp state and surface as the
//! `JsError::Unwind` sentinel; the catchpoint at the bottom of `execute`
//! feeds them to the unwinder and acts on its verdict.  Ordinary errors are
//! converted to THROW transfers at the same point.

use crate::bytecode::{
    CompiledFunction, ExtraOp, Ins, Opcode, CALL_FLAG_EVALCALL, CALL_FLAG_TAILCALL,
    DECLVAR_FLAG_FUNC_DECL, DECLVAR_FLAG_UNDEF_VALUE, JUMP_BIAS, LDINTX_SHIFT, LDINT_BIAS,
    PROP_FLAGS_MASK, REGLIMIT, RETURN_FLAG_HAVE_RETVAL, TRYCATCH_FLAG_CATCH_BINDING,
    TRYCATCH_FLAG_HAVE_CATCH, TRYCATCH_FLAG_HAVE_FINALLY, TRYCATCH_FLAG_WITH_BINDING,
};
use crate::call;
use crate::coerce::{Hint, COMPARE_EVAL_LEFT_FIRST, COMPARE_NEGATE};
use crate::error::JsError;
use crate::heap::{Heap, LjType};
use crate::object::{create_closure, set_array_length, Property, PropertyKey};
use crate::stack::{Catcher, CAT_FLAG_CATCH_BINDING_ENABLED, CAT_FLAG_CATCH_ENABLED,
    CAT_FLAG_FINALLY_ENABLED, CAT_FLAG_LEXENV_ACTIVE, CAT_TYPE_LABEL,
};
use crate::thread::ThreadId;
use crate::unwind::{handle_longjmp, LongjmpResult};
use crate::value::{normalize_number, JsString, TVal};

/// Run the current thread from its current activation until the entry
/// activation returns (the return value is left on the entry thread's
/// value-stack top) or an uncaught error surfaces.
pub(crate) fn execute(heap: &mut Heap) -> Result<(), JsError> {
    let entry_thread = heap.current;
    let entry_callstack_top = heap.thread(entry_thread).callstack.len();
    let entry_recursion_depth = heap.call_recursion_depth;
    debug_assert!(entry_callstack_top >= 1);

    loop {
        let err = run(heap);

        // Catchpoint: restore recursion accounting, then dispatch.
        heap.call_recursion_depth = entry_recursion_depth;
        match err {
            JsError::Unwind => {
                debug_assert!(heap.lj.ty != LjType::Unknown);
            }
            other => heap.arm_throw(&other),
        }

        match handle_longjmp(heap, entry_thread, entry_callstack_top) {
            Ok(LongjmpResult::Restart) => continue,
            Ok(LongjmpResult::Finished) => return Ok(()),
            Ok(LongjmpResult::Rethrow) => {
                let value = heap.lj.value1.clone();
                heap.wipe_ljstate();
                return Err(JsError::thrown(value));
            }
            Err(fatal) => {
                heap.wipe_ljstate();
                return Err(fatal);
            }
        }
    }
}

/// The dispatch loop proper; only ever exits by returning the error or
/// unwind sentinel that interrupted it.
fn run(heap: &mut Heap) -> JsError {
    loop {
        let tid = heap.current;

        // Interrupt counter check, kept hot on the thread.
        let tripped = {
            let thr = heap.thread_mut(tid);
            let ctr = thr.interrupt_counter;
            if ctr > 0 {
                thr.interrupt_counter = ctr - 1;
                false
            } else {
                true
            }
        };
        if tripped {
            if let Err(e) = heap.executor_interrupt() {
                return e;
            }
        }

        // Fetch: the activation may have relocated, re-derive everything.
        let (fun, ins) = {
            let thr = heap.thread_mut(tid);
            let Some(act) = thr.callstack.last_mut() else {
                return JsError::internal("executor running with empty callstack");
            };
            let Some(fun) = act.compiled() else {
                return JsError::internal("executor activation is not compiled");
            };
            let pc = act.pc;
            act.pc += 1;
            let Some(ins) = fun.code.get(pc).copied() else {
                return JsError::internal("program counter out of bounds");
            };
            (fun, ins)
        };
        debug_assert_eq!(
            heap.thread(tid).top(),
            heap.thread(tid).bottom + fun.nregs as usize
        );

        if let Err(e) = step(heap, tid, &fun, ins) {
            return e;
        }
    }
}

fn internal(msg: &str) -> JsError {
    JsError::internal(msg)
}

/// Read a B/C operand: register below REGLIMIT, constant-pool entry above.
fn regconst(heap: &Heap, tid: ThreadId, fun: &CompiledFunction, x: u32) -> Result<TVal, JsError> {
    if x < REGLIMIT {
        Ok(heap.thread(tid).reg(x))
    } else {
        fun.consts
            .get((x - REGLIMIT) as usize)
            .cloned()
            .ok_or_else(|| internal("constant index out of bounds"))
    }
}

fn const_at(fun: &CompiledFunction, idx: u32) -> Result<TVal, JsError> {
    fun.consts
        .get(idx as usize)
        .cloned()
        .ok_or_else(|| internal("constant index out of bounds"))
}

fn const_string(fun: &CompiledFunction, idx: u32) -> Result<JsString, JsError> {
    match const_at(fun, idx)? {
        TVal::String(s) => Ok(s),
        _ => Err(internal("name constant is not a string")),
    }
}

fn regconst_string(
    heap: &Heap,
    tid: ThreadId,
    fun: &CompiledFunction,
    x: u32,
) -> Result<JsString, JsError> {
    match regconst(heap, tid, fun, x)? {
        TVal::String(s) => Ok(s),
        _ => Err(internal("name operand is not a string")),
    }
}

/// Resolve an indirect operand: the register holds the real index.
fn indirect(heap: &Heap, tid: ThreadId, reg: u32) -> Result<u32, JsError> {
    match heap.thread(tid).reg(reg) {
        TVal::Number(n) => Ok(n as u32),
        _ => Err(internal("indirect operand is not a number")),
    }
}

fn top_act_index(heap: &Heap, tid: ThreadId) -> usize {
    heap.thread(tid).callstack.len() - 1
}

/// Execute one decoded instruction.
fn step(heap: &mut Heap, tid: ThreadId, fun: &CompiledFunction, ins: Ins) -> Result<(), JsError> {
    let op = Opcode::from_raw(ins.op_raw()).ok_or_else(|| internal("invalid opcode"))?;
    let strict = fun.strict;

    match op {
        // ═══════════════════════════════════════════════════════════════════
        // Loads and stores
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Ldreg => {
            let v = heap.thread(tid).reg(ins.bc());
            heap.thread_mut(tid).set_reg(ins.a(), v);
        }

        Opcode::Streg => {
            let v = heap.thread(tid).reg(ins.a());
            heap.thread_mut(tid).set_reg(ins.bc(), v);
        }

        Opcode::Ldconst => {
            let v = const_at(fun, ins.bc())?;
            heap.thread_mut(tid).set_reg(ins.a(), v);
        }

        Opcode::Ldint => {
            let val = ins.bc() as i32 - LDINT_BIAS;
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Number(val as f64));
        }

        Opcode::Ldintx => {
            let a = ins.a();
            let old = match heap.thread(tid).reg(a) {
                TVal::Number(n) => n,
                _ => return Err(internal("LDINTX target not a number")),
            };
            let val = old * (1u64 << LDINTX_SHIFT) as f64 + ins.bc() as f64;
            heap.thread_mut(tid).set_reg(a, TVal::Number(val));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Object and array literal initializers
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Mputobj | Opcode::Mputobji => {
            let obj = match heap.thread(tid).reg(ins.a()) {
                TVal::Object(o) => o,
                _ => return Err(internal("MPUTOBJ target not an object")),
            };
            let mut idx = ins.b();
            if op == Opcode::Mputobji {
                idx = indirect(heap, tid, idx)?;
            }
            let count = ins.c();
            for i in 0..count {
                let key = match heap.thread(tid).reg(idx + i * 2) {
                    TVal::String(s) => s,
                    _ => return Err(internal("MPUTOBJ key not a string")),
                };
                let value = heap.thread(tid).reg(idx + i * 2 + 1);
                obj.borrow_mut()
                    .define_property(PropertyKey::from(key), Property::data(value));
            }
        }

        Opcode::Mputarr | Opcode::Mputarri => {
            let obj = match heap.thread(tid).reg(ins.a()) {
                TVal::Object(o) => o,
                _ => return Err(internal("MPUTARR target not an object")),
            };
            let mut idx = ins.b();
            if op == Opcode::Mputarri {
                idx = indirect(heap, tid, idx)?;
            }
            let count = ins.c();
            let mut arr_idx = match heap.thread(tid).reg(idx) {
                TVal::Number(n) => n as u32,
                _ => return Err(internal("MPUTARR start index not a number")),
            };
            for i in 0..count {
                let value = heap.thread(tid).reg(idx + 1 + i);
                obj.borrow_mut()
                    .define_property(PropertyKey::Index(arr_idx), Property::data(value));
                arr_idx += 1;
            }
            set_array_length(&obj, arr_idx);
        }

        // ═══════════════════════════════════════════════════════════════════
        // Constructor calls
        // ═══════════════════════════════════════════════════════════════════
        Opcode::New | Opcode::Newi => {
            let nargs = ins.c() as usize;
            let mut idx = ins.b();
            if op == Opcode::Newi {
                idx = indirect(heap, tid, idx)?;
            }
            let bottom = heap.thread(tid).bottom;
            let src = bottom + idx as usize;
            // Build [ctor this args..] above the frame; the constructor may
            // be anything, handle_call checks callability.
            let window = heap.thread(tid).top();
            {
                let thr = heap.thread_mut(tid);
                let ctor = thr.at(src);
                thr.push(ctor);
                thr.push(TVal::Undefined);
                for i in 0..nargs {
                    let v = thr.at(src + 1 + i);
                    thr.push(v);
                }
            }
            call::handle_call(heap, window, nargs, call::CALL_FLAG_CONSTRUCT)?;
            let thr = heap.thread_mut(tid);
            let ret = thr.at(window);
            thr.put_at(src, ret);
            let bottom = thr.bottom;
            thr.set_top(bottom + fun.nregs as usize);
        }

        Opcode::Regexp => {
            let source = {
                let v = regconst(heap, tid, fun, ins.c())?;
                self_to_string(heap, &v)?
            };
            let flags = {
                let v = regconst(heap, tid, fun, ins.b())?;
                self_to_string(heap, &v)?
            };
            let obj = heap.create_regexp_instance(source, flags);
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Object(obj));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Call setup helpers (this-binding per E5 Section 10.4.3)
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Csreg | Opcode::Csregi => {
            // Declarative binding: 'this' is undefined.
            let mut idx = ins.a();
            if op == Opcode::Csregi {
                idx = indirect(heap, tid, idx)?;
            }
            let v = heap.thread(tid).reg(ins.b());
            let thr = heap.thread_mut(tid);
            thr.set_reg(idx, v);
            thr.set_reg(idx + 1, TVal::Undefined);
        }

        Opcode::Csvar | Opcode::Csvari => {
            let name = regconst_string(heap, tid, fun, ins.b())?;
            let act_idx = top_act_index(heap, tid);
            let scope = heap.activation_scope(tid, act_idx);
            let (value, this) = heap
                .getvar(Some(scope), &name, true)?
                .ok_or_else(|| internal("CSVAR resolution failed"))?;
            let mut idx = ins.a();
            if op == Opcode::Csvari {
                idx = indirect(heap, tid, idx)?;
            }
            let thr = heap.thread_mut(tid);
            thr.set_reg(idx, value);
            thr.set_reg(idx + 1, this);
        }

        Opcode::Csprop | Opcode::Cspropi => {
            let obj = heap.thread(tid).reg(ins.b());
            let key = regconst(heap, tid, fun, ins.c())?;
            let value = heap.get_prop(&obj, &key)?;
            let mut idx = ins.a();
            if op == Opcode::Cspropi {
                idx = indirect(heap, tid, idx)?;
            }
            let thr = heap.thread_mut(tid);
            thr.set_reg(idx, value);
            thr.set_reg(idx + 1, obj);
        }

        // ═══════════════════════════════════════════════════════════════════
        // Variable access
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Getvar => {
            let name = const_string(fun, ins.bc())?;
            let act_idx = top_act_index(heap, tid);
            let scope = heap.activation_scope(tid, act_idx);
            let (value, _this) = heap
                .getvar(Some(scope), &name, true)?
                .ok_or_else(|| internal("GETVAR resolution failed"))?;
            heap.thread_mut(tid).set_reg(ins.a(), value);
        }

        Opcode::Putvar => {
            let name = const_string(fun, ins.bc())?;
            let value = heap.thread(tid).reg(ins.a());
            let act_idx = top_act_index(heap, tid);
            let scope = heap.activation_scope(tid, act_idx);
            heap.putvar(Some(scope), &name, value, strict)?;
        }

        Opcode::Declvar => {
            let a = ins.a();
            let name = regconst_string(heap, tid, fun, ins.b())?;
            let value = if a & DECLVAR_FLAG_UNDEF_VALUE != 0 {
                TVal::Undefined
            } else {
                regconst(heap, tid, fun, ins.c())?
            };
            let act_idx = top_act_index(heap, tid);
            let var_env = heap.init_activation_envs(tid, act_idx);
            let is_func_decl = a & DECLVAR_FLAG_FUNC_DECL != 0;
            let already =
                heap.declvar(var_env, &name, value.clone(), a & PROP_FLAGS_MASK, is_func_decl)?;
            if already {
                let scope = heap.activation_scope(tid, act_idx);
                heap.putvar(Some(scope), &name, value, strict)?;
            }
        }

        Opcode::Delvar => {
            let name = regconst_string(heap, tid, fun, ins.b())?;
            let act_idx = top_act_index(heap, tid);
            let scope = heap.activation_scope(tid, act_idx);
            let rc = heap.delvar(Some(scope), &name)?;
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(rc));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Closures
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Closure => {
            let template = fun
                .inner
                .get(ins.bc() as usize)
                .cloned()
                .ok_or_else(|| internal("CLOSURE function index out of bounds"))?;
            let act_idx = top_act_index(heap, tid);
            heap.init_activation_envs(tid, act_idx);
            let scope = heap.thread(tid).callstack[act_idx].lex_env;
            if let Some(s) = scope {
                heap.envs.mark_captured(s);
            }
            let obj = create_closure(template, scope);
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Object(obj));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Property access
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Getprop => {
            let obj = regconst(heap, tid, fun, ins.b())?;
            let key = regconst(heap, tid, fun, ins.c())?;
            let value = heap.get_prop(&obj, &key)?;
            heap.thread_mut(tid).set_reg(ins.a(), value);
        }

        Opcode::Putprop => {
            let obj = heap.thread(tid).reg(ins.a());
            let key = regconst(heap, tid, fun, ins.b())?;
            let value = regconst(heap, tid, fun, ins.c())?;
            heap.put_prop(&obj, &key, value, strict)?;
        }

        Opcode::Delprop => {
            let obj = heap.thread(tid).reg(ins.b());
            let key = regconst(heap, tid, fun, ins.c())?;
            let rc = heap.del_prop(&obj, &key, strict)?;
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(rc));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Arithmetic
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Add => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            let result = vm_add(heap, &x, &y)?;
            heap.thread_mut(tid).set_reg(ins.a(), result);
        }

        Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            // Fast path for two numbers, slow path coerces (side effects).
            let (d1, d2) = match (&x, &y) {
                (TVal::Number(a), TVal::Number(b)) => (*a, *b),
                _ => {
                    let d1 = heap.to_number(&x)?;
                    let d2 = heap.to_number(&y)?;
                    (d1, d2)
                }
            };
            let du = match op {
                Opcode::Sub => d1 - d2,
                Opcode::Mul => d1 * d2,
                Opcode::Div => d1 / d2,
                // Ecmascript '%' matches fmod, not IEEE remainder.
                Opcode::Mod => d1 % d2,
                _ => unreachable!(),
            };
            heap.thread_mut(tid).set_reg(ins.a(), TVal::number(du));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Bitwise (ToInt32 operands; shift counts masked to 5 bits)
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Band | Opcode::Bor | Opcode::Bxor | Opcode::Basl | Opcode::Blsr
        | Opcode::Basr => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            let i1 = heap.to_int32(&x)?;
            let i2 = heap.to_int32(&y)?;
            let val: f64 = match op {
                Opcode::Band => (i1 & i2) as f64,
                Opcode::Bor => (i1 | i2) as f64,
                Opcode::Bxor => (i1 ^ i2) as f64,
                Opcode::Basl => {
                    // Result is signed and masked to 32 bits:
                    // 4294967295 << 1 is -2.
                    let shift = (i2 as u32) & 0x1f;
                    i1.wrapping_shl(shift) as f64
                }
                Opcode::Basr => {
                    let shift = (i2 as u32) & 0x1f;
                    (i1 >> shift) as f64
                }
                Opcode::Blsr => {
                    let shift = (i2 as u32) & 0x1f;
                    ((i1 as u32) >> shift) as f64
                }
                _ => unreachable!(),
            };
            // Never NaN, no normalization needed.
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Number(val));
        }

        Opcode::Bnot => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let i1 = heap.to_int32(&x)?;
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Number(!i1 as f64));
        }

        Opcode::Lnot => {
            // ToBoolean has no side effects; operate in place.
            let x = regconst(heap, tid, fun, ins.b())?;
            let res = !x.to_boolean();
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(res));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Equality and relational comparison
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Eq | Opcode::Neq => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            let mut tmp = heap.abstract_equals(&x, &y)?;
            if op == Opcode::Neq {
                tmp = !tmp;
            }
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(tmp));
        }

        Opcode::Seq | Opcode::Sneq => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            let mut tmp = x.strict_equals(&y);
            if op == Opcode::Sneq {
                tmp = !tmp;
            }
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(tmp));
        }

        Opcode::Gt | Opcode::Ge | Opcode::Lt | Opcode::Le => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            // The operand order and flags spell out E5 Section 11.8.5's
            // evaluation-order and undefined-comparison rules.
            let tmp = match op {
                // x < y
                Opcode::Lt => heap.compare(&x, &y, COMPARE_EVAL_LEFT_FIRST)?,
                // x > y  -->  y < x
                Opcode::Gt => heap.compare(&y, &x, 0)?,
                // x >= y  -->  not (x < y)
                Opcode::Ge => {
                    heap.compare(&x, &y, COMPARE_EVAL_LEFT_FIRST | COMPARE_NEGATE)?
                }
                // x <= y  -->  not (y < x)
                Opcode::Le => heap.compare(&y, &x, COMPARE_NEGATE)?,
                _ => unreachable!(),
            };
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(tmp));
        }

        Opcode::Instof => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            let tmp = heap.instanceof(&x, &y)?;
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(tmp));
        }

        Opcode::In => {
            let x = regconst(heap, tid, fun, ins.b())?;
            let y = regconst(heap, tid, fun, ins.c())?;
            let tmp = heap.js_in(&x, &y)?;
            heap.thread_mut(tid).set_reg(ins.a(), TVal::Boolean(tmp));
        }

        // ═══════════════════════════════════════════════════════════════════
        // Branches
        // ═══════════════════════════════════════════════════════════════════
        Opcode::If => {
            let x = regconst(heap, tid, fun, ins.b())?;
            if x.to_boolean() == (ins.a() != 0) {
                let act_idx = top_act_index(heap, tid);
                heap.thread_mut(tid).callstack[act_idx].pc += 1;
            }
        }

        Opcode::Jump => {
            let disp = ins.wide_abc() as i64 - JUMP_BIAS as i64;
            let act_idx = top_act_index(heap, tid);
            let act = &mut heap.thread_mut(tid).callstack[act_idx];
            act.pc = (act.pc as i64 + disp) as usize;
        }

        // ═══════════════════════════════════════════════════════════════════
        // Returns and calls
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Return => {
            let value = if ins.a() & RETURN_FLAG_HAVE_RETVAL != 0 {
                regconst(heap, tid, fun, ins.b())?
            } else {
                TVal::Undefined
            };
            heap.setup_ljstate(LjType::Return, value, TVal::Undefined, false);
            return Err(JsError::Unwind);
        }

        Opcode::Call | Opcode::Calli => {
            let a = ins.a();
            let nargs = ins.c() as usize;
            let mut idx = ins.b();
            if op == Opcode::Calli {
                idx = indirect(heap, tid, idx)?;
            }
            let bottom = heap.thread(tid).bottom;
            let abs = bottom + idx as usize;

            // Clamp the window: [ ... func this arg1 .. argN ]
            heap.thread_mut(tid).set_top(abs + nargs + 2);

            let mut setup_flags = 0;
            if a & CALL_FLAG_TAILCALL != 0 {
                setup_flags |= call::CALL_FLAG_TAILCALL;
            }
            if call::ecma_call_setup(heap, tid, abs, nargs, setup_flags)? {
                // Ecma-to-ecma call in place; the loop reloads hot state.
                return Ok(());
            }

            // Native (or lightfunc) target; bound-chain resolution may have
            // shifted the argument count.
            let nargs = heap.thread(tid).top() - (abs + 2);
            let mut hflags = 0;
            if a & CALL_FLAG_EVALCALL != 0 {
                hflags |= call::CALL_FLAG_DIRECT_EVAL;
            }
            call::handle_call(heap, abs, nargs, hflags)?;
            let thr = heap.thread_mut(tid);
            let bottom = thr.bottom;
            thr.set_top(bottom + fun.nregs as usize);
        }

        // ═══════════════════════════════════════════════════════════════════
        // Labels, break/continue
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Label => {
            let label_id = ins.wide_abc();
            let thr = heap.thread_mut(tid);
            let act_idx = thr.callstack.len() - 1;
            let pc_base = thr.callstack[act_idx].pc;
            thr.catchstack.push(Catcher {
                flags: CAT_TYPE_LABEL,
                callstack_index: act_idx,
                pc_base,
                idx_base: 0,
                label_id,
                varname: None,
                lex_env: None,
            });
            thr.callstack[act_idx].pc += 2;
        }

        Opcode::Endlabel => {
            let top = heap.thread(tid).catchstack.len();
            debug_assert!(top >= 1);
            debug_assert!(heap.thread(tid).catchstack[top - 1].is_label());
            heap.unwind_catchstack(tid, top - 1);
        }

        Opcode::Break => {
            heap.setup_ljstate(
                LjType::Break,
                TVal::Number(ins.wide_abc() as f64),
                TVal::Undefined,
                false,
            );
            return Err(JsError::Unwind);
        }

        Opcode::Continue => {
            heap.setup_ljstate(
                LjType::Continue,
                TVal::Number(ins.wide_abc() as f64),
                TVal::Undefined,
                false,
            );
            return Err(JsError::Unwind);
        }

        // ═══════════════════════════════════════════════════════════════════
        // Try/catch/finally and with
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Trycatch => {
            let a = ins.a();
            let b = ins.b();
            let act_idx = top_act_index(heap, tid);

            let mut flags = 0;
            let mut varname = None;
            let mut spliced_env = None;

            if a & TRYCATCH_FLAG_WITH_BINDING != 0 {
                // Object environment record over the coerced target,
                // spliced into lex_env for the duration of the region.
                heap.init_activation_envs(tid, act_idx);
                let target_val = regconst(heap, tid, fun, ins.c())?;
                let target = heap.to_object(&target_val)?;
                let outer = heap.thread(tid).callstack[act_idx].lex_env;
                let env = heap.envs.alloc_object(target, true, outer);
                heap.thread_mut(tid).callstack[act_idx].lex_env = Some(env);
                spliced_env = Some(env);
                flags |= CAT_FLAG_LEXENV_ACTIVE;
            } else if a & TRYCATCH_FLAG_CATCH_BINDING != 0 {
                varname = Some(const_string(fun, ins.c())?);
                flags |= CAT_FLAG_CATCH_BINDING_ENABLED;
            }

            if a & TRYCATCH_FLAG_HAVE_CATCH != 0 {
                flags |= CAT_FLAG_CATCH_ENABLED;
            }
            if a & TRYCATCH_FLAG_HAVE_FINALLY != 0 {
                flags |= CAT_FLAG_FINALLY_ENABLED;
            }

            let thr = heap.thread_mut(tid);
            let pc_base = thr.callstack[act_idx].pc;
            let idx_base = thr.bottom + b as usize;
            thr.catchstack.push(Catcher {
                flags,
                callstack_index: act_idx,
                pc_base,
                idx_base,
                label_id: 0,
                varname,
                lex_env: spliced_env,
            });
            thr.callstack[act_idx].pc += 2;
        }

        // ═══════════════════════════════════════════════════════════════════
        // Extra opcode group
        // ═══════════════════════════════════════════════════════════════════
        Opcode::Extra => {
            return step_extra(heap, tid, fun, ins);
        }

        Opcode::Invalid => {
            return Err(internal("INVALID opcode"));
        }
    }

    Ok(())
}

/// Addition (E5 Section 11.6.1): numeric fast path, otherwise ToPrimitive
/// both and either concatenate (string/buffer operands) or add numerically.
fn vm_add(heap: &mut Heap, x: &TVal, y: &TVal) -> Result<TVal, JsError> {
    if let (TVal::Number(a), TVal::Number(b)) = (x, y) {
        return Ok(TVal::Number(normalize_number(a + b)));
    }
    let px = heap.to_primitive(x, Hint::None)?;
    let py = heap.to_primitive(y, Hint::None)?;
    let stringy = matches!(px, TVal::String(_) | TVal::Buffer(_))
        || matches!(py, TVal::String(_) | TVal::Buffer(_));
    if stringy {
        let s1 = heap.to_string_value(&px)?;
        let s2 = heap.to_string_value(&py)?;
        Ok(TVal::String(s1 + &s2))
    } else {
        let d1 = heap.to_number(&px)?;
        let d2 = heap.to_number(&py)?;
        Ok(TVal::Number(normalize_number(d1 + d2)))
    }
}

fn self_to_string(heap: &mut Heap, v: &TVal) -> Result<JsString, JsError> {
    heap.to_string_value(v)
}

/// The EXTRA escape hatch: secondary opcode in the 'a' field.
fn step_extra(
    heap: &mut Heap,
    tid: ThreadId,
    fun: &CompiledFunction,
    ins: Ins,
) -> Result<(), JsError> {
    let xop = ExtraOp::from_raw(ins.a() as u8).ok_or_else(|| internal("invalid extra opcode"))?;

    match xop {
        ExtraOp::Nop => {}

        ExtraOp::Ldthis => {
            // The 'this' binding lives just under the register window.
            let thr = heap.thread(tid);
            let value = if thr.bottom >= 1 {
                thr.at(thr.bottom - 1)
            } else {
                TVal::Undefined
            };
            heap.thread_mut(tid).set_reg(ins.b(), value);
        }

        ExtraOp::Ldundef => {
            heap.thread_mut(tid).set_reg(ins.bc(), TVal::Undefined);
        }

        ExtraOp::Ldnull => {
            heap.thread_mut(tid).set_reg(ins.bc(), TVal::Null);
        }

        ExtraOp::Ldtrue | ExtraOp::Ldfalse => {
            let value = xop == ExtraOp::Ldtrue;
            heap.thread_mut(tid).set_reg(ins.bc(), TVal::Boolean(value));
        }

        ExtraOp::Newobj => {
            let obj = crate::object::create_object();
            heap.thread_mut(tid).set_reg(ins.b(), TVal::Object(obj));
        }

        ExtraOp::Newarr => {
            let obj = crate::object::create_array();
            heap.thread_mut(tid).set_reg(ins.b(), TVal::Object(obj));
        }

        ExtraOp::Setalen => {
            let obj = match heap.thread(tid).reg(ins.b()) {
                TVal::Object(o) => o,
                _ => return Err(internal("SETALEN target not an object")),
            };
            let len = match heap.thread(tid).reg(ins.c()) {
                TVal::Number(n) => n as u32,
                _ => return Err(internal("SETALEN length not a number")),
            };
            set_array_length(&obj, len);
        }

        ExtraOp::Typeof => {
            let v = regconst(heap, tid, fun, ins.c())?;
            heap.thread_mut(tid)
                .set_reg(ins.b(), TVal::from(v.type_of()));
        }

        ExtraOp::Typeofid => {
            // typeof of an identifier: unresolved names are "undefined"
            // rather than a ReferenceError.
            let name = regconst_string(heap, tid, fun, ins.c())?;
            let act_idx = top_act_index(heap, tid);
            let scope = heap.activation_scope(tid, act_idx);
            let result = match heap.getvar(Some(scope), &name, false)? {
                Some((value, _this)) => TVal::from(value.type_of()),
                None => TVal::from("undefined"),
            };
            heap.thread_mut(tid).set_reg(ins.b(), result);
        }

        ExtraOp::Tonum => {
            let v = heap.thread(tid).reg(ins.c());
            let d = heap.to_number(&v)?;
            heap.thread_mut(tid).set_reg(ins.b(), TVal::number(d));
        }

        ExtraOp::Initenum => {
            let target = heap.thread(tid).reg(ins.c());
            let enumerator = heap.make_enumerator(&target)?;
            heap.thread_mut(tid).set_reg(ins.b(), enumerator);
        }

        ExtraOp::Nextenum => {
            // On a live key: write it and skip the jump slot.  On
            // exhaustion fall through; the null sentinel enumerator behaves
            // as exhausted without touching the target register.
            match heap.thread(tid).reg(ins.c()) {
                TVal::Object(en) => {
                    match heap.enum_next(&en) {
                        Some(key) => {
                            let thr = heap.thread_mut(tid);
                            thr.set_reg(ins.b(), TVal::String(key));
                            let act_idx = thr.callstack.len() - 1;
                            thr.callstack[act_idx].pc += 1;
                        }
                        None => {
                            heap.thread_mut(tid).set_reg(ins.b(), TVal::Undefined);
                        }
                    }
                }
                TVal::Null => {}
                _ => return Err(internal("NEXTENUM enumerator invalid")),
            }
        }

        ExtraOp::Initset | ExtraOp::Initseti | ExtraOp::Initget | ExtraOp::Initgeti => {
            let is_set = matches!(xop, ExtraOp::Initset | ExtraOp::Initseti);
            let obj = match heap.thread(tid).reg(ins.b()) {
                TVal::Object(o) => o,
                _ => return Err(internal("INITSET/INITGET target not an object")),
            };
            let mut idx = ins.c();
            if matches!(xop, ExtraOp::Initseti | ExtraOp::Initgeti) {
                idx = indirect(heap, tid, idx)?;
            }
            let key_val = heap.thread(tid).reg(idx);
            let key = heap.to_property_key(&key_val)?;
            let func = match heap.thread(tid).reg(idx + 1) {
                TVal::Object(o) if o.borrow().is_callable() => o,
                _ => return Err(internal("INITSET/INITGET accessor not a function")),
            };
            heap.define_accessor(&obj, key, func, is_set);
        }

        ExtraOp::Endtry => {
            let cat_idx = heap.thread(tid).catchstack.len() - 1;
            debug_assert_eq!(
                heap.thread(tid).catchstack[cat_idx].callstack_index,
                heap.thread(tid).callstack.len() - 1
            );
            let (pc_base, idx_base, has_finally) = {
                let cat = &mut heap.thread_mut(tid).catchstack[cat_idx];
                cat.flags &= !CAT_FLAG_CATCH_ENABLED;
                (cat.pc_base, cat.idx_base, cat.finally_enabled())
            };
            if has_finally {
                // Arm the finally with a NORMAL continuation.
                let thr = heap.thread_mut(tid);
                thr.put_at(idx_base, TVal::Undefined);
                thr.put_at(idx_base + 1, TVal::Number(LjType::Normal.code()));
                heap.thread_mut(tid).catchstack[cat_idx].flags &= !CAT_FLAG_FINALLY_ENABLED;
            } else {
                heap.unwind_catchstack(tid, cat_idx);
            }
            let act_idx = top_act_index(heap, tid);
            heap.thread_mut(tid).callstack[act_idx].pc = pc_base + 1;
        }

        ExtraOp::Endcatch => {
            let cat_idx = heap.thread(tid).catchstack.len() - 1;
            debug_assert!(!heap.thread(tid).catchstack[cat_idx].catch_enabled());
            let (pc_base, idx_base, has_finally, lexenv_active) = {
                let cat = &heap.thread(tid).catchstack[cat_idx];
                (
                    cat.pc_base,
                    cat.idx_base,
                    cat.finally_enabled(),
                    cat.lexenv_active(),
                )
            };
            if lexenv_active {
                // Pop the catch-variable environment.
                let env = heap.thread_mut(tid).catchstack[cat_idx].lex_env.take();
                if let Some(env) = env {
                    let outer = heap.envs.outer_of(env);
                    let act_idx = heap.thread(tid).catchstack[cat_idx].callstack_index;
                    heap.thread_mut(tid).callstack[act_idx].lex_env = outer;
                    heap.envs.free_if_uncaptured(env);
                }
                heap.thread_mut(tid).catchstack[cat_idx].flags &= !CAT_FLAG_LEXENV_ACTIVE;
            }
            if has_finally {
                let thr = heap.thread_mut(tid);
                thr.put_at(idx_base, TVal::Undefined);
                thr.put_at(idx_base + 1, TVal::Number(LjType::Normal.code()));
                thr.catchstack[cat_idx].flags &= !CAT_FLAG_FINALLY_ENABLED;
            } else {
                heap.unwind_catchstack(tid, cat_idx);
            }
            let act_idx = top_act_index(heap, tid);
            heap.thread_mut(tid).callstack[act_idx].pc = pc_base + 1;
        }

        ExtraOp::Endfin => {
            let cat_idx = heap.thread(tid).catchstack.len() - 1;
            debug_assert!(!heap.thread(tid).catchstack[cat_idx].finally_enabled());
            let idx_base = heap.thread(tid).catchstack[cat_idx].idx_base;
            let cont_type = match heap.thread(tid).at(idx_base + 1) {
                TVal::Number(n) => LjType::from_code(n)
                    .ok_or_else(|| internal("ENDFIN completion code invalid"))?,
                _ => return Err(internal("ENDFIN completion code not a number")),
            };
            if cont_type == LjType::Normal {
                // Non-abrupt completion: dismantle and continue after ENDFIN.
                heap.unwind_catchstack(tid, cat_idx);
            } else {
                // Abrupt completion: the stored type replaces the original
                // transfer and unwinding resumes.
                let value = heap.thread(tid).at(idx_base);
                let iserror = cont_type == LjType::Throw;
                heap.setup_ljstate(cont_type, value, TVal::Undefined, iserror);
                return Err(JsError::Unwind);
            }
        }

        ExtraOp::Throw => {
            let mut value = heap.thread(tid).reg(ins.b());
            if let Some(hook) = heap.augment_error {
                hook(heap, &mut value);
            }
            heap.setup_ljstate(LjType::Throw, value, TVal::Undefined, true);
            return Err(JsError::Unwind);
        }

        ExtraOp::Invlhs => {
            return Err(JsError::reference_error("invalid assignment target"));
        }

        ExtraOp::Unm | ExtraOp::Unp | ExtraOp::Inc | ExtraOp::Dec => {
            let x = regconst(heap, tid, fun, ins.c())?;
            let d1 = match &x {
                TVal::Number(n) => *n,
                _ => heap.to_number(&x)?,
            };
            let du = match xop {
                ExtraOp::Unm => -d1,
                ExtraOp::Unp => d1,
                ExtraOp::Inc => d1 + 1.0,
                ExtraOp::Dec => d1 - 1.0,
                _ => unreachable!(),
            };
            heap.thread_mut(tid).set_reg(ins.b(), TVal::number(du));
        }
    }

    Ok(())
}
