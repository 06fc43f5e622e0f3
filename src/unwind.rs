//! Non-local control-flow dispatcher
//!
//! Every throw, return, break/continue, yield and resume is communicated
//! through the heap's longjmp state and lands here.  The dispatcher rewinds
//! catchers and activations and decides whether the executor restarts its
//! loop, finishes with a return value, or rethrows to its caller.
//!
//! A handler may convert the transfer into a different type (yield with an
//! error becomes a throw in the resumer) and re-enter the dispatch; the
//! outer loop mirrors the original `goto check_longjmp` shape.

use crate::error::JsError;
use crate::heap::{Heap, LjType};
use crate::thread::{ThreadId, ThreadState};
use crate::value::TVal;

/// Dispatcher verdict, consumed by the executor's catchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongjmpResult {
    /// State updated; reload hot variables and continue the loop (possibly
    /// on a different thread).
    Restart,
    /// The entry activation returned; the value is on the entry thread's
    /// value-stack top.
    Finished,
    /// Uncaught error at the entry level; surface to the caller.  The
    /// longjmp state still holds the error value.
    Rethrow,
}

/// Handle an in-flight non-local transfer.
///
/// Errors raised here are dispatcher invariant violations (unmatched label,
/// unknown transfer type); they bubble out of the executor unhandled.
pub fn handle_longjmp(
    heap: &mut Heap,
    entry_thread: ThreadId,
    entry_callstack_top: usize,
) -> Result<LongjmpResult, JsError> {
    debug_assert!(entry_callstack_top >= 1);
    let entry_callstack_index = entry_callstack_top - 1;

    // Retry loop: handlers that convert the transfer re-enter here with the
    // longjmp state rewritten and the current thread switched.
    loop {
        let tid = heap.current;
        match heap.lj.ty {
            LjType::Resume => {
                // value1 is the payload, value2 the resumee (a thread
                // object); this differs from YIELD.
                let resumee = heap
                    .lj
                    .value2
                    .as_object()
                    .and_then(|o| o.borrow().as_thread())
                    .ok_or_else(|| JsError::internal("RESUME: resumee is not a thread"))?;

                if heap.lj.iserror {
                    // Throw the error inside the resumed thread.
                    heap.thread_mut(resumee).resumer = Some(tid);
                    heap.thread_mut(resumee).state = ThreadState::Running;
                    heap.thread_mut(tid).state = ThreadState::Resumed;
                    heap.switch_thread(resumee);
                    heap.lj.ty = LjType::Throw;
                    continue;
                }

                match heap.thread(resumee).state {
                    ThreadState::Yielded => {
                        // Inject the payload as yield()'s return value.
                        let act_idx = heap.thread(resumee).callstack.len() - 2;
                        let payload = heap.lj.value1.clone();
                        inject_retval(heap, resumee, act_idx, payload);
                    }
                    ThreadState::Inactive => {
                        // [ initial_func ] -> [ initial_func undefined payload ]
                        let payload = heap.lj.value1.clone();
                        {
                            let thr = heap.thread_mut(resumee);
                            thr.push(TVal::Undefined);
                            thr.push(payload);
                        }
                        let ok = crate::call::ecma_call_setup(
                            heap,
                            resumee,
                            0,
                            1,
                            crate::call::CALL_FLAG_IS_RESUME,
                        )?;
                        if !ok {
                            return Err(JsError::internal(
                                "RESUME: initial function not compiled",
                            ));
                        }
                    }
                    state => {
                        return Err(JsError::internal(format!(
                            "RESUME: resumee in state {:?}",
                            state
                        )));
                    }
                }

                heap.thread_mut(resumee).resumer = Some(tid);
                heap.thread_mut(resumee).state = ThreadState::Running;
                heap.thread_mut(tid).state = ThreadState::Resumed;
                heap.switch_thread(resumee);
                heap.wipe_ljstate();
                return Ok(LongjmpResult::Restart);
            }

            LjType::Yield => {
                // The yield builtin guarantees: not the entry thread, a
                // resumer exists, and nothing on the callstack prevents the
                // switch.
                let resumer = heap
                    .thread(tid)
                    .resumer
                    .ok_or_else(|| JsError::internal("YIELD: no resumer"))?;

                if heap.lj.iserror {
                    heap.thread_mut(tid).state = ThreadState::Yielded;
                    heap.thread_mut(tid).resumer = None;
                    heap.thread_mut(resumer).state = ThreadState::Running;
                    heap.switch_thread(resumer);
                    heap.lj.ty = LjType::Throw;
                    continue;
                }

                let act_idx = heap.thread(resumer).callstack.len() - 2;
                let payload = heap.lj.value1.clone();
                inject_retval(heap, resumer, act_idx, payload);

                heap.thread_mut(tid).state = ThreadState::Yielded;
                heap.thread_mut(tid).resumer = None;
                heap.thread_mut(resumer).state = ThreadState::Running;
                heap.switch_thread(resumer);
                heap.wipe_ljstate();
                return Ok(LongjmpResult::Restart);
            }

            LjType::Return => {
                // A finally in the same activation captures the return
                // before anything unwinds.
                let callstack_top = heap.thread(tid).callstack.len();
                let mut boundary = heap.thread(tid).catchstack.len();
                let mut caught = None;
                for (i, cat) in heap.thread(tid).catchstack.iter().enumerate().rev() {
                    if cat.callstack_index != callstack_top - 1 {
                        boundary = i + 1;
                        break;
                    }
                    boundary = i;
                    if cat.is_tcf() && cat.finally_enabled() {
                        caught = Some(i);
                        break;
                    }
                }
                if let Some(cat_idx) = caught {
                    handle_catch_or_finally(heap, cat_idx, true);
                    heap.wipe_ljstate();
                    return Ok(LongjmpResult::Restart);
                }

                if tid == entry_thread && callstack_top == entry_callstack_top {
                    // Return to the executor caller: leave the value on the
                    // value-stack top.
                    let v = heap.lj.value1.clone();
                    heap.thread_mut(tid).push(v);
                    heap.wipe_ljstate();
                    return Ok(LongjmpResult::Finished);
                }

                if callstack_top >= 2 {
                    // Slow return to the calling activation (necessarily a
                    // compiled function, or it would have hit entry level).
                    let caller_idx = callstack_top - 2;
                    let retval_at = heap.thread(tid).callstack[caller_idx].idx_retval;
                    let v = heap.lj.value1.clone();
                    heap.thread_mut(tid).put_at(retval_at, v);
                    heap.unwind_catchstack(tid, boundary);
                    heap.unwind_callstack(tid, callstack_top - 1);
                    heap.reconfig_valstack(tid, caller_idx, 1);
                    heap.wipe_ljstate();
                    return Ok(LongjmpResult::Restart);
                }

                // No calling activation: the thread finishes and the value
                // goes to the resumer, yield-style.
                let resumer = heap
                    .thread(tid)
                    .resumer
                    .ok_or_else(|| JsError::internal("RETURN: terminated thread has no resumer"))?;
                let act_idx = heap.thread(resumer).callstack.len() - 2;
                let payload = heap.lj.value1.clone();
                inject_retval(heap, resumer, act_idx, payload);
                heap.terminate_thread(tid);
                heap.thread_mut(resumer).state = ThreadState::Running;
                heap.switch_thread(resumer);
                heap.wipe_ljstate();
                return Ok(LongjmpResult::Restart);
            }

            LjType::Break | LjType::Continue => {
                // value1 carries the label id.  A finally captures first;
                // otherwise the matching label catcher must exist (the
                // compiler guarantees it).
                let label = heap
                    .lj
                    .value1
                    .as_number()
                    .ok_or_else(|| JsError::internal("BREAK/CONTINUE: label id missing"))?
                    as u32;
                let callstack_top = heap.thread(tid).callstack.len();
                enum Hit {
                    Finally(usize),
                    Label(usize),
                }
                let mut hit = None;
                for (i, cat) in heap.thread(tid).catchstack.iter().enumerate().rev() {
                    if cat.callstack_index != callstack_top - 1 {
                        break;
                    }
                    if cat.is_tcf() && cat.finally_enabled() {
                        hit = Some(Hit::Finally(i));
                        break;
                    }
                    if cat.is_label() && cat.label_id == label {
                        hit = Some(Hit::Label(i));
                        break;
                    }
                }
                match hit {
                    Some(Hit::Finally(cat_idx)) => {
                        handle_catch_or_finally(heap, cat_idx, true);
                        heap.wipe_ljstate();
                        return Ok(LongjmpResult::Restart);
                    }
                    Some(Hit::Label(cat_idx)) => {
                        handle_label(heap, cat_idx);
                        heap.wipe_ljstate();
                        return Ok(LongjmpResult::Restart);
                    }
                    None => {
                        return Err(JsError::internal("break/continue matched no catcher"));
                    }
                }
            }

            LjType::Throw => {
                let mut caught = None;
                for (i, cat) in heap.thread(tid).catchstack.iter().enumerate().rev() {
                    if tid == entry_thread && cat.callstack_index < entry_callstack_index {
                        break;
                    }
                    if cat.catch_enabled() {
                        caught = Some((i, false));
                        break;
                    }
                    if cat.finally_enabled() {
                        caught = Some((i, true));
                        break;
                    }
                }
                if let Some((cat_idx, is_finally)) = caught {
                    handle_catch_or_finally(heap, cat_idx, is_finally);
                    heap.wipe_ljstate();
                    return Ok(LongjmpResult::Restart);
                }

                if tid == entry_thread {
                    // Not caught before entry level: rethrow; the longjmp
                    // state keeps the error value for the outer catchpoint.
                    return Ok(LongjmpResult::Rethrow);
                }

                // Uncaught in a resumed thread: the thread terminates and
                // the error is re-dispatched in the resumer.
                let resumer = heap
                    .thread(tid)
                    .resumer
                    .ok_or_else(|| JsError::internal("THROW: dying thread has no resumer"))?;
                heap.terminate_thread(tid);
                heap.thread_mut(resumer).state = ThreadState::Running;
                heap.switch_thread(resumer);
                continue;
            }

            LjType::Normal | LjType::Unknown => {
                return Err(JsError::internal("invalid longjmp type in dispatcher"));
            }
        }
    }
}

/// Write `payload` into the resume/yield return slot of `act_idx` on the
/// target thread, pop everything above that activation and re-establish its
/// register window.
fn inject_retval(heap: &mut Heap, target: ThreadId, act_idx: usize, payload: TVal) {
    let retval_at = heap.thread(target).callstack[act_idx].idx_retval;
    heap.thread_mut(target).put_at(retval_at, payload);
    heap.unwind_callstack(target, act_idx + 1);
    heap.reconfig_valstack(target, act_idx, 1);
}

/// Enter the catch or finally part of a TCF catcher: install the pending
/// value and completion code into the two reserved registers, unwind above
/// the catcher's activation, and continue at the proper jump slot.
pub(crate) fn handle_catch_or_finally(heap: &mut Heap, cat_idx: usize, is_finally: bool) {
    let tid = heap.current;
    let (idx_base, callstack_index, pc_base) = {
        let cat = &heap.thread(tid).catchstack[cat_idx];
        (cat.idx_base, cat.callstack_index, cat.pc_base)
    };

    // Caught value and completion type code into the reserved registers.
    let v1 = heap.lj.value1.clone();
    let code = heap.lj.ty.code();
    {
        let thr = heap.thread_mut(tid);
        thr.put_at(idx_base, v1);
        thr.put_at(idx_base + 1, TVal::Number(code));
    }

    // The catcher itself is kept, even when entering finally.
    heap.unwind_catchstack(tid, cat_idx + 1);
    heap.unwind_callstack(tid, callstack_index + 1);

    // Re-establish the register window of the catching activation.
    let nregs = heap.thread(tid).callstack[callstack_index]
        .compiled()
        .map(|f| f.nregs as usize)
        .unwrap_or(0);
    let bottom = heap.thread(tid).callstack[callstack_index].idx_bottom;
    {
        let thr = heap.thread_mut(tid);
        thr.bottom = bottom;
        thr.set_top(bottom + nregs);
        thr.callstack[callstack_index].pc = pc_base + usize::from(is_finally);
    }

    // Entering a catch clause with a catch-variable binding: splice a fresh
    // declarative environment holding the binding (mutable, not deletable;
    // E5 Section 12.14 step 4).
    let catch_binding = {
        let cat = &heap.thread(tid).catchstack[cat_idx];
        !is_finally && cat.catch_binding_enabled()
    };
    if catch_binding {
        heap.init_activation_envs(tid, callstack_index);
        let outer = heap.thread(tid).callstack[callstack_index].lex_env;
        let new_env = heap.envs.alloc_declarative(outer);
        let varname = heap.thread(tid).catchstack[cat_idx]
            .varname
            .clone()
            .unwrap_or_else(|| crate::value::JsString::from(""));
        let caught = heap.lj.value1.clone();
        heap.envs.define(new_env, varname, caught, true);
        heap.thread_mut(tid).callstack[callstack_index].lex_env = Some(new_env);
        let cat = &mut heap.thread_mut(tid).catchstack[cat_idx];
        cat.lex_env = Some(new_env);
        cat.flags |= crate::stack::CAT_FLAG_LEXENV_ACTIVE;
    }

    let cat = &mut heap.thread_mut(tid).catchstack[cat_idx];
    if is_finally {
        cat.flags &= !crate::stack::CAT_FLAG_FINALLY_ENABLED;
    } else {
        cat.flags &= !crate::stack::CAT_FLAG_CATCH_ENABLED;
    }
}

/// Jump to a label catcher's break or continue slot, popping everything
/// above it (the label catcher itself stays).
pub(crate) fn handle_label(heap: &mut Heap, cat_idx: usize) {
    let tid = heap.current;
    let is_continue = heap.lj.ty == LjType::Continue;
    let (callstack_index, pc_base) = {
        let cat = &heap.thread(tid).catchstack[cat_idx];
        (cat.callstack_index, cat.pc_base)
    };
    heap.thread_mut(tid).callstack[callstack_index].pc = pc_base + usize::from(is_continue);
    heap.unwind_catchstack(tid, cat_idx + 1);
}
