//! Cooperative threads
//!
//! A thread owns its three stacks and a small amount of coroutine state.
//! Threads live in an arena on the heap and are referenced by `ThreadId`;
//! thread objects and the `resumer` back-reference carry the id, never an
//! owning pointer, so terminated threads cannot keep cycles alive.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::JsError;
use crate::heap::{Heap, LjType};
use crate::object::{ExoticObject, JsFunction, JsObject};
use crate::stack::{Activation, Catcher};
use crate::value::TVal;

/// Thread identifier: an index into the heap's thread arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Inactive,
    Running,
    Resumed,
    Yielded,
    Terminated,
}

/// One cooperative thread.
pub struct JsThread {
    /// Value stack; `len()` is the live top.
    pub valstack: Vec<TVal>,
    /// Absolute index of the current activation's register 0.
    pub bottom: usize,
    pub callstack: Vec<Activation>,
    pub catchstack: Vec<Catcher>,
    pub state: ThreadState,
    /// The thread that most recently resumed this one; cleared on yield and
    /// on termination.
    pub resumer: Option<ThreadId>,
    /// Number of activations that disallow yielding through them.
    pub preventcount: usize,
    /// Executor's hot copy of the heap interrupt counter.
    pub interrupt_counter: i64,
}

impl JsThread {
    pub fn new() -> Self {
        Self {
            valstack: Vec::new(),
            bottom: 0,
            callstack: Vec::new(),
            catchstack: Vec::new(),
            state: ThreadState::Inactive,
            resumer: None,
            preventcount: 0,
            interrupt_counter: 0,
        }
    }

    /// Resize the live value-stack top; new slots read as undefined.
    pub fn set_top(&mut self, top: usize) {
        if top <= self.valstack.len() {
            self.valstack.truncate(top);
        } else {
            self.valstack.resize(top, TVal::Undefined);
        }
    }

    pub fn top(&self) -> usize {
        self.valstack.len()
    }

    /// Read register `i` of the current window.
    #[inline]
    pub fn reg(&self, i: u32) -> TVal {
        self.valstack
            .get(self.bottom + i as usize)
            .cloned()
            .unwrap_or(TVal::Undefined)
    }

    /// Write register `i`; the old value is released only after the new one
    /// is in place.
    #[inline]
    pub fn set_reg(&mut self, i: u32, value: TVal) {
        let idx = self.bottom + i as usize;
        if idx >= self.valstack.len() {
            self.valstack.resize(idx + 1, TVal::Undefined);
        }
        let old = std::mem::replace(&mut self.valstack[idx], value);
        drop(old);
    }

    /// Absolute-index read.
    #[inline]
    pub fn at(&self, idx: usize) -> TVal {
        self.valstack.get(idx).cloned().unwrap_or(TVal::Undefined)
    }

    /// Absolute-index write with the release-after-write ordering.
    #[inline]
    pub fn put_at(&mut self, idx: usize, value: TVal) {
        if idx >= self.valstack.len() {
            self.valstack.resize(idx + 1, TVal::Undefined);
        }
        let old = std::mem::replace(&mut self.valstack[idx], value);
        drop(old);
    }

    pub fn push(&mut self, value: TVal) {
        self.valstack.push(value);
    }
}

impl Default for JsThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create an INACTIVE thread whose initial function is `func`.  The
    /// function value is parked as the only value-stack slot until the first
    /// resume sets up the call.
    pub fn spawn_thread(&mut self, func: TVal) -> Result<TVal, JsError> {
        let is_compiled = matches!(
            func.as_object().map(|o| {
                matches!(
                    o.borrow().exotic,
                    ExoticObject::Function(JsFunction::Compiled(_))
                )
            }),
            Some(true)
        );
        if !is_compiled {
            return Err(JsError::type_error(
                "thread initial function must be a compiled function",
            ));
        }
        let mut thr = JsThread::new();
        thr.valstack.push(func);
        let id = ThreadId(self.threads.len());
        self.threads.push(thr);

        let mut obj = JsObject::new();
        obj.exotic = ExoticObject::Thread(id);
        Ok(TVal::Object(Rc::new(RefCell::new(obj))))
    }

    /// Terminate a thread: state change plus stack release, in that order so
    /// reentrant releases observe a terminated thread.
    pub fn terminate_thread(&mut self, tid: ThreadId) {
        self.thread_mut(tid).state = ThreadState::Terminated;
        self.unwind_catchstack(tid, 0);
        self.unwind_callstack(tid, 0);
        let thr = self.thread_mut(tid);
        thr.valstack.clear();
        thr.bottom = 0;
        thr.resumer = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Thread builtins (yield / resume)
// ═══════════════════════════════════════════════════════════════════════════

/// Native `yield(value, isError?)`.  Arms the longjmp state and signals the
/// unwinder; the value turns up as the resumer's `resume()` result.
pub fn thread_yield(heap: &mut Heap, _this: TVal, args: &[TVal]) -> Result<TVal, JsError> {
    let tid = heap.current;
    {
        let thr = heap.thread(tid);
        if thr.resumer.is_none() {
            return Err(JsError::type_error("yield from unresumed thread"));
        }
        // Only the yield() native frame itself may be preventing.
        if thr.preventcount > 1 {
            return Err(JsError::type_error("yield not allowed through this callstack"));
        }
        if thr.callstack.len() < 2 {
            return Err(JsError::type_error("yield from thread entry level"));
        }
    }
    let value = args.first().cloned().unwrap_or(TVal::Undefined);
    let iserror = args.get(1).map(|v| v.to_boolean()).unwrap_or(false);
    heap.setup_ljstate(LjType::Yield, value, TVal::Undefined, iserror);
    Err(JsError::Unwind)
}

/// Native `resume(thread, value, isError?)`.
pub fn thread_resume(heap: &mut Heap, _this: TVal, args: &[TVal]) -> Result<TVal, JsError> {
    let thread_val = args.first().cloned().unwrap_or(TVal::Undefined);
    let tid = thread_val
        .as_object()
        .and_then(|o| o.borrow().as_thread())
        .ok_or_else(|| JsError::type_error("resume target is not a thread"))?;
    match heap.thread(tid).state {
        ThreadState::Inactive | ThreadState::Yielded => {}
        state => {
            return Err(JsError::type_error(format!(
                "cannot resume thread in state {:?}",
                state
            )));
        }
    }
    let value = args.get(1).cloned().unwrap_or(TVal::Undefined);
    let iserror = args.get(2).map(|v| v.to_boolean()).unwrap_or(false);
    heap.setup_ljstate(LjType::Resume, value, thread_val, iserror);
    Err(JsError::Unwind)
}
