//! The heap: process-wide executor state
//!
//! Owns the thread arena, the environment arena, the shared longjmp state,
//! the interrupt counters and the call-recursion accounting.  Exactly one
//! thread is RUNNING at any time; the heap tracks which.

use crate::env::{EnvArena, EnvId};
use crate::error::JsError;
use crate::object::{create_object, ObjectRef, Property, PropertyKey};
use crate::thread::{JsThread, ThreadId, ThreadState};
use crate::value::TVal;

/// Default interrupt counter init value: instructions executed between
/// interrupt checks.
pub const INTERRUPT_COUNTER_DEFAULT: i64 = 4096;

/// Default host-recursion limit for non-ecma-to-ecma calls.
pub const CALL_RECURSION_LIMIT_DEFAULT: usize = 1000;

/// Non-local transfer type.  The numeric codes are stored into catcher
/// registers by the unwinder and read back by ENDFIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LjType {
    Unknown = 0,
    Throw = 1,
    Yield = 2,
    Resume = 3,
    Break = 4,
    Continue = 5,
    Return = 6,
    Normal = 7,
}

impl LjType {
    pub fn code(self) -> f64 {
        self as u8 as f64
    }

    pub fn from_code(code: f64) -> Option<LjType> {
        Some(match code as u8 {
            0 => LjType::Unknown,
            1 => LjType::Throw,
            2 => LjType::Yield,
            3 => LjType::Resume,
            4 => LjType::Break,
            5 => LjType::Continue,
            6 => LjType::Return,
            7 => LjType::Normal,
            _ => return None,
        })
    }
}

/// The shared longjmp state.  Owned by exactly one in-flight non-local
/// transfer at a time; between transfers the type is UNKNOWN and both
/// values are undefined.
pub struct LongjmpState {
    pub ty: LjType,
    pub value1: TVal,
    pub value2: TVal,
    pub iserror: bool,
}

impl LongjmpState {
    fn new() -> Self {
        Self {
            ty: LjType::Unknown,
            value1: TVal::Undefined,
            value2: TVal::Undefined,
            iserror: false,
        }
    }

    pub fn is_clear(&self) -> bool {
        self.ty == LjType::Unknown
            && self.value1.is_undefined()
            && self.value2.is_undefined()
    }
}

/// Optional hook run on every thrown value before unwinding starts.
pub type AugmentErrorHook = fn(&mut Heap, &mut TVal);

/// Process-wide executor state.
pub struct Heap {
    pub(crate) threads: Vec<JsThread>,
    pub(crate) envs: EnvArena,
    /// The currently RUNNING thread.
    pub current: ThreadId,
    pub lj: LongjmpState,
    /// Interrupt counter re-init value.
    pub interrupt_init: i64,
    /// Heap copy of the interrupt counter; the running thread holds the hot
    /// copy and they are reconciled on every thread switch.
    pub(crate) interrupt_counter: i64,
    pub call_recursion_depth: usize,
    pub call_recursion_limit: usize,
    /// The global object.
    pub global: ObjectRef,
    /// Object environment record wrapping the global object.
    pub global_env: EnvId,
    /// Executed-instruction budget; exceeded budgets raise a RangeError from
    /// the interrupt path.
    steps_executed: u64,
    step_limit: Option<u64>,
    /// Error augmentation hook (disabled by default).
    pub augment_error: Option<AugmentErrorHook>,
}

impl Heap {
    pub fn new() -> Self {
        let global = create_object();
        let mut envs = EnvArena::new();
        let global_env = envs.alloc_object(global.clone(), false, None);
        envs.mark_captured(global_env);

        let mut main = JsThread::new();
        main.state = ThreadState::Running;
        main.interrupt_counter = INTERRUPT_COUNTER_DEFAULT;

        Self {
            threads: vec![main],
            envs,
            current: ThreadId(0),
            lj: LongjmpState::new(),
            interrupt_init: INTERRUPT_COUNTER_DEFAULT,
            interrupt_counter: INTERRUPT_COUNTER_DEFAULT,
            call_recursion_depth: 0,
            call_recursion_limit: CALL_RECURSION_LIMIT_DEFAULT,
            global,
            global_env,
            steps_executed: 0,
            step_limit: None,
            augment_error: None,
        }
    }

    #[inline]
    pub fn thread(&self, id: ThreadId) -> &JsThread {
        &self.threads[id.0]
    }

    #[inline]
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut JsThread {
        &mut self.threads[id.0]
    }

    /// Switch the RUNNING thread pointer, reconciling the interrupt counter
    /// copies.  Thread states are the caller's responsibility.
    pub fn switch_thread(&mut self, new: ThreadId) {
        let old = self.current;
        if old != new {
            self.interrupt_counter = self.thread(old).interrupt_counter;
        }
        self.thread_mut(new).interrupt_counter = self.interrupt_counter;
        self.current = new;
    }

    /// Arm the longjmp state.  Values already present are released after the
    /// new ones are written.
    pub fn setup_ljstate(&mut self, ty: LjType, value1: TVal, value2: TVal, iserror: bool) {
        self.lj.ty = ty;
        let old1 = std::mem::replace(&mut self.lj.value1, value1);
        drop(old1);
        let old2 = std::mem::replace(&mut self.lj.value2, value2);
        drop(old2);
        self.lj.iserror = iserror;
    }

    /// Clear the longjmp state after its values have been consumed.  The
    /// old values are dropped last so a reentrant release sees a clean
    /// state.
    pub fn wipe_ljstate(&mut self) {
        self.lj.ty = LjType::Unknown;
        self.lj.iserror = false;
        let old1 = std::mem::replace(&mut self.lj.value1, TVal::Undefined);
        let old2 = std::mem::replace(&mut self.lj.value2, TVal::Undefined);
        drop(old1);
        drop(old2);
    }

    /// Convert a core error into a throwable value: thrown values pass
    /// through, everything else becomes a plain error object with `name`
    /// and `message`.
    pub fn error_to_value(&mut self, err: &JsError) -> TVal {
        match err {
            JsError::Thrown { value } => value.clone(),
            other => {
                let obj = create_object();
                obj.borrow_mut().define_property(
                    PropertyKey::from("name"),
                    Property::data(TVal::from(other.error_name())),
                );
                obj.borrow_mut().define_property(
                    PropertyKey::from("message"),
                    Property::data(TVal::from(other.error_message())),
                );
                TVal::Object(obj)
            }
        }
    }

    /// Arm a THROW transfer from a core error.
    pub fn arm_throw(&mut self, err: &JsError) {
        let value = self.error_to_value(err);
        self.setup_ljstate(LjType::Throw, value, TVal::Undefined, true);
    }

    /// Limit the number of executed instructions; `None` removes the limit.
    pub fn set_step_limit(&mut self, limit: Option<u64>) {
        self.steps_executed = 0;
        self.step_limit = limit;
    }

    /// Interrupt-counter trip point: account for executed instructions,
    /// enforce the step budget, reload the counters.  The hook may raise an
    /// error to throttle execution but never switches threads.
    pub fn executor_interrupt(&mut self) -> Result<(), JsError> {
        let tid = self.current;
        let spent = self.interrupt_init - self.thread(tid).interrupt_counter;
        self.steps_executed = self.steps_executed.saturating_add(spent.max(0) as u64);
        if let Some(limit) = self.step_limit {
            if self.steps_executed > limit {
                // Keep tripping on every instruction until all catchpoints
                // have been exhausted.
                self.interrupt_init = 0;
                self.interrupt_counter = 0;
                self.thread_mut(tid).interrupt_counter = 0;
                return Err(JsError::range_error("execution step limit"));
            }
        }
        let ctr = INTERRUPT_COUNTER_DEFAULT;
        self.interrupt_init = ctr;
        self.interrupt_counter = ctr - 1;
        self.thread_mut(tid).interrupt_counter = ctr - 1;
        Ok(())
    }

    /// Define a writable/enumerable/configurable property on the global
    /// object (embedder setup).
    pub fn define_global(&mut self, name: &str, value: TVal) {
        self.global
            .borrow_mut()
            .define_property(PropertyKey::from(name), Property::data(value));
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
