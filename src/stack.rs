//! Activations, catchers and the per-thread stack operations
//!
//! Each thread owns three parallel stacks: the value stack (registers), the
//! call stack (activations) and the catch stack (catchers).  Stacks are
//! plain growable vectors addressed by index; no raw pointers are held
//! across operations that may run user code.

use std::rc::Rc;

use crate::bytecode::CompiledFunction;
use crate::env::EnvId;
use crate::heap::Heap;
use crate::object::{ExoticObject, JsFunction};
use crate::thread::ThreadId;
use crate::value::{JsString, TVal};

// Activation flags.
pub const ACT_FLAG_CONSTRUCT: u32 = 1 << 0;
/// Yield may not unwind through this activation (native frames,
/// constructor calls).
pub const ACT_FLAG_PREVENT_YIELD: u32 = 1 << 1;
pub const ACT_FLAG_DIRECT_EVAL: u32 = 1 << 2;
/// The activation's environment records were created for it (delayed init)
/// and are released on unwind unless captured.
pub const ACT_FLAG_ENV_OWNED: u32 = 1 << 3;

/// One in-flight function invocation.
pub struct Activation {
    /// The callee value; holding it here keeps the closure alive for the
    /// whole invocation.
    pub func: TVal,
    /// Next instruction index (compiled functions only).
    pub pc: usize,
    /// Absolute value-stack index of register 0.
    pub idx_bottom: usize,
    /// Absolute value-stack index where the caller expects the return value.
    pub idx_retval: usize,
    pub lex_env: Option<EnvId>,
    pub var_env: Option<EnvId>,
    pub flags: u32,
}

impl Activation {
    /// The compiled function template, if the callee is one.
    pub fn compiled(&self) -> Option<Rc<CompiledFunction>> {
        match &self.func {
            TVal::Object(obj) => match &obj.borrow().exotic {
                ExoticObject::Function(JsFunction::Compiled(c)) => Some(c.template.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn prevents_yield(&self) -> bool {
        self.flags & ACT_FLAG_PREVENT_YIELD != 0
    }
}

// Catcher flags.  Bit 0 selects the type.
pub const CAT_TYPE_LABEL: u32 = 1 << 0;
pub const CAT_FLAG_CATCH_ENABLED: u32 = 1 << 1;
pub const CAT_FLAG_FINALLY_ENABLED: u32 = 1 << 2;
pub const CAT_FLAG_CATCH_BINDING_ENABLED: u32 = 1 << 3;
pub const CAT_FLAG_LEXENV_ACTIVE: u32 = 1 << 4;

/// A try/catch/finally region, a labeled break/continue site, or a `with`
/// binding lifetime.
pub struct Catcher {
    pub flags: u32,
    /// Owning activation index.
    pub callstack_index: usize,
    /// Instruction index of the first of the two jump slots.
    pub pc_base: usize,
    /// Absolute value-stack index of the two reserved registers
    /// (caught value, completion type code).
    pub idx_base: usize,
    /// Label id (LABEL catchers).
    pub label_id: u32,
    /// Catch-variable name (TCF catchers with a catch binding).
    pub varname: Option<JsString>,
    /// Environment spliced into the activation's lex_env while this catcher
    /// is active (catch binding or `with` binding).
    pub lex_env: Option<EnvId>,
}

impl Catcher {
    pub fn is_label(&self) -> bool {
        self.flags & CAT_TYPE_LABEL != 0
    }

    pub fn is_tcf(&self) -> bool {
        !self.is_label()
    }

    pub fn catch_enabled(&self) -> bool {
        self.flags & CAT_FLAG_CATCH_ENABLED != 0
    }

    pub fn finally_enabled(&self) -> bool {
        self.flags & CAT_FLAG_FINALLY_ENABLED != 0
    }

    pub fn catch_binding_enabled(&self) -> bool {
        self.flags & CAT_FLAG_CATCH_BINDING_ENABLED != 0
    }

    pub fn lexenv_active(&self) -> bool {
        self.flags & CAT_FLAG_LEXENV_ACTIVE != 0
    }
}

impl Heap {
    /// Pop activations above `target_top`, releasing owned environments and
    /// the callee references.  The length is re-read every iteration:
    /// releasing a callee may reenter and push/pop further frames.
    pub fn unwind_callstack(&mut self, tid: ThreadId, target_top: usize) {
        loop {
            let popped = {
                let thr = self.thread_mut(tid);
                if thr.callstack.len() <= target_top {
                    break;
                }
                thr.callstack.pop()
            };
            let Some(act) = popped else { break };
            if act.prevents_yield() {
                let thr = self.thread_mut(tid);
                thr.preventcount = thr.preventcount.saturating_sub(1);
            }
            if act.flags & ACT_FLAG_ENV_OWNED != 0 {
                if let Some(lex) = act.lex_env {
                    if act.var_env != Some(lex) {
                        self.envs.free_if_uncaptured(lex);
                    }
                }
                if let Some(var) = act.var_env {
                    self.envs.free_if_uncaptured(var);
                }
            }
            drop(act);
        }
    }

    /// Pop catchers above `target_top`.  An active lexical-environment
    /// splice is undone before the catcher is dropped.
    pub fn unwind_catchstack(&mut self, tid: ThreadId, target_top: usize) {
        loop {
            let popped = {
                let thr = self.thread_mut(tid);
                if thr.catchstack.len() <= target_top {
                    break;
                }
                thr.catchstack.pop()
            };
            let Some(cat) = popped else { break };
            if cat.lexenv_active() {
                self.restore_catcher_lexenv(tid, &cat);
            }
        }
    }

    /// Restore the owning activation's lex_env to the spliced environment's
    /// outer record.
    pub(crate) fn restore_catcher_lexenv(&mut self, tid: ThreadId, cat: &Catcher) {
        let Some(env) = cat.lex_env else { return };
        let outer = self.envs.outer_of(env);
        {
            let thr = self.thread_mut(tid);
            if let Some(act) = thr.callstack.get_mut(cat.callstack_index) {
                act.lex_env = outer;
            }
        }
        self.envs.free_if_uncaptured(env);
    }

    /// Reconfigure the value stack when a callee returns into activation
    /// `act_idx`.  `retval_count` is 1 for a normal return and 0 for a
    /// finally continuation.
    pub fn reconfig_valstack(&mut self, tid: ThreadId, act_idx: usize, retval_count: usize) {
        let thr = self.thread_mut(tid);
        let (idx_bottom, idx_retval) = {
            let act = &thr.callstack[act_idx];
            (act.idx_bottom, act.idx_retval)
        };
        let nregs = thr.callstack[act_idx]
            .compiled()
            .map(|f| f.nregs as usize)
            .unwrap_or(0);

        thr.bottom = idx_bottom;
        // Clamp so the retval (if any) is the topmost live slot, then extend
        // back out to the full register window.
        let top = idx_retval + retval_count;
        thr.set_top(top);
        thr.set_top(idx_bottom + nregs);
    }
}
