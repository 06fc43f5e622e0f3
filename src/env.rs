//! Environment records
//!
//! Declarative records hold name bindings directly; object records wrap a
//! binding object (the global object, or a `with` target).  Records live in
//! an index arena owned by the heap and are referenced by `EnvId`, which
//! avoids reference cycles between activations, closures and their scopes.

use rustc_hash::FxHashMap;

use crate::error::JsError;
use crate::heap::Heap;
use crate::object::{ObjectRef, Property, PropertyKey};
use crate::value::{JsString, TVal};

/// Environment identifier: an index into the heap's environment arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub usize);

/// A single binding in a declarative record.
#[derive(Debug, Clone)]
pub struct Binding {
    pub value: TVal,
    pub writable: bool,
    pub deletable: bool,
}

pub enum EnvKind {
    Declarative {
        bindings: FxHashMap<JsString, Binding>,
    },
    /// Object environment record; `provide_this` is set for `with` bindings
    /// (E5 Section 10.2.1.2.6).
    Object {
        target: ObjectRef,
        provide_this: bool,
    },
}

pub struct EnvRecord {
    pub kind: EnvKind,
    pub outer: Option<EnvId>,
    /// Set when a closure captured this record; captured records are never
    /// freed on activation unwind.
    pub captured: bool,
}

/// Arena for environment records with slot reuse.
#[derive(Default)]
pub struct EnvArena {
    envs: Vec<Option<EnvRecord>>,
    free_list: Vec<usize>,
}

impl EnvArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, rec: EnvRecord) -> EnvId {
        if let Some(idx) = self.free_list.pop() {
            self.envs[idx] = Some(rec);
            EnvId(idx)
        } else {
            self.envs.push(Some(rec));
            EnvId(self.envs.len() - 1)
        }
    }

    pub fn alloc_declarative(&mut self, outer: Option<EnvId>) -> EnvId {
        self.insert(EnvRecord {
            kind: EnvKind::Declarative {
                bindings: FxHashMap::default(),
            },
            outer,
            captured: false,
        })
    }

    pub fn alloc_object(
        &mut self,
        target: ObjectRef,
        provide_this: bool,
        outer: Option<EnvId>,
    ) -> EnvId {
        self.insert(EnvRecord {
            kind: EnvKind::Object {
                target,
                provide_this,
            },
            outer,
            captured: false,
        })
    }

    pub fn get(&self, id: EnvId) -> Option<&EnvRecord> {
        self.envs.get(id.0).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut EnvRecord> {
        self.envs.get_mut(id.0).and_then(|e| e.as_mut())
    }

    pub fn outer_of(&self, id: EnvId) -> Option<EnvId> {
        self.get(id).and_then(|rec| rec.outer)
    }

    /// Define a binding directly in a declarative record (embedder setup and
    /// catch-variable bindings).
    pub fn define(&mut self, id: EnvId, name: JsString, value: TVal, writable: bool) {
        if let Some(rec) = self.get_mut(id) {
            if let EnvKind::Declarative { bindings } = &mut rec.kind {
                bindings.insert(
                    name,
                    Binding {
                        value,
                        writable,
                        deletable: false,
                    },
                );
            }
        }
    }

    /// Mark `id` and its ancestors captured (called when a closure is
    /// instantiated over this scope).
    pub fn mark_captured(&mut self, id: EnvId) {
        let mut cursor = Some(id);
        while let Some(env_id) = cursor {
            match self.get_mut(env_id) {
                Some(rec) => {
                    if rec.captured {
                        break;
                    }
                    rec.captured = true;
                    cursor = rec.outer;
                }
                None => break,
            }
        }
    }

    /// Release a record unless a closure captured it.
    pub fn free_if_uncaptured(&mut self, id: EnvId) {
        if let Some(rec) = self.get(id) {
            if !rec.captured {
                self.envs[id.0] = None;
                self.free_list.push(id.0);
            }
        }
    }
}

impl Heap {
    /// The environment a compiled activation resolves identifiers from:
    /// its own lex_env when initialized, otherwise the closure's captured
    /// scope, bottoming out at the global environment.
    pub fn activation_scope(&self, tid: crate::thread::ThreadId, act_idx: usize) -> EnvId {
        let act = &self.thread(tid).callstack[act_idx];
        if let Some(env) = act.lex_env {
            return env;
        }
        self.closure_scope(&act.func)
    }

    fn closure_scope(&self, func: &TVal) -> EnvId {
        if let TVal::Object(obj) = func {
            if let crate::object::ExoticObject::Function(crate::object::JsFunction::Compiled(c)) =
                &obj.borrow().exotic
            {
                return c.scope.unwrap_or(self.global_env);
            }
        }
        self.global_env
    }

    /// Delayed environment-record initialization (runs on first DECLVAR,
    /// CLOSURE, catch binding or `with` binding).  Creates a fresh
    /// declarative record chained to the closure scope; the activation owns
    /// it and releases it on unwind unless captured.
    pub fn init_activation_envs(&mut self, tid: crate::thread::ThreadId, act_idx: usize) -> EnvId {
        // var_env stays the function-level record even when a catch or
        // `with` binding has spliced a fresh lex_env on top.
        if let Some(env) = self.thread(tid).callstack[act_idx].var_env {
            return env;
        }
        let scope = self.closure_scope(&self.thread(tid).callstack[act_idx].func);
        let env = self.envs.alloc_declarative(Some(scope));
        let act = &mut self.thread_mut(tid).callstack[act_idx];
        act.lex_env = Some(env);
        act.var_env = Some(env);
        act.flags |= crate::stack::ACT_FLAG_ENV_OWNED;
        env
    }
}

/// One step of a scope-chain walk, extracted under the arena borrow so the
/// borrow is released before any reentrant property operation runs.
enum Step {
    /// Declarative hit: value plus binding attributes.
    Binding(TVal, bool, bool),
    /// Object record: probe this target.
    Object(ObjectRef, bool),
    Miss,
}

// ═══════════════════════════════════════════════════════════════════════════
// Variable access (object records may reenter through accessors)
// ═══════════════════════════════════════════════════════════════════════════

impl Heap {
    fn env_step(&self, env_id: EnvId, name: &JsString) -> (Step, Option<EnvId>) {
        match self.envs.get(env_id) {
            Some(rec) => {
                let step = match &rec.kind {
                    EnvKind::Declarative { bindings } => match bindings.get(name) {
                        Some(b) => Step::Binding(b.value.clone(), b.writable, b.deletable),
                        None => Step::Miss,
                    },
                    EnvKind::Object {
                        target,
                        provide_this,
                    } => Step::Object(target.clone(), *provide_this),
                };
                (step, rec.outer)
            }
            None => (Step::Miss, None),
        }
    }

    /// Resolve `name` starting from `env` (falling back to the global
    /// environment).  Returns the value and the implicit `this` binding, or
    /// `None` when unresolvable and `throw` is false.
    pub fn getvar(
        &mut self,
        env: Option<EnvId>,
        name: &JsString,
        throw: bool,
    ) -> Result<Option<(TVal, TVal)>, JsError> {
        let mut cursor = Some(env.unwrap_or(self.global_env));
        while let Some(env_id) = cursor {
            let (step, outer) = self.env_step(env_id, name);
            match step {
                Step::Binding(value, _, _) => return Ok(Some((value, TVal::Undefined))),
                Step::Object(target, provide_this) => {
                    let key = PropertyKey::from(name.clone());
                    if self.has_prop(&target, &key) {
                        let base = TVal::Object(target);
                        let value = self.get_prop(&base, &TVal::String(name.clone()))?;
                        let this = if provide_this { base } else { TVal::Undefined };
                        return Ok(Some((value, this)));
                    }
                }
                Step::Miss => {}
            }
            cursor = outer;
        }
        if throw {
            Err(JsError::reference_error(format!(
                "identifier '{}' undefined",
                name
            )))
        } else {
            Ok(None)
        }
    }

    /// Assign to `name`, walking outward from `env`.  Unresolvable writes go
    /// to the global object in sloppy mode and throw in strict mode.
    pub fn putvar(
        &mut self,
        env: Option<EnvId>,
        name: &JsString,
        value: TVal,
        strict: bool,
    ) -> Result<(), JsError> {
        let mut cursor = Some(env.unwrap_or(self.global_env));
        while let Some(env_id) = cursor {
            let (step, outer) = self.env_step(env_id, name);
            match step {
                Step::Binding(_, writable, _) => {
                    if !writable {
                        if strict {
                            return Err(JsError::type_error(format!(
                                "cannot assign to immutable binding '{}'",
                                name
                            )));
                        }
                        return Ok(());
                    }
                    if let Some(rec) = self.envs.get_mut(env_id) {
                        if let EnvKind::Declarative { bindings } = &mut rec.kind {
                            if let Some(b) = bindings.get_mut(name) {
                                let old = std::mem::replace(&mut b.value, value);
                                drop(old);
                            }
                        }
                    }
                    return Ok(());
                }
                Step::Object(target, _) => {
                    let key = PropertyKey::from(name.clone());
                    if self.has_prop(&target, &key) {
                        let base = TVal::Object(target);
                        return self.put_prop(&base, &TVal::String(name.clone()), value, strict);
                    }
                }
                Step::Miss => {}
            }
            cursor = outer;
        }
        if strict {
            return Err(JsError::reference_error(format!(
                "identifier '{}' undefined",
                name
            )));
        }
        let global = TVal::Object(self.global.clone());
        self.put_prop(&global, &TVal::String(name.clone()), value, false)
    }

    /// Declare `name` in the variable environment record itself (no chain
    /// walk).  Returns true when the binding already existed, in which case
    /// the caller updates it with a regular putvar.
    pub fn declvar(
        &mut self,
        var_env: EnvId,
        name: &JsString,
        value: TVal,
        prop_flags: u32,
        _is_func_decl: bool,
    ) -> Result<bool, JsError> {
        use crate::bytecode::{PROP_CONFIGURABLE, PROP_ENUMERABLE, PROP_WRITABLE};
        let target = {
            let rec = self
                .envs
                .get_mut(var_env)
                .ok_or_else(|| JsError::internal("DECLVAR: dead environment"))?;
            match &mut rec.kind {
                EnvKind::Declarative { bindings } => {
                    if bindings.contains_key(name) {
                        return Ok(true);
                    }
                    bindings.insert(
                        name.clone(),
                        Binding {
                            value,
                            writable: prop_flags & PROP_WRITABLE != 0,
                            deletable: prop_flags & PROP_CONFIGURABLE != 0,
                        },
                    );
                    return Ok(false);
                }
                EnvKind::Object { target, .. } => target.clone(),
            }
        };
        let key = PropertyKey::from(name.clone());
        if target.borrow().has_own(&key) {
            return Ok(true);
        }
        target.borrow_mut().define_property(
            key,
            Property::with_flags(
                value,
                prop_flags & PROP_WRITABLE != 0,
                prop_flags & PROP_ENUMERABLE != 0,
                prop_flags & PROP_CONFIGURABLE != 0,
            ),
        );
        Ok(false)
    }

    /// `delete name` (DELVAR): true when the binding is gone afterwards.
    pub fn delvar(&mut self, env: Option<EnvId>, name: &JsString) -> Result<bool, JsError> {
        let mut cursor = Some(env.unwrap_or(self.global_env));
        while let Some(env_id) = cursor {
            let (step, outer) = self.env_step(env_id, name);
            match step {
                Step::Binding(_, _, deletable) => {
                    if deletable {
                        if let Some(rec) = self.envs.get_mut(env_id) {
                            if let EnvKind::Declarative { bindings } = &mut rec.kind {
                                bindings.remove(name);
                            }
                        }
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Step::Object(target, _) => {
                    let key = PropertyKey::from(name.clone());
                    if self.has_prop(&target, &key) {
                        let base = TVal::Object(target);
                        return self.del_prop(&base, &TVal::String(name.clone()), false);
                    }
                }
                Step::Miss => {}
            }
            cursor = outer;
        }
        // Unresolvable: delete evaluates to true.
        Ok(true)
    }
}
