//! Object model
//!
//! Objects are reference-counted cells holding a property table, a prototype
//! link and an exotic-behavior tag (array, function, thread handle, regexp,
//! enumerator).  Property reads and writes that can run user code (accessors)
//! live on `Heap` so they can reenter the executor.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::bytecode::CompiledFunction;
use crate::error::JsError;
use crate::heap::Heap;
use crate::thread::ThreadId;
use crate::value::{number_to_string, JsString, NativeFn, TVal};

/// Reference to a heap-allocated object; clone bumps the reference count.
pub type ObjectRef = Rc<RefCell<JsObject>>;

/// Property key: string or array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(JsString),
    Index(u32),
}

impl PropertyKey {
    /// Build a key from an already-primitive value.  Callers coerce objects
    /// with ToPrimitive/ToString first.
    pub fn from_primitive(value: &TVal) -> PropertyKey {
        match value {
            TVal::Number(n) => {
                let idx = *n as u32;
                if idx as f64 == *n && !(*n == 0.0 && n.is_sign_negative()) {
                    PropertyKey::Index(idx)
                } else {
                    PropertyKey::from(number_to_string(*n).as_str())
                }
            }
            TVal::String(s) => PropertyKey::from(s.as_str()),
            other => PropertyKey::from(crate::coerce::primitive_to_string(other).as_str()),
        }
    }

    pub fn as_index(&self) -> Option<u32> {
        match self {
            PropertyKey::Index(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        // Canonical numeric strings become array indices.
        if let Ok(idx) = s.parse::<u32>() {
            if idx.to_string() == s {
                return PropertyKey::Index(idx);
            }
        }
        PropertyKey::String(JsString::from(s))
    }
}

impl From<JsString> for PropertyKey {
    fn from(s: JsString) -> Self {
        PropertyKey::from(s.as_str())
    }
}

impl From<u32> for PropertyKey {
    fn from(idx: u32) -> Self {
        PropertyKey::Index(idx)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::String(s) => write!(f, "{}", s),
            PropertyKey::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Property descriptor
#[derive(Debug, Clone)]
pub struct Property {
    pub value: TVal,
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
    pub getter: Option<ObjectRef>,
    pub setter: Option<ObjectRef>,
}

impl Property {
    pub fn data(value: TVal) -> Self {
        Self {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
            getter: None,
            setter: None,
        }
    }

    pub fn with_flags(value: TVal, writable: bool, enumerable: bool, configurable: bool) -> Self {
        Self {
            value,
            writable,
            enumerable,
            configurable,
            getter: None,
            setter: None,
        }
    }

    pub fn accessor(getter: Option<ObjectRef>, setter: Option<ObjectRef>) -> Self {
        Self {
            value: TVal::Undefined,
            writable: false,
            enumerable: true,
            configurable: true,
            getter,
            setter,
        }
    }

    pub fn is_accessor(&self) -> bool {
        self.getter.is_some() || self.setter.is_some()
    }
}

/// Function representation carried by function-class objects.
#[derive(Clone)]
pub enum JsFunction {
    /// Closure over a compiled function template.
    Compiled(CompiledClosure),
    /// Native Rust function.
    Native(NativeFunction),
    /// Bound function (Function.prototype.bind result).
    Bound(Box<BoundFunction>),
}

impl JsFunction {
    pub fn name(&self) -> Option<&str> {
        match self {
            JsFunction::Compiled(c) => c.template.name.as_ref().map(|s| s.as_str()),
            JsFunction::Native(n) => Some(&n.name),
            JsFunction::Bound(_) => Some("bound"),
        }
    }
}

impl fmt::Debug for JsFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function: {}]", self.name().unwrap_or("anonymous"))
    }
}

/// A compiled function template plus its captured scope.
#[derive(Clone)]
pub struct CompiledClosure {
    pub template: Rc<CompiledFunction>,
    /// Captured lexical environment; `None` means the global environment.
    pub scope: Option<crate::env::EnvId>,
}

/// Native function wrapper
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub func: NativeFn,
    pub arity: usize,
}

/// Data for a bound function.  The target may itself be bound; call setup
/// flattens the whole chain before dispatch.
#[derive(Debug, Clone)]
pub struct BoundFunction {
    pub target: TVal,
    pub this_arg: TVal,
    pub bound_args: Vec<TVal>,
}

/// State of a for-in enumerator created by INITENUM.
#[derive(Debug)]
pub struct EnumState {
    pub target: ObjectRef,
    pub keys: Vec<PropertyKey>,
    pub index: usize,
}

/// Exotic object behavior
pub enum ExoticObject {
    Ordinary,
    Array { length: u32 },
    Function(JsFunction),
    /// Coroutine handle; the thread itself lives in the heap's thread arena.
    Thread(ThreadId),
    RegExp { source: JsString, flags: JsString },
    Enumerator(EnumState),
}

/// A runtime object
pub struct JsObject {
    pub prototype: Option<ObjectRef>,
    pub extensible: bool,
    pub properties: FxHashMap<PropertyKey, Property>,
    pub exotic: ExoticObject,
}

impl JsObject {
    pub fn new() -> Self {
        Self {
            prototype: None,
            extensible: true,
            properties: FxHashMap::default(),
            exotic: ExoticObject::Ordinary,
        }
    }

    pub fn with_prototype(prototype: Option<ObjectRef>) -> Self {
        Self {
            prototype,
            extensible: true,
            properties: FxHashMap::default(),
            exotic: ExoticObject::Ordinary,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.exotic, ExoticObject::Function(_))
    }

    pub fn as_function(&self) -> Option<&JsFunction> {
        match &self.exotic {
            ExoticObject::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<ThreadId> {
        match self.exotic {
            ExoticObject::Thread(id) => Some(id),
            _ => None,
        }
    }

    pub fn array_length(&self) -> Option<u32> {
        match self.exotic {
            ExoticObject::Array { length } => Some(length),
            _ => None,
        }
    }

    pub fn get_own(&self, key: &PropertyKey) -> Option<&Property> {
        self.properties.get(key)
    }

    pub fn has_own(&self, key: &PropertyKey) -> bool {
        self.properties.contains_key(key)
    }

    /// Define an own property, ignoring extensibility and existing
    /// attributes (the compiler-facing \[\[DefineOwnProperty\]\] shortcut).
    pub fn define_property(&mut self, key: PropertyKey, prop: Property) {
        if let (ExoticObject::Array { length }, PropertyKey::Index(idx)) =
            (&mut self.exotic, &key)
        {
            if *idx >= *length {
                *length = idx + 1;
            }
        }
        self.properties.insert(key, prop);
    }

    pub(crate) fn fmt_brief(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.exotic {
            ExoticObject::Ordinary => write!(f, "{{...}}"),
            ExoticObject::Array { length } => write!(f, "[array length={}]", length),
            ExoticObject::Function(func) => write!(f, "{:?}", func),
            ExoticObject::Thread(id) => write!(f, "[thread #{}]", id.0),
            ExoticObject::RegExp { source, flags } => write!(f, "/{}/{}", source, flags),
            ExoticObject::Enumerator(_) => write!(f, "[enumerator]"),
        }
    }
}

impl Default for JsObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_brief(f)
    }
}

/// Allocate a plain object.
pub fn create_object() -> ObjectRef {
    Rc::new(RefCell::new(JsObject::new()))
}

/// Allocate an empty array object.
pub fn create_array() -> ObjectRef {
    let mut obj = JsObject::new();
    obj.exotic = ExoticObject::Array { length: 0 };
    Rc::new(RefCell::new(obj))
}

/// Allocate a function-class object.
pub fn create_function(func: JsFunction) -> ObjectRef {
    let mut obj = JsObject::new();
    obj.exotic = ExoticObject::Function(func);
    Rc::new(RefCell::new(obj))
}

/// Allocate a native-function object.
pub fn create_native_function(name: &str, func: NativeFn, arity: usize) -> ObjectRef {
    create_function(JsFunction::Native(NativeFunction {
        name: name.to_string(),
        func,
        arity,
    }))
}

/// Instantiate a closure over a compiled function template.
///
/// Every closure gets a fresh `prototype` object carrying a `constructor`
/// back-reference, so it is usable with `new` out of the box (E5 Section
/// 13.2, steps 16-18).
pub fn create_closure(
    template: Rc<CompiledFunction>,
    scope: Option<crate::env::EnvId>,
) -> ObjectRef {
    let closure = create_function(JsFunction::Compiled(CompiledClosure { template, scope }));
    let proto = create_object();
    proto.borrow_mut().define_property(
        PropertyKey::from("constructor"),
        Property::with_flags(TVal::Object(closure.clone()), true, false, true),
    );
    closure.borrow_mut().define_property(
        PropertyKey::from("prototype"),
        Property::with_flags(TVal::Object(proto), true, false, false),
    );
    closure
}

// ═══════════════════════════════════════════════════════════════════════════
// Property operations (may reenter the executor through accessors)
// ═══════════════════════════════════════════════════════════════════════════

impl Heap {
    /// Coerce a value to a property key (ToPrimitive may run user code).
    pub fn to_property_key(&mut self, key: &TVal) -> Result<PropertyKey, JsError> {
        let prim = self.to_primitive(key, crate::coerce::Hint::String)?;
        Ok(PropertyKey::from_primitive(&prim))
    }

    /// \[\[Get\]\] with the base value rules of E5 Section 11.2.1.
    pub fn get_prop(&mut self, base: &TVal, key: &TVal) -> Result<TVal, JsError> {
        let k = self.to_property_key(key)?;
        match base {
            TVal::Object(obj) => self.get_prop_object(obj, &k, base),
            TVal::String(s) => Ok(string_own_property(s, &k)),
            TVal::Buffer(b) => Ok(match &k {
                PropertyKey::String(name) if *name == "length" => TVal::Number(b.len() as f64),
                PropertyKey::Index(i) => b
                    .as_bytes()
                    .get(*i as usize)
                    .map(|byte| TVal::Number(*byte as f64))
                    .unwrap_or(TVal::Undefined),
                _ => TVal::Undefined,
            }),
            TVal::Number(_) | TVal::Boolean(_) | TVal::Lightfunc(_) => Ok(TVal::Undefined),
            TVal::Null | TVal::Undefined => Err(JsError::type_error(format!(
                "cannot read property '{}' of {}",
                k,
                base.type_of()
            ))),
        }
    }

    fn get_prop_object(
        &mut self,
        obj: &ObjectRef,
        key: &PropertyKey,
        this: &TVal,
    ) -> Result<TVal, JsError> {
        let mut cursor = obj.clone();
        loop {
            let (found, next) = {
                let b = cursor.borrow();
                if let Some(prop) = b.get_own(key) {
                    if prop.is_accessor() {
                        (Some(Err(prop.getter.clone())), None)
                    } else {
                        (Some(Ok(prop.value.clone())), None)
                    }
                } else if let (ExoticObject::Array { length }, PropertyKey::String(name)) =
                    (&b.exotic, key)
                {
                    if *name == "length" {
                        (Some(Ok(TVal::Number(*length as f64))), None)
                    } else {
                        (None, b.prototype.clone())
                    }
                } else {
                    (None, b.prototype.clone())
                }
            };
            match found {
                Some(Ok(value)) => return Ok(value),
                Some(Err(getter)) => {
                    return match getter {
                        Some(g) => crate::call::call_value(self, TVal::Object(g), this.clone(), &[]),
                        None => Ok(TVal::Undefined),
                    };
                }
                None => match next {
                    Some(proto) => cursor = proto,
                    None => return Ok(TVal::Undefined),
                },
            }
        }
    }

    /// \[\[Put\]\] (E5 Section 8.12.5) with array length special behavior.
    pub fn put_prop(
        &mut self,
        base: &TVal,
        key: &TVal,
        value: TVal,
        strict: bool,
    ) -> Result<(), JsError> {
        let k = self.to_property_key(key)?;
        let obj = match base {
            TVal::Object(obj) => obj.clone(),
            TVal::Null | TVal::Undefined => {
                return Err(JsError::type_error(format!(
                    "cannot set property '{}' of {}",
                    k,
                    base.type_of()
                )));
            }
            _ => {
                // Primitive base: assignments are lost; strict mode throws.
                if strict {
                    return Err(JsError::type_error(format!(
                        "cannot set property '{}' on primitive",
                        k
                    )));
                }
                return Ok(());
            }
        };

        // Array 'length' write truncates or extends.
        if let PropertyKey::String(name) = &k {
            if *name == "length" && obj.borrow().array_length().is_some() {
                let len = self.to_uint32(&value)?;
                set_array_length(&obj, len);
                return Ok(());
            }
        }

        // Own or inherited accessor wins; inherited non-writable data blocks.
        enum Put {
            WriteOwn,
            CreateOwn,
            CallSetter(Option<ObjectRef>),
            Blocked,
            Walk(Option<ObjectRef>),
        }

        let mut cursor = obj.clone();
        let mut own = true;
        loop {
            let action = {
                let b = cursor.borrow();
                match b.get_own(&k) {
                    Some(prop) if prop.is_accessor() => Put::CallSetter(prop.setter.clone()),
                    Some(prop) if !prop.writable => Put::Blocked,
                    Some(_) if own => Put::WriteOwn,
                    Some(_) => Put::CreateOwn,
                    None => match b.prototype.clone() {
                        Some(proto) => Put::Walk(Some(proto)),
                        None => Put::CreateOwn,
                    },
                }
            };
            match action {
                Put::WriteOwn => {
                    let mut bm = cursor.borrow_mut();
                    if let Some(slot) = bm.properties.get_mut(&k) {
                        let old = std::mem::replace(&mut slot.value, value);
                        drop(old);
                    }
                    return Ok(());
                }
                Put::CreateOwn => {
                    let mut bm = obj.borrow_mut();
                    if !bm.extensible {
                        if strict {
                            return Err(JsError::type_error(format!(
                                "cannot add property '{}' to non-extensible object",
                                k
                            )));
                        }
                        return Ok(());
                    }
                    bm.define_property(k, Property::data(value));
                    return Ok(());
                }
                Put::CallSetter(Some(s)) => {
                    return crate::call::call_value(self, TVal::Object(s), base.clone(), &[value])
                        .map(|_| ());
                }
                Put::CallSetter(None) => {
                    if strict {
                        return Err(JsError::type_error(format!(
                            "cannot set property '{}': getter-only accessor",
                            k
                        )));
                    }
                    return Ok(());
                }
                Put::Blocked => {
                    if strict {
                        return Err(JsError::type_error(format!(
                            "cannot set read-only property '{}'",
                            k
                        )));
                    }
                    return Ok(());
                }
                Put::Walk(next) => {
                    cursor = match next {
                        Some(proto) => proto,
                        None => return Ok(()),
                    };
                    own = false;
                }
            }
        }
    }

    /// \[\[Delete\]\] (E5 Section 8.12.7).
    pub fn del_prop(&mut self, base: &TVal, key: &TVal, strict: bool) -> Result<bool, JsError> {
        let k = self.to_property_key(key)?;
        match base {
            TVal::Object(obj) => {
                let mut b = obj.borrow_mut();
                match b.get_own(&k) {
                    Some(prop) if prop.configurable => {
                        b.properties.remove(&k);
                        Ok(true)
                    }
                    Some(_) => {
                        if strict {
                            Err(JsError::type_error(format!(
                                "cannot delete non-configurable property '{}'",
                                k
                            )))
                        } else {
                            Ok(false)
                        }
                    }
                    None => Ok(true),
                }
            }
            TVal::String(s) => {
                // String length and indices are non-configurable.
                let fixed = matches!(&k, PropertyKey::String(n) if *n == "length")
                    || matches!(&k, PropertyKey::Index(i) if (*i as usize) < s.char_len());
                if fixed && strict {
                    Err(JsError::type_error("cannot delete string property"))
                } else {
                    Ok(!fixed)
                }
            }
            TVal::Null | TVal::Undefined => Err(JsError::type_error(format!(
                "cannot delete property '{}' of {}",
                k,
                base.type_of()
            ))),
            _ => Ok(true),
        }
    }

    /// \[\[HasProperty\]\]: walks the prototype chain, no side effects.
    pub fn has_prop(&mut self, obj: &ObjectRef, key: &PropertyKey) -> bool {
        let mut cursor = obj.clone();
        loop {
            let next = {
                let b = cursor.borrow();
                if b.has_own(key) {
                    return true;
                }
                if let (ExoticObject::Array { .. }, PropertyKey::String(name)) = (&b.exotic, key) {
                    if *name == "length" {
                        return true;
                    }
                }
                b.prototype.clone()
            };
            match next {
                Some(proto) => cursor = proto,
                None => return false,
            }
        }
    }

    /// Install an accessor half via the defineProperty-equivalent path
    /// (INITGET/INITSET).
    pub fn define_accessor(
        &mut self,
        obj: &ObjectRef,
        key: PropertyKey,
        func: ObjectRef,
        is_set: bool,
    ) {
        let mut b = obj.borrow_mut();
        let prop = b
            .properties
            .entry(key)
            .or_insert_with(|| Property::accessor(None, None));
        prop.value = TVal::Undefined;
        prop.writable = false;
        if is_set {
            prop.setter = Some(func);
        } else {
            prop.getter = Some(func);
        }
    }

    /// Build a RegExp-class instance for the REGEXP opcode.  Pattern
    /// execution belongs to the (external) regexp engine; the instance only
    /// carries the standard properties.
    pub fn create_regexp_instance(&mut self, source: JsString, flags: JsString) -> ObjectRef {
        let mut obj = JsObject::new();
        let f = flags.as_str();
        obj.exotic = ExoticObject::RegExp {
            source: source.clone(),
            flags: flags.clone(),
        };
        obj.define_property(
            PropertyKey::from("source"),
            Property::with_flags(TVal::String(source), false, false, false),
        );
        obj.define_property(
            PropertyKey::from("global"),
            Property::with_flags(TVal::Boolean(f.contains('g')), false, false, false),
        );
        obj.define_property(
            PropertyKey::from("ignoreCase"),
            Property::with_flags(TVal::Boolean(f.contains('i')), false, false, false),
        );
        obj.define_property(
            PropertyKey::from("multiline"),
            Property::with_flags(TVal::Boolean(f.contains('m')), false, false, false),
        );
        obj.define_property(
            PropertyKey::from("lastIndex"),
            Property::with_flags(TVal::Number(0.0), true, false, false),
        );
        Rc::new(RefCell::new(obj))
    }

    /// Create a for-in enumerator over `target` (E5 Section 12.6.4).
    /// Null/undefined targets yield the sentinel null enumerator, handled by
    /// NEXTENUM.
    pub fn make_enumerator(&mut self, target: &TVal) -> Result<TVal, JsError> {
        if target.is_null_or_undefined() {
            return Ok(TVal::Null);
        }
        let obj = self.to_object(target)?;
        let mut keys = Vec::new();
        let mut seen = rustc_hash::FxHashSet::default();
        let mut cursor = Some(obj.clone());
        while let Some(cur) = cursor {
            let b = cur.borrow();
            // Index keys first in ascending order, then string keys.
            let mut indices: Vec<u32> = b
                .properties
                .iter()
                .filter(|(k, p)| p.enumerable && k.as_index().is_some())
                .map(|(k, _)| k.as_index().unwrap_or(0))
                .collect();
            indices.sort_unstable();
            for idx in indices {
                let k = PropertyKey::Index(idx);
                if seen.insert(k.clone()) {
                    keys.push(k);
                }
            }
            for (k, p) in b.properties.iter() {
                if p.enumerable && matches!(k, PropertyKey::String(_)) && seen.insert(k.clone()) {
                    keys.push(k.clone());
                }
            }
            cursor = b.prototype.clone();
        }
        let mut en = JsObject::new();
        en.exotic = ExoticObject::Enumerator(EnumState {
            target: obj,
            keys,
            index: 0,
        });
        Ok(TVal::Object(Rc::new(RefCell::new(en))))
    }

    /// Advance an enumerator; `None` means exhausted.  Keys deleted since
    /// the snapshot are skipped.
    pub fn enum_next(&mut self, enumerator: &ObjectRef) -> Option<JsString> {
        loop {
            let (key, target) = {
                let mut b = enumerator.borrow_mut();
                let state = match &mut b.exotic {
                    ExoticObject::Enumerator(state) => state,
                    _ => return None,
                };
                if state.index >= state.keys.len() {
                    return None;
                }
                let key = state.keys[state.index].clone();
                state.index += 1;
                (key, state.target.clone())
            };
            let still_there = self.has_prop(&target, &key);
            if still_there {
                return Some(match key {
                    PropertyKey::String(s) => s,
                    PropertyKey::Index(i) => JsString::from(i.to_string()),
                });
            }
        }
    }
}

/// Array length write: truncating drops index properties above the new
/// length (E5 Section 15.4.5.1, minus the sparse subtleties).
pub fn set_array_length(obj: &ObjectRef, new_len: u32) {
    let mut b = obj.borrow_mut();
    let old_len = match b.exotic {
        ExoticObject::Array { length } => length,
        _ => return,
    };
    if new_len < old_len {
        b.properties
            .retain(|k, _| !matches!(k, PropertyKey::Index(i) if *i >= new_len));
    }
    if let ExoticObject::Array { length } = &mut b.exotic {
        *length = new_len;
    }
}

fn string_own_property(s: &JsString, key: &PropertyKey) -> TVal {
    match key {
        PropertyKey::String(name) if *name == "length" => TVal::Number(s.char_len() as f64),
        PropertyKey::Index(i) => s
            .as_str()
            .chars()
            .nth(*i as usize)
            .map(|c| TVal::from(c.to_string()))
            .unwrap_or(TVal::Undefined),
        _ => TVal::Undefined,
    }
}
