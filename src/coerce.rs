//! Value coercions and abstract operations
//!
//! Every coercion here except ToBoolean may call back into user code
//! (valueOf/toString) and therefore may reenter the executor; callers keep
//! intermediate values on the value stack or in owned locals, never in raw
//! pointers into the stacks.

use std::rc::Rc;

use crate::error::JsError;
use crate::heap::Heap;
use crate::object::{create_object, ExoticObject, ObjectRef, Property, PropertyKey};
use crate::value::{number_to_string, string_to_number, JsString, TVal};

/// ToPrimitive hint (E5 Section 8.12.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    None,
    String,
    Number,
}

// Relational-comparison flags (E5 Section 11.8.5).  The negate flag cannot
// be expressed by the caller inverting the result: NaN comparisons are false
// both ways.
pub const COMPARE_EVAL_LEFT_FIRST: u32 = 1 << 0;
pub const COMPARE_NEGATE: u32 = 1 << 1;

/// ToString for any primitive (pure).  Objects must go through ToPrimitive
/// first.
pub fn primitive_to_string(v: &TVal) -> String {
    match v {
        TVal::Undefined => "undefined".to_string(),
        TVal::Null => "null".to_string(),
        TVal::Boolean(true) => "true".to_string(),
        TVal::Boolean(false) => "false".to_string(),
        TVal::Number(n) => number_to_string(*n),
        TVal::String(s) => s.as_str().to_string(),
        TVal::Buffer(b) => b.to_coerced_string(),
        TVal::Lightfunc(_) => "function lightfunc() { [native code] }".to_string(),
        TVal::Object(_) => "[object Object]".to_string(),
    }
}

/// ToNumber for any primitive (pure).
pub fn primitive_to_number(v: &TVal) -> f64 {
    match v {
        TVal::Undefined => f64::NAN,
        TVal::Null => 0.0,
        TVal::Boolean(true) => 1.0,
        TVal::Boolean(false) => 0.0,
        TVal::Number(n) => *n,
        TVal::String(s) => string_to_number(s.as_str()),
        TVal::Buffer(b) => string_to_number(&b.to_coerced_string()),
        TVal::Lightfunc(_) => f64::NAN,
        TVal::Object(_) => f64::NAN,
    }
}

/// ToInt32 (E5 Section 9.5): ToNumber, finite check, truncate, wrap mod 2^32
/// into the signed range.
pub fn number_to_int32(d: f64) -> i32 {
    number_to_uint32(d) as i32
}

/// ToUint32 (E5 Section 9.6).
pub fn number_to_uint32(d: f64) -> u32 {
    if !d.is_finite() || d == 0.0 {
        return 0;
    }
    let d = d.trunc();
    const TWO32: f64 = 4294967296.0;
    let mut m = d % TWO32;
    if m < 0.0 {
        m += TWO32;
    }
    // m is now in [0, 2^32) and integral, hence exactly representable.
    m as u32
}

impl Heap {
    /// ToPrimitive (E5 Section 9.1).  For objects this runs the
    /// \[\[DefaultValue\]\] algorithm, which may call valueOf/toString.
    pub fn to_primitive(&mut self, v: &TVal, hint: Hint) -> Result<TVal, JsError> {
        let obj = match v {
            TVal::Object(obj) => obj.clone(),
            other => return Ok(other.clone()),
        };
        // Hint NONE behaves as Number for everything the core creates
        // (Date is the only String-hinted class and lives in the embedder).
        let try_string_first = hint == Hint::String;
        let methods: [&str; 2] = if try_string_first {
            ["toString", "valueOf"]
        } else {
            ["valueOf", "toString"]
        };
        let base = TVal::Object(obj);
        for name in methods {
            let m = self.get_prop(&base, &TVal::from(name))?;
            if is_callable(&m) {
                let result = crate::call::call_value(self, m, base.clone(), &[])?;
                if !result.is_object() {
                    return Ok(result);
                }
            }
        }
        Err(JsError::type_error("cannot convert object to primitive"))
    }

    /// ToNumber (E5 Section 9.3).
    pub fn to_number(&mut self, v: &TVal) -> Result<f64, JsError> {
        match v {
            TVal::Object(_) => {
                let prim = self.to_primitive(v, Hint::Number)?;
                Ok(primitive_to_number(&prim))
            }
            other => Ok(primitive_to_number(other)),
        }
    }

    pub fn to_int32(&mut self, v: &TVal) -> Result<i32, JsError> {
        Ok(number_to_int32(self.to_number(v)?))
    }

    pub fn to_uint32(&mut self, v: &TVal) -> Result<u32, JsError> {
        Ok(number_to_uint32(self.to_number(v)?))
    }

    /// ToString (E5 Section 9.8).
    pub fn to_string_value(&mut self, v: &TVal) -> Result<JsString, JsError> {
        match v {
            TVal::String(s) => Ok(s.clone()),
            TVal::Object(_) => {
                let prim = self.to_primitive(v, Hint::String)?;
                Ok(JsString::from(primitive_to_string(&prim)))
            }
            other => Ok(JsString::from(primitive_to_string(other))),
        }
    }

    /// ToObject (E5 Section 9.9).  Primitive wrappers materialize just the
    /// own properties the core reads back (string indices and length);
    /// full wrapper classes belong to the embedder.
    pub fn to_object(&mut self, v: &TVal) -> Result<ObjectRef, JsError> {
        match v {
            TVal::Object(obj) => Ok(obj.clone()),
            TVal::Null | TVal::Undefined => Err(JsError::type_error(format!(
                "cannot convert {} to object",
                v.type_of()
            ))),
            TVal::String(s) => {
                let obj = create_object();
                {
                    let mut b = obj.borrow_mut();
                    for (i, ch) in s.as_str().chars().enumerate() {
                        b.define_property(
                            PropertyKey::Index(i as u32),
                            Property::with_flags(TVal::from(ch.to_string()), false, true, false),
                        );
                    }
                    b.define_property(
                        PropertyKey::from("length"),
                        Property::with_flags(
                            TVal::Number(s.char_len() as f64),
                            false,
                            false,
                            false,
                        ),
                    );
                }
                Ok(obj)
            }
            _ => Ok(create_object()),
        }
    }

    /// Abstract equality (E5 Section 11.9.3).
    pub fn abstract_equals(&mut self, x: &TVal, y: &TVal) -> Result<bool, JsError> {
        use TVal::*;
        match (x, y) {
            // Same-type comparisons collapse to strict equality.
            (Undefined, Undefined)
            | (Null, Null)
            | (Boolean(_), Boolean(_))
            | (Number(_), Number(_))
            | (String(_), String(_))
            | (Object(_), Object(_))
            | (Lightfunc(_), Lightfunc(_)) => Ok(x.strict_equals(y)),
            // Buffer equality is host-defined: contents comparison.
            (Buffer(a), Buffer(b)) => Ok(a.as_bytes() == b.as_bytes()),

            (Null, Undefined) | (Undefined, Null) => Ok(true),

            (Number(a), String(s)) => Ok(*a == string_to_number(s.as_str())),
            (String(s), Number(b)) => Ok(string_to_number(s.as_str()) == *b),

            (Boolean(_), _) => {
                let xn = TVal::Number(primitive_to_number(x));
                self.abstract_equals(&xn, y)
            }
            (_, Boolean(_)) => {
                let yn = TVal::Number(primitive_to_number(y));
                self.abstract_equals(x, &yn)
            }

            (Number(_) | String(_) | Buffer(_), Object(_)) => {
                let yp = self.to_primitive(y, Hint::None)?;
                self.abstract_equals(x, &yp)
            }
            (Object(_), Number(_) | String(_) | Buffer(_)) => {
                let xp = self.to_primitive(x, Hint::None)?;
                self.abstract_equals(&xp, y)
            }

            // Buffers compare to strings through their coerced contents.
            (Buffer(a), String(s)) | (String(s), Buffer(a)) => {
                Ok(a.to_coerced_string() == s.as_str())
            }

            _ => Ok(false),
        }
    }

    /// Abstract relational comparison, x < y (E5 Section 11.8.5).
    ///
    /// `COMPARE_EVAL_LEFT_FIRST` selects the coercion order (side effects
    /// are observable); `COMPARE_NEGATE` computes NOT(x < y) *after* the
    /// NaN check, because NaN makes `x >= y` different from `!(x < y)`.
    pub fn compare(&mut self, x: &TVal, y: &TVal, flags: u32) -> Result<bool, JsError> {
        let (px, py) = if flags & COMPARE_EVAL_LEFT_FIRST != 0 {
            let px = self.to_primitive(x, Hint::Number)?;
            let py = self.to_primitive(y, Hint::Number)?;
            (px, py)
        } else {
            let py = self.to_primitive(y, Hint::Number)?;
            let px = self.to_primitive(x, Hint::Number)?;
            (px, py)
        };

        let rc = match (&px, &py) {
            (TVal::String(a), TVal::String(b)) => a.as_str() < b.as_str(),
            _ => {
                let d1 = primitive_to_number(&px);
                let d2 = primitive_to_number(&py);
                if d1.is_nan() || d2.is_nan() {
                    // Undefined comparison: false regardless of negation.
                    return Ok(false);
                }
                d1 < d2
            }
        };
        Ok(if flags & COMPARE_NEGATE != 0 { !rc } else { rc })
    }

    /// The `in` operator (E5 Section 11.8.7).
    pub fn js_in(&mut self, lhs: &TVal, rhs: &TVal) -> Result<bool, JsError> {
        let obj = match rhs {
            TVal::Object(obj) => obj.clone(),
            _ => {
                return Err(JsError::type_error(
                    "invalid base value for 'in' operator",
                ));
            }
        };
        let key = self.to_property_key(lhs)?;
        Ok(self.has_prop(&obj, &key))
    }

    /// The `instanceof` operator (E5 Sections 11.8.6, 15.3.5.3).
    pub fn instanceof(&mut self, lhs: &TVal, rhs: &TVal) -> Result<bool, JsError> {
        let mut target = rhs.clone();
        // Bound functions delegate to their target function.
        loop {
            let next = match &target {
                TVal::Object(obj) => match &obj.borrow().exotic {
                    ExoticObject::Function(crate::object::JsFunction::Bound(b)) => {
                        Some(b.target.clone())
                    }
                    ExoticObject::Function(_) => None,
                    _ => {
                        return Err(JsError::type_error(
                            "invalid instanceof right-hand side",
                        ));
                    }
                },
                TVal::Lightfunc(_) => return Ok(false),
                _ => {
                    return Err(JsError::type_error(
                        "invalid instanceof right-hand side",
                    ));
                }
            };
            match next {
                Some(t) => target = t,
                None => break,
            }
        }

        let proto = self.get_prop(&target, &TVal::from("prototype"))?;
        let proto_obj = match proto {
            TVal::Object(o) => o,
            _ => {
                return Err(JsError::type_error(
                    "instanceof prototype is not an object",
                ));
            }
        };

        let mut cursor = match lhs {
            TVal::Object(obj) => obj.borrow().prototype.clone(),
            _ => return Ok(false),
        };
        while let Some(p) = cursor {
            if Rc::ptr_eq(&p, &proto_obj) {
                return Ok(true);
            }
            cursor = p.borrow().prototype.clone();
        }
        Ok(false)
    }
}

fn is_callable(v: &TVal) -> bool {
    match v {
        TVal::Object(obj) => obj.borrow().is_callable(),
        TVal::Lightfunc(_) => true,
        _ => false,
    }
}
