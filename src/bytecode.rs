//! Bytecode instruction format and function assembly
//!
//! Instructions are packed 32-bit words with fields `op:6, a:8, b:9, c:9`,
//! plus the wide variants `bc:18` and `abc:26`.  B and C operands at or above
//! `REGLIMIT` address the constant pool at `x - REGLIMIT`; opcodes whose
//! register counts can exceed the field width have indirect twins where an
//! operand names the register *holding* the real index.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::value::{JsString, TVal};

/// Register/constant boundary for B and C operands.
pub const REGLIMIT: u32 = 256;

/// Bias applied to the signed 18-bit LDINT immediate.
pub const LDINT_BIAS: i32 = 1 << 17;

/// Shift applied by LDINTX when accumulating high bits.
pub const LDINTX_SHIFT: u32 = 18;

/// Bias applied to the signed 26-bit JUMP displacement.
pub const JUMP_BIAS: i32 = 1 << 25;

// Property descriptor flag bits (DECLVAR 'a' field, low bits).
pub const PROP_WRITABLE: u32 = 1 << 0;
pub const PROP_ENUMERABLE: u32 = 1 << 1;
pub const PROP_CONFIGURABLE: u32 = 1 << 2;
pub const PROP_FLAGS_MASK: u32 = 0x07;
/// Writable + enumerable + configurable.
pub const PROP_WEC: u32 = PROP_WRITABLE | PROP_ENUMERABLE | PROP_CONFIGURABLE;

// DECLVAR flag bits (share the 'a' field with the property flags).
pub const DECLVAR_FLAG_UNDEF_VALUE: u32 = 1 << 3;
pub const DECLVAR_FLAG_FUNC_DECL: u32 = 1 << 4;

// CALL flag bits ('a' field).
pub const CALL_FLAG_TAILCALL: u32 = 1 << 0;
pub const CALL_FLAG_EVALCALL: u32 = 1 << 1;

// RETURN flag bits ('a' field).
pub const RETURN_FLAG_HAVE_RETVAL: u32 = 1 << 0;

// TRYCATCH flag bits ('a' field).
pub const TRYCATCH_FLAG_HAVE_CATCH: u32 = 1 << 0;
pub const TRYCATCH_FLAG_HAVE_FINALLY: u32 = 1 << 1;
pub const TRYCATCH_FLAG_CATCH_BINDING: u32 = 1 << 2;
pub const TRYCATCH_FLAG_WITH_BINDING: u32 = 1 << 3;

/// Primary opcodes (6-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Ldreg = 0,
    Streg,
    Ldconst,
    Ldint,
    Ldintx,
    Mputobj,
    Mputobji,
    Mputarr,
    Mputarri,
    New,
    Newi,
    Regexp,
    Csreg,
    Csregi,
    Getvar,
    Putvar,
    Declvar,
    Delvar,
    Csvar,
    Csvari,
    Closure,
    Getprop,
    Putprop,
    Delprop,
    Csprop,
    Cspropi,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Band,
    Bor,
    Bxor,
    Basl,
    Blsr,
    Basr,
    Bnot,
    Lnot,
    Eq,
    Neq,
    Seq,
    Sneq,
    Gt,
    Ge,
    Lt,
    Le,
    If,
    Instof,
    In,
    Jump,
    Return,
    Call,
    Calli,
    Label,
    Endlabel,
    Break,
    Continue,
    Trycatch,
    Extra,
    Invalid,
}

impl Opcode {
    /// Decode the 6-bit opcode field.  Unknown values are an internal error
    /// at dispatch time, so this returns an Option rather than panicking.
    pub fn from_raw(raw: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match raw {
            0 => Ldreg,
            1 => Streg,
            2 => Ldconst,
            3 => Ldint,
            4 => Ldintx,
            5 => Mputobj,
            6 => Mputobji,
            7 => Mputarr,
            8 => Mputarri,
            9 => New,
            10 => Newi,
            11 => Regexp,
            12 => Csreg,
            13 => Csregi,
            14 => Getvar,
            15 => Putvar,
            16 => Declvar,
            17 => Delvar,
            18 => Csvar,
            19 => Csvari,
            20 => Closure,
            21 => Getprop,
            22 => Putprop,
            23 => Delprop,
            24 => Csprop,
            25 => Cspropi,
            26 => Add,
            27 => Sub,
            28 => Mul,
            29 => Div,
            30 => Mod,
            31 => Band,
            32 => Bor,
            33 => Bxor,
            34 => Basl,
            35 => Blsr,
            36 => Basr,
            37 => Bnot,
            38 => Lnot,
            39 => Eq,
            40 => Neq,
            41 => Seq,
            42 => Sneq,
            43 => Gt,
            44 => Ge,
            45 => Lt,
            46 => Le,
            47 => If,
            48 => Instof,
            49 => In,
            50 => Jump,
            51 => Return,
            52 => Call,
            53 => Calli,
            54 => Label,
            55 => Endlabel,
            56 => Break,
            57 => Continue,
            58 => Trycatch,
            59 => Extra,
            60 => Invalid,
            _ => return None,
        })
    }
}

/// Secondary opcodes for the EXTRA escape hatch ('a' field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtraOp {
    Nop = 0,
    Ldthis,
    Ldundef,
    Ldnull,
    Ldtrue,
    Ldfalse,
    Newobj,
    Newarr,
    Setalen,
    Typeof,
    Typeofid,
    Tonum,
    Initenum,
    Nextenum,
    Initset,
    Initseti,
    Initget,
    Initgeti,
    Endtry,
    Endcatch,
    Endfin,
    Throw,
    Invlhs,
    Unm,
    Unp,
    Inc,
    Dec,
}

impl ExtraOp {
    pub fn from_raw(raw: u8) -> Option<ExtraOp> {
        use ExtraOp::*;
        Some(match raw {
            0 => Nop,
            1 => Ldthis,
            2 => Ldundef,
            3 => Ldnull,
            4 => Ldtrue,
            5 => Ldfalse,
            6 => Newobj,
            7 => Newarr,
            8 => Setalen,
            9 => Typeof,
            10 => Typeofid,
            11 => Tonum,
            12 => Initenum,
            13 => Nextenum,
            14 => Initset,
            15 => Initseti,
            16 => Initget,
            17 => Initgeti,
            18 => Endtry,
            19 => Endcatch,
            20 => Endfin,
            21 => Throw,
            22 => Invlhs,
            23 => Unm,
            24 => Unp,
            25 => Inc,
            26 => Dec,
            _ => return None,
        })
    }
}

/// One packed 32-bit instruction word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ins(pub u32);

impl Ins {
    #[inline]
    pub fn abc(op: Opcode, a: u32, b: u32, c: u32) -> Ins {
        debug_assert!(a < 0x100 && b < 0x200 && c < 0x200);
        Ins(op as u32 | (a << 6) | (b << 14) | (c << 23))
    }

    #[inline]
    pub fn a_bc(op: Opcode, a: u32, bc: u32) -> Ins {
        debug_assert!(a < 0x100 && bc < 0x40000);
        Ins(op as u32 | (a << 6) | (bc << 14))
    }

    #[inline]
    pub fn wide(op: Opcode, abc: u32) -> Ins {
        debug_assert!(abc < 0x400_0000);
        Ins(op as u32 | (abc << 6))
    }

    /// Extra-group instruction: the 'a' field carries the secondary opcode.
    #[inline]
    pub fn extra(xop: ExtraOp, b: u32, c: u32) -> Ins {
        Ins::abc(Opcode::Extra, xop as u32, b, c)
    }

    #[inline]
    pub fn extra_bc(xop: ExtraOp, bc: u32) -> Ins {
        Ins::a_bc(Opcode::Extra, xop as u32, bc)
    }

    #[inline]
    pub fn op_raw(self) -> u8 {
        (self.0 & 0x3f) as u8
    }

    #[inline]
    pub fn a(self) -> u32 {
        (self.0 >> 6) & 0xff
    }

    #[inline]
    pub fn b(self) -> u32 {
        (self.0 >> 14) & 0x1ff
    }

    #[inline]
    pub fn c(self) -> u32 {
        (self.0 >> 23) & 0x1ff
    }

    #[inline]
    pub fn bc(self) -> u32 {
        (self.0 >> 14) & 0x3ffff
    }

    #[inline]
    pub fn wide_abc(self) -> u32 {
        (self.0 >> 6) & 0x3ff_ffff
    }
}

impl std::fmt::Debug for Ins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match Opcode::from_raw(self.op_raw()) {
            Some(op) => write!(
                f,
                "{:?} a={} b={} c={}",
                op,
                self.a(),
                self.b(),
                self.c()
            ),
            None => write!(f, "?op{} 0x{:08x}", self.op_raw(), self.0),
        }
    }
}

/// A compiled function: instructions, constant pool, inner-function
/// templates and frame metadata.  Immutable after assembly.
#[derive(Debug)]
pub struct CompiledFunction {
    /// The instruction stream.
    pub code: Box<[Ins]>,

    /// Constant pool (strings and numbers; addresses are stable).
    pub consts: Box<[TVal]>,

    /// Inner function templates for CLOSURE.
    pub inner: Box<[Rc<CompiledFunction>]>,

    /// Register count; the value-stack window of an activation is exactly
    /// this wide at every instruction boundary.
    pub nregs: u16,

    /// Declared parameter count; arguments map to registers 0..nargs.
    pub nargs: u16,

    /// Strict-mode flag.
    pub strict: bool,

    /// Function name, if any (for diagnostics).
    pub name: Option<JsString>,
}

/// Placeholder for a jump emitted before its target is known.
#[derive(Debug, Clone, Copy)]
pub struct JumpPlaceholder {
    pub instruction_index: usize,
}

/// The two jump slots reserved by a LABEL instruction.
#[derive(Debug, Clone, Copy)]
pub struct LabelSlots {
    pub break_slot: JumpPlaceholder,
    pub continue_slot: JumpPlaceholder,
}

/// The two jump slots reserved by a TRYCATCH instruction.
#[derive(Debug, Clone, Copy)]
pub struct TrySlots {
    pub catch_slot: JumpPlaceholder,
    pub finally_slot: JumpPlaceholder,
}

/// Assembler for compiled functions.
///
/// This is the target both for an external compiler front-end and for tests,
/// which assemble the bytecode a compiler would emit.  Constants are
/// deduplicated; jumps can be emitted as placeholders and patched once the
/// target is known.  The register count is tracked from the operands seen,
/// and can be raised explicitly with `reserve_regs`.
pub struct FunctionBuilder {
    code: Vec<Ins>,
    consts: Vec<TVal>,
    string_map: FxHashMap<JsString, u32>,
    number_map: FxHashMap<u64, u32>,
    inner: Vec<Rc<CompiledFunction>>,
    nargs: u16,
    high_reg: u32,
    strict: bool,
    name: Option<JsString>,
}

impl FunctionBuilder {
    pub fn new(nargs: u16) -> Self {
        Self {
            code: Vec::new(),
            consts: Vec::new(),
            string_map: FxHashMap::default(),
            number_map: FxHashMap::default(),
            inner: Vec::new(),
            nargs,
            high_reg: nargs.saturating_sub(1) as u32,
            strict: false,
            name: None,
        }
    }

    pub fn strict(&mut self) -> &mut Self {
        self.strict = true;
        self
    }

    pub fn name(&mut self, name: impl Into<JsString>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Make sure the frame is at least `count` registers wide.
    pub fn reserve_regs(&mut self, count: u32) -> &mut Self {
        if count > 0 {
            self.touch(count - 1);
        }
        self
    }

    fn touch(&mut self, reg: u32) {
        if reg > self.high_reg {
            self.high_reg = reg;
        }
    }

    fn touch_rc(&mut self, rc: u32) {
        if rc < REGLIMIT {
            self.touch(rc);
        }
    }

    /// Intern a constant, returning its raw pool index.
    pub fn const_index(&mut self, v: TVal) -> u32 {
        match &v {
            TVal::String(s) => {
                if let Some(&idx) = self.string_map.get(s) {
                    return idx;
                }
                let idx = self.consts.len() as u32;
                self.string_map.insert(s.clone(), idx);
                self.consts.push(v);
                idx
            }
            TVal::Number(n) => {
                if let Some(&idx) = self.number_map.get(&n.to_bits()) {
                    return idx;
                }
                let idx = self.consts.len() as u32;
                self.number_map.insert(n.to_bits(), idx);
                self.consts.push(v);
                idx
            }
            _ => {
                let idx = self.consts.len() as u32;
                self.consts.push(v);
                idx
            }
        }
    }

    /// Intern a constant, returning a B/C operand addressing it.
    pub fn constant(&mut self, v: TVal) -> u32 {
        self.const_index(v) + REGLIMIT
    }

    /// Convenience: intern a string constant as a B/C operand.
    pub fn string(&mut self, s: &str) -> u32 {
        self.constant(TVal::from(s))
    }

    /// Convenience: intern a number constant as a B/C operand.
    pub fn number(&mut self, n: f64) -> u32 {
        self.constant(TVal::number(n))
    }

    /// Register an inner function template, returning its CLOSURE index.
    pub fn inner_function(&mut self, func: Rc<CompiledFunction>) -> u32 {
        let idx = self.inner.len() as u32;
        self.inner.push(func);
        idx
    }

    /// Next instruction index (the target of a backward jump).
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Append a raw instruction.
    pub fn emit(&mut self, ins: Ins) -> usize {
        let idx = self.code.len();
        self.code.push(ins);
        idx
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Loads and stores
    // ═══════════════════════════════════════════════════════════════════════

    pub fn ldreg(&mut self, dst: u32, src: u32) {
        self.touch(dst);
        self.touch(src);
        self.emit(Ins::a_bc(Opcode::Ldreg, dst, src));
    }

    pub fn streg(&mut self, src: u32, dst: u32) {
        self.touch(dst);
        self.touch(src);
        self.emit(Ins::a_bc(Opcode::Streg, src, dst));
    }

    pub fn ldconst(&mut self, dst: u32, v: TVal) {
        self.touch(dst);
        let idx = self.const_index(v);
        self.emit(Ins::a_bc(Opcode::Ldconst, dst, idx));
    }

    pub fn ldint(&mut self, dst: u32, value: i32) {
        self.touch(dst);
        let bc = (value + LDINT_BIAS) as u32;
        self.emit(Ins::a_bc(Opcode::Ldint, dst, bc));
    }

    pub fn ldintx(&mut self, dst: u32, low_bits: u32) {
        self.touch(dst);
        self.emit(Ins::a_bc(Opcode::Ldintx, dst, low_bits));
    }

    pub fn ldundef(&mut self, dst: u32) {
        self.touch(dst);
        self.emit(Ins::extra_bc(ExtraOp::Ldundef, dst));
    }

    pub fn ldnull(&mut self, dst: u32) {
        self.touch(dst);
        self.emit(Ins::extra_bc(ExtraOp::Ldnull, dst));
    }

    pub fn ldbool(&mut self, dst: u32, value: bool) {
        self.touch(dst);
        let xop = if value { ExtraOp::Ldtrue } else { ExtraOp::Ldfalse };
        self.emit(Ins::extra_bc(xop, dst));
    }

    pub fn ldthis(&mut self, dst: u32) {
        self.touch(dst);
        self.emit(Ins::extra(ExtraOp::Ldthis, dst, 0));
    }

    pub fn closure(&mut self, dst: u32, func_index: u32) {
        self.touch(dst);
        self.emit(Ins::a_bc(Opcode::Closure, dst, func_index));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Variables
    // ═══════════════════════════════════════════════════════════════════════

    pub fn getvar(&mut self, dst: u32, name: &str) {
        self.touch(dst);
        let idx = self.const_index(TVal::from(name));
        self.emit(Ins::a_bc(Opcode::Getvar, dst, idx));
    }

    pub fn putvar(&mut self, src: u32, name: &str) {
        self.touch(src);
        let idx = self.const_index(TVal::from(name));
        self.emit(Ins::a_bc(Opcode::Putvar, src, idx));
    }

    pub fn declvar(&mut self, flags: u32, name: &str, value: u32) {
        let name_rc = self.string(name);
        self.touch_rc(value);
        self.emit(Ins::abc(Opcode::Declvar, flags, name_rc, value));
    }

    pub fn delvar(&mut self, dst: u32, name: &str) {
        self.touch(dst);
        let name_rc = self.string(name);
        self.emit(Ins::abc(Opcode::Delvar, dst, name_rc, 0));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Properties
    // ═══════════════════════════════════════════════════════════════════════

    pub fn getprop(&mut self, dst: u32, obj: u32, key: u32) {
        self.touch(dst);
        self.touch_rc(obj);
        self.touch_rc(key);
        self.emit(Ins::abc(Opcode::Getprop, dst, obj, key));
    }

    pub fn putprop(&mut self, obj: u32, key: u32, value: u32) {
        self.touch(obj);
        self.touch_rc(key);
        self.touch_rc(value);
        self.emit(Ins::abc(Opcode::Putprop, obj, key, value));
    }

    pub fn delprop(&mut self, dst: u32, obj: u32, key: u32) {
        self.touch(dst);
        self.touch(obj);
        self.touch_rc(key);
        self.emit(Ins::abc(Opcode::Delprop, dst, obj, key));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Call setup
    // ═══════════════════════════════════════════════════════════════════════

    pub fn csreg(&mut self, base: u32, func: u32) {
        self.touch(base + 1);
        self.touch(func);
        self.emit(Ins::abc(Opcode::Csreg, base, func, 0));
    }

    pub fn csvar(&mut self, base: u32, name: &str) {
        self.touch(base + 1);
        let name_rc = self.string(name);
        self.emit(Ins::abc(Opcode::Csvar, base, name_rc, 0));
    }

    pub fn csprop(&mut self, base: u32, obj: u32, key: u32) {
        self.touch(base + 1);
        self.touch(obj);
        self.touch_rc(key);
        self.emit(Ins::abc(Opcode::Csprop, base, obj, key));
    }

    pub fn call(&mut self, flags: u32, base: u32, nargs: u32) {
        self.touch(base + 1 + nargs);
        self.emit(Ins::abc(Opcode::Call, flags, base, nargs));
    }

    pub fn construct(&mut self, base: u32, nargs: u32) {
        self.touch(base + nargs);
        self.emit(Ins::abc(Opcode::New, 0, base, nargs));
    }

    pub fn ret(&mut self, value: u32) {
        self.touch_rc(value);
        self.emit(Ins::abc(Opcode::Return, RETURN_FLAG_HAVE_RETVAL, value, 0));
    }

    pub fn ret_undef(&mut self) {
        self.emit(Ins::abc(Opcode::Return, 0, 0, 0));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Arithmetic / logic / comparison
    // ═══════════════════════════════════════════════════════════════════════

    pub fn binop(&mut self, op: Opcode, dst: u32, lhs: u32, rhs: u32) {
        self.touch(dst);
        self.touch_rc(lhs);
        self.touch_rc(rhs);
        self.emit(Ins::abc(op, dst, lhs, rhs));
    }

    pub fn unop(&mut self, xop: ExtraOp, dst: u32, src: u32) {
        self.touch(dst);
        self.touch_rc(src);
        self.emit(Ins::extra(xop, dst, src));
    }

    pub fn lnot(&mut self, dst: u32, src: u32) {
        self.touch(dst);
        self.touch_rc(src);
        self.emit(Ins::abc(Opcode::Lnot, dst, src, 0));
    }

    pub fn bnot(&mut self, dst: u32, src: u32) {
        self.touch(dst);
        self.touch_rc(src);
        self.emit(Ins::abc(Opcode::Bnot, dst, src, 0));
    }

    pub fn typeof_value(&mut self, dst: u32, src: u32) {
        self.touch(dst);
        self.touch_rc(src);
        self.emit(Ins::extra(ExtraOp::Typeof, dst, src));
    }

    pub fn typeof_ident(&mut self, dst: u32, name: &str) {
        self.touch(dst);
        let name_rc = self.string(name);
        self.emit(Ins::extra(ExtraOp::Typeofid, dst, name_rc));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control flow
    // ═══════════════════════════════════════════════════════════════════════

    /// IF: skip the next instruction when ToBoolean(operand) equals `cond`.
    pub fn branch_if(&mut self, cond: bool, operand: u32) {
        self.touch_rc(operand);
        self.emit(Ins::abc(Opcode::If, cond as u32, operand, 0));
    }

    /// Emit a forward jump to be patched later.
    pub fn jump(&mut self) -> JumpPlaceholder {
        let instruction_index = self.emit(Ins::wide(Opcode::Jump, JUMP_BIAS as u32));
        JumpPlaceholder { instruction_index }
    }

    /// Emit a jump to a known (usually backward) target.
    pub fn jump_to(&mut self, target: usize) {
        let idx = self.code.len();
        let disp = target as i64 - idx as i64 - 1 + JUMP_BIAS as i64;
        self.emit(Ins::wide(Opcode::Jump, disp as u32));
    }

    /// Patch a placeholder jump to land on `target`.
    pub fn patch_jump_to(&mut self, ph: JumpPlaceholder, target: usize) {
        let disp = target as i64 - ph.instruction_index as i64 - 1 + JUMP_BIAS as i64;
        self.code[ph.instruction_index] = Ins::wide(Opcode::Jump, disp as u32);
    }

    /// Patch a placeholder jump to land on the current position.
    pub fn patch_jump(&mut self, ph: JumpPlaceholder) {
        let target = self.here();
        self.patch_jump_to(ph, target);
    }

    /// Open a labeled region: LABEL plus its two jump slots (break, continue).
    pub fn label(&mut self, label_id: u32) -> LabelSlots {
        self.emit(Ins::wide(Opcode::Label, label_id));
        LabelSlots {
            break_slot: self.jump(),
            continue_slot: self.jump(),
        }
    }

    pub fn endlabel(&mut self, label_id: u32) {
        self.emit(Ins::wide(Opcode::Endlabel, label_id));
    }

    pub fn brk(&mut self, label_id: u32) {
        self.emit(Ins::wide(Opcode::Break, label_id));
    }

    pub fn cont(&mut self, label_id: u32) {
        self.emit(Ins::wide(Opcode::Continue, label_id));
    }

    /// Open a try/catch/finally region: TRYCATCH plus its two jump slots
    /// (catch, finally).  `reg_catch` is the base of the two reserved
    /// registers; `c` is the catch-variable constant or with-target operand.
    pub fn trycatch(&mut self, flags: u32, reg_catch: u32, c: u32) -> TrySlots {
        self.touch(reg_catch + 1);
        self.emit(Ins::abc(Opcode::Trycatch, flags, reg_catch, c));
        TrySlots {
            catch_slot: self.jump(),
            finally_slot: self.jump(),
        }
    }

    pub fn endtry(&mut self) {
        self.emit(Ins::extra(ExtraOp::Endtry, 0, 0));
    }

    pub fn endcatch(&mut self) {
        self.emit(Ins::extra(ExtraOp::Endcatch, 0, 0));
    }

    pub fn endfin(&mut self) {
        self.emit(Ins::extra(ExtraOp::Endfin, 0, 0));
    }

    pub fn throw(&mut self, value: u32) {
        self.touch(value);
        self.emit(Ins::extra(ExtraOp::Throw, value, 0));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Objects, arrays, enumeration
    // ═══════════════════════════════════════════════════════════════════════

    pub fn newobj(&mut self, dst: u32) {
        self.touch(dst);
        self.emit(Ins::extra(ExtraOp::Newobj, dst, 0));
    }

    pub fn newarr(&mut self, dst: u32) {
        self.touch(dst);
        self.emit(Ins::extra(ExtraOp::Newarr, dst, 0));
    }

    pub fn mputobj(&mut self, obj: u32, base: u32, count: u32) {
        self.touch(base + count * 2);
        self.emit(Ins::abc(Opcode::Mputobj, obj, base, count));
    }

    pub fn mputarr(&mut self, obj: u32, base: u32, count: u32) {
        self.touch(base + count);
        self.emit(Ins::abc(Opcode::Mputarr, obj, base, count));
    }

    pub fn setalen(&mut self, obj: u32, len_reg: u32) {
        self.touch(obj);
        self.touch(len_reg);
        self.emit(Ins::extra(ExtraOp::Setalen, obj, len_reg));
    }

    pub fn initenum(&mut self, dst: u32, target: u32) {
        self.touch(dst);
        self.touch(target);
        self.emit(Ins::extra(ExtraOp::Initenum, dst, target));
    }

    pub fn nextenum(&mut self, dst: u32, enum_reg: u32) {
        self.touch(dst);
        self.touch(enum_reg);
        self.emit(Ins::extra(ExtraOp::Nextenum, dst, enum_reg));
    }

    pub fn initget(&mut self, obj: u32, key_base: u32) {
        self.touch(obj);
        self.touch(key_base + 1);
        self.emit(Ins::extra(ExtraOp::Initget, obj, key_base));
    }

    pub fn initset(&mut self, obj: u32, key_base: u32) {
        self.touch(obj);
        self.touch(key_base + 1);
        self.emit(Ins::extra(ExtraOp::Initset, obj, key_base));
    }

    pub fn regexp(&mut self, dst: u32, flags: u32, source: u32) {
        self.touch(dst);
        self.touch_rc(flags);
        self.touch_rc(source);
        self.emit(Ins::abc(Opcode::Regexp, dst, flags, source));
    }

    /// Finish assembly.
    pub fn build(self) -> Rc<CompiledFunction> {
        let nregs = (self.high_reg + 1).max(self.nargs as u32) as u16;
        Rc::new(CompiledFunction {
            code: self.code.into_boxed_slice(),
            consts: self.consts.into_boxed_slice(),
            inner: self.inner.into_boxed_slice(),
            nregs,
            nargs: self.nargs,
            strict: self.strict,
            name: self.name,
        })
    }
}
