//! Arithmetic, bitwise, comparison and load/store behavior

use super::{run, try_run};
use esrun::{ExtraOp, Opcode, TVal};

#[test]
fn test_constants_and_registers() {
    let v = run(|b| {
        b.ldint(0, 42);
        b.ldreg(1, 0);
        b.ret(1);
    });
    assert_eq!(v.as_number(), Some(42.0));

    let v = run(|b| {
        b.ldconst(0, TVal::from("hello"));
        b.ret(0);
    });
    assert_eq!(v.as_str(), Some("hello"));
}

#[test]
fn test_ldreg_streg_round_trip() {
    // LDREG a <- b then STREG a -> b restores register b.
    let v = run(|b| {
        b.ldint(0, 7);
        b.ldint(1, 9);
        b.ldreg(1, 0);
        b.streg(1, 0);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(7.0));
}

#[test]
fn test_ldint_bias_negative() {
    let v = run(|b| {
        b.ldint(0, -5);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(-5.0));
}

#[test]
fn test_ldintx_accumulates_high_bits() {
    // 3 * 2^18 + 11
    let v = run(|b| {
        b.ldint(0, 3);
        b.ldintx(0, 11);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some((3 << 18) as f64 + 11.0));
}

#[test]
fn test_arithmetic() {
    let v = run(|b| {
        b.ldint(0, 10);
        b.ldint(1, 4);
        b.binop(Opcode::Sub, 2, 0, 1);
        b.ret(2);
    });
    assert_eq!(v.as_number(), Some(6.0));

    let v = run(|b| {
        let k = b.number(2.5);
        b.ldint(0, 4);
        b.binop(Opcode::Mul, 1, 0, k);
        b.ret(1);
    });
    assert_eq!(v.as_number(), Some(10.0));
}

#[test]
fn test_add_concatenates_strings() {
    let v = run(|b| {
        let hello = b.string("foo");
        let one = b.number(1.0);
        b.ldconst(0, TVal::from(""));
        b.binop(Opcode::Add, 0, 0, hello);
        b.binop(Opcode::Add, 0, 0, one);
        b.ret(0);
    });
    assert_eq!(v.as_str(), Some("foo1"));
}

#[test]
fn test_modulus_boundaries() {
    // -0 % 1 is -0 (fmod semantics, not IEEE remainder).
    let v = run(|b| {
        let zero = b.number(-0.0);
        let one = b.number(1.0);
        b.binop(Opcode::Mod, 0, zero, one);
        b.ret(0);
    });
    let n = v.as_number().expect("number");
    assert_eq!(n, 0.0);
    assert!(n.is_sign_negative());

    // 1 % 0 is NaN.
    let v = run(|b| {
        let one = b.number(1.0);
        let zero = b.number(0.0);
        b.binop(Opcode::Mod, 0, one, zero);
        b.ret(0);
    });
    assert!(v.as_number().expect("number").is_nan());
}

#[test]
fn test_left_shift_boundaries() {
    // (1 << 31) is -2147483648.
    let v = run(|b| {
        let one = b.number(1.0);
        let sh = b.number(31.0);
        b.binop(Opcode::Basl, 0, one, sh);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(-2147483648.0));

    // (4294967295 << 1) is -2: the result is signed and masked.
    let v = run(|b| {
        let big = b.number(4294967295.0);
        let one = b.number(1.0);
        b.binop(Opcode::Basl, 0, big, one);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(-2.0));
}

#[test]
fn test_shift_count_masked_to_five_bits() {
    // Shift counts use ToUint32(rhs) & 0x1f, so 33 shifts by 1.
    let v = run(|b| {
        let one = b.number(1.0);
        let sh = b.number(33.0);
        b.binop(Opcode::Basl, 0, one, sh);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(2.0));
}

#[test]
fn test_unsigned_right_shift() {
    let v = run(|b| {
        let neg = b.number(-1.0);
        let zero = b.number(0.0);
        b.binop(Opcode::Blsr, 0, neg, zero);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(4294967295.0));
}

#[test]
fn test_relational_nan() {
    // NaN comparisons are all false, including the negated forms.
    for op in [Opcode::Lt, Opcode::Le, Opcode::Gt, Opcode::Ge] {
        let v = run(move |b| {
            let nan = b.number(f64::NAN);
            let one = b.number(1.0);
            b.binop(op, 0, nan, one);
            b.ret(0);
        });
        assert_eq!(v.as_bool(), Some(false), "NaN {:?} 1", op);

        let v = run(move |b| {
            let one = b.number(1.0);
            let nan = b.number(f64::NAN);
            b.binop(op, 0, one, nan);
            b.ret(0);
        });
        assert_eq!(v.as_bool(), Some(false), "1 {:?} NaN", op);
    }
}

#[test]
fn test_equality_opcodes() {
    let v = run(|b| {
        let one = b.number(1.0);
        let one_str = b.string("1");
        b.binop(Opcode::Eq, 0, one, one_str);
        b.binop(Opcode::Seq, 1, one, one_str);
        b.binop(Opcode::Neq, 2, one, one_str);
        b.binop(Opcode::Sneq, 3, one, one_str);
        // Pack results: eq && !seq && !neq && sneq expected.
        b.ret(0);
    });
    assert_eq!(v.as_bool(), Some(true));
}

#[test]
fn test_logical_and_bitwise_not() {
    let v = run(|b| {
        b.ldbool(0, false);
        b.lnot(1, 0);
        b.ret(1);
    });
    assert_eq!(v.as_bool(), Some(true));

    let v = run(|b| {
        b.ldint(0, 5);
        b.bnot(1, 0);
        b.ret(1);
    });
    assert_eq!(v.as_number(), Some(-6.0));
}

#[test]
fn test_unary_ops_coerce_to_number() {
    let v = run(|b| {
        let s = b.string("41");
        b.unop(ExtraOp::Inc, 0, s);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(42.0));

    let v = run(|b| {
        let s = b.string("3");
        b.unop(ExtraOp::Unm, 0, s);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(-3.0));
}

#[test]
fn test_typeof_values() {
    let v = run(|b| {
        let s = b.string("x");
        b.typeof_value(0, s);
        b.ret(0);
    });
    assert_eq!(v.as_str(), Some("string"));

    let v = run(|b| {
        b.ldnull(0);
        b.typeof_value(1, 0);
        b.ret(1);
    });
    assert_eq!(v.as_str(), Some("object"));
}

#[test]
fn test_typeof_unresolved_identifier_does_not_throw() {
    let v = run(|b| {
        b.typeof_ident(0, "no_such_global");
        b.ret(0);
    });
    assert_eq!(v.as_str(), Some("undefined"));
}

#[test]
fn test_return_without_value() {
    let v = run(|b| {
        b.ret_undef();
    });
    assert!(v.is_undefined());
}

#[test]
fn test_invlhs_raises_reference_error() {
    let r = try_run(|b| {
        b.emit(esrun::Ins::extra(ExtraOp::Invlhs, 0, 0));
        b.ret_undef();
    });
    let mut vm = esrun::Vm::new();
    let v = super::thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "ReferenceError");
}
