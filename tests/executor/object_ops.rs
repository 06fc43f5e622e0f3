//! Property access, literals, accessors, enumeration, in/instanceof

use super::{run, thrown, try_run, try_run_in};
use esrun::{FunctionBuilder, Opcode, TVal, Vm};

#[test]
fn test_getprop_putprop_delprop() {
    let v = run(|b| {
        b.reserve_regs(3);
        b.newobj(0);
        let key = b.string("k");
        let val = b.number(5.0);
        b.putprop(0, key, val);
        b.getprop(1, 0, key);
        b.ret(1);
    });
    assert_eq!(v.as_number(), Some(5.0));

    let v = run(|b| {
        b.reserve_regs(3);
        b.newobj(0);
        let key = b.string("k");
        let val = b.number(5.0);
        b.putprop(0, key, val);
        b.delprop(1, 0, key);
        b.getprop(2, 0, key);
        b.typeof_value(2, 2);
        b.ret(2);
    });
    assert_eq!(v.as_str(), Some("undefined"));
}

#[test]
fn test_getprop_on_undefined_throws() {
    let r = try_run(|b| {
        b.reserve_regs(2);
        b.ldundef(0);
        let key = b.string("x");
        b.getprop(1, 0, key);
        b.ret(1);
    });
    let mut vm = Vm::new();
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "TypeError");
}

#[test]
fn test_string_length_and_index() {
    let v = run(|b| {
        b.reserve_regs(2);
        let s = b.string("abc");
        let len = b.string("length");
        b.getprop(0, s, len);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(3.0));

    let v = run(|b| {
        b.reserve_regs(2);
        let s = b.string("abc");
        let one = b.number(1.0);
        b.getprop(0, s, one);
        b.ret(0);
    });
    assert_eq!(v.as_str(), Some("b"));
}

#[test]
fn test_mputobj_bulk_define() {
    // o = { a: 1, b: 2 }; return o.a + o.b
    let v = run(|b| {
        b.reserve_regs(7);
        b.newobj(0);
        b.ldconst(1, TVal::from("a"));
        b.ldint(2, 1);
        b.ldconst(3, TVal::from("b"));
        b.ldint(4, 2);
        b.mputobj(0, 1, 2);
        let ka = b.string("a");
        let kb = b.string("b");
        b.getprop(5, 0, ka);
        b.getprop(6, 0, kb);
        b.binop(Opcode::Add, 5, 5, 6);
        b.ret(5);
    });
    assert_eq!(v.as_number(), Some(3.0));
}

#[test]
fn test_mputarr_sets_elements_and_length() {
    // a = [7, 8, 9]; return a.length * 100 + a[2]
    let v = run(|b| {
        b.reserve_regs(7);
        b.newarr(0);
        b.ldint(1, 0); // start index
        b.ldint(2, 7);
        b.ldint(3, 8);
        b.ldint(4, 9);
        b.mputarr(0, 1, 3);
        let len = b.string("length");
        let two = b.number(2.0);
        let hundred = b.number(100.0);
        b.getprop(5, 0, len);
        b.binop(Opcode::Mul, 5, 5, hundred);
        b.getprop(6, 0, two);
        b.binop(Opcode::Add, 5, 5, 6);
        b.ret(5);
    });
    assert_eq!(v.as_number(), Some(309.0));
}

#[test]
fn test_setalen_truncates() {
    let v = run(|b| {
        b.reserve_regs(6);
        b.newarr(0);
        b.ldint(1, 0);
        b.ldint(2, 7);
        b.ldint(3, 8);
        b.mputarr(0, 1, 2);
        b.ldint(4, 1);
        b.setalen(0, 4);
        let one = b.number(1.0);
        b.getprop(5, 0, one);
        b.typeof_value(5, 5);
        b.ret(5);
    });
    assert_eq!(v.as_str(), Some("undefined"));
}

#[test]
fn test_getter_reentry_then_throw() {
    // var o = {}; Object.defineProperty(o, 'x', { get: function(){ throw 42; } });
    // try { return o.x; } catch (e) { return e; }
    let mut getter = FunctionBuilder::new(0);
    getter.ldint(0, 42);
    getter.throw(0);

    let mut vm = Vm::new();
    let getter = getter.build();

    let v = {
        let mut b = FunctionBuilder::new(0);
        b.reserve_regs(6);
        let gidx = b.inner_function(getter);
        b.newobj(2);
        b.ldconst(3, TVal::from("x"));
        b.closure(4, gidx);
        b.initget(2, 3);
        let ename = b.const_index(TVal::from("e"));
        let slots = b.trycatch(
            esrun::bytecode::TRYCATCH_FLAG_HAVE_CATCH
                | esrun::bytecode::TRYCATCH_FLAG_CATCH_BINDING,
            0,
            ename,
        );
        let xkey = b.string("x");
        b.getprop(5, 2, xkey);
        b.ret(5);
        b.patch_jump(slots.catch_slot);
        b.getvar(5, "e");
        b.ret(5);
        let func = vm.closure(b.build());
        vm.call(func, TVal::Undefined, &[]).unwrap()
    };
    assert_eq!(v.as_number(), Some(42.0));
}

#[test]
fn test_accessor_pair_via_initget_initset() {
    // Backing store in a captured scope: get x / set x write through.
    let mut vm = Vm::new();
    vm.define_global("store", TVal::Number(0.0));

    let mut getter = FunctionBuilder::new(0);
    getter.getvar(0, "store");
    getter.ret(0);

    let mut setter = FunctionBuilder::new(1);
    setter.putvar(0, "store");
    setter.ret_undef();

    let (g, s) = (getter.build(), setter.build());
    let v = try_run_in(&mut vm, |b| {
        b.reserve_regs(6);
        let gidx = b.inner_function(g);
        let sidx = b.inner_function(s);
        b.newobj(0);
        b.ldconst(1, TVal::from("x"));
        b.closure(2, gidx);
        b.initget(0, 1);
        b.ldconst(1, TVal::from("x"));
        b.closure(2, sidx);
        b.initset(0, 1);
        let xkey = b.string("x");
        let nine = b.number(9.0);
        b.putprop(0, xkey, nine); // calls the setter
        b.getprop(3, 0, xkey); // calls the getter
        b.ret(3);
    })
    .unwrap();
    assert_eq!(v.as_number(), Some(9.0));
}

#[test]
fn test_for_in_enumeration() {
    // for (k in [10, 20, 30]) r += k;  -> "012" (index keys in order)
    let v = run(|b| {
        b.reserve_regs(6);
        b.newarr(0);
        b.ldint(1, 0);
        b.ldint(2, 10);
        b.ldint(3, 20);
        b.ldint(4, 30);
        b.mputarr(0, 1, 3);
        b.ldconst(1, TVal::from(""));
        b.initenum(2, 0);
        let top = b.here();
        b.nextenum(3, 2);
        let done = b.jump();
        b.binop(Opcode::Add, 1, 1, 3);
        b.jump_to(top);
        b.patch_jump(done);
        b.ret(1);
    });
    assert_eq!(v.as_str(), Some("012"));
}

#[test]
fn test_for_in_over_null_is_empty() {
    let v = run(|b| {
        b.reserve_regs(4);
        b.ldint(1, 0);
        b.ldnull(0);
        b.initenum(2, 0);
        let top = b.here();
        b.nextenum(3, 2);
        let done = b.jump();
        b.unop(esrun::ExtraOp::Inc, 1, 1);
        b.jump_to(top);
        b.patch_jump(done);
        b.ret(1);
    });
    assert_eq!(v.as_number(), Some(0.0));
}

#[test]
fn test_in_operator() {
    let v = run(|b| {
        b.reserve_regs(3);
        b.newobj(0);
        let key = b.string("k");
        let one = b.number(1.0);
        b.putprop(0, key, one);
        b.binop(Opcode::In, 1, key, 0);
        b.ret(1);
    });
    assert_eq!(v.as_bool(), Some(true));
}

#[test]
fn test_in_on_primitive_throws() {
    let r = try_run(|b| {
        b.reserve_regs(2);
        let key = b.string("k");
        let one = b.number(1.0);
        b.binop(Opcode::In, 0, key, one);
        b.ret(0);
    });
    let mut vm = Vm::new();
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "TypeError");
}

#[test]
fn test_strict_putprop_readonly_throws() {
    // In strict mode, writing a read-only property throws.
    let mut vm = Vm::new();
    let target = esrun::object::create_object();
    target.borrow_mut().define_property(
        esrun::PropertyKey::from("ro"),
        esrun::Property::with_flags(TVal::Number(1.0), false, true, true),
    );
    vm.define_global("o", TVal::Object(target));

    let r = {
        let mut b = FunctionBuilder::new(0);
        b.strict();
        b.reserve_regs(2);
        b.getvar(0, "o");
        let key = b.string("ro");
        let two = b.number(2.0);
        b.putprop(0, key, two);
        b.ret_undef();
        let func = vm.closure(b.build());
        vm.call(func, TVal::Undefined, &[])
    };
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "TypeError");
}

#[test]
fn test_regexp_instance_properties() {
    let v = run(|b| {
        b.reserve_regs(3);
        let flags = b.string("gi");
        let source = b.string("a+b");
        b.regexp(0, flags, source);
        let gkey = b.string("global");
        b.getprop(1, 0, gkey);
        b.ret(1);
    });
    assert_eq!(v.as_bool(), Some(true));
}

#[test]
fn test_declvar_and_delvar() {
    // var v = 3; delete v (non-deletable) -> false, v still 3.
    let v = run(|b| {
        b.reserve_regs(3);
        let three = b.number(3.0);
        b.declvar(esrun::bytecode::PROP_WRITABLE | esrun::bytecode::PROP_ENUMERABLE, "v", three);
        b.delvar(0, "v");
        b.getvar(1, "v");
        b.binop(Opcode::Add, 2, 1, 0); // 3 + false -> 3
        b.ret(2);
    });
    assert_eq!(v.as_number(), Some(3.0));
}
