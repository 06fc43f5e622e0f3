//! Function calls: closures, natives, constructors, tail calls

use super::{thrown, try_run_in};
use esrun::bytecode::CALL_FLAG_TAILCALL;
use esrun::{FunctionBuilder, Heap, JsError, Opcode, TVal, Vm};

#[test]
fn test_simple_ecma_call() {
    // function add(a, b) { return a + b; }  add(3, 4)
    let mut add = FunctionBuilder::new(2);
    add.binop(Opcode::Add, 2, 0, 1);
    add.ret(2);

    let mut vm = Vm::new();
    let func = vm.closure(add.build());
    let v = vm
        .call(func, TVal::Undefined, &[TVal::Number(3.0), TVal::Number(4.0)])
        .unwrap();
    assert_eq!(v.as_number(), Some(7.0));
}

#[test]
fn test_missing_arguments_read_undefined() {
    let mut f = FunctionBuilder::new(2);
    f.typeof_value(2, 1);
    f.ret(2);

    let mut vm = Vm::new();
    let func = vm.closure(f.build());
    let v = vm.call(func, TVal::Undefined, &[TVal::Number(1.0)]).unwrap();
    assert_eq!(v.as_str(), Some("undefined"));
}

#[test]
fn test_call_through_global_binding() {
    // g = function(x){ return x * 2 }; caller does CSVAR 'g' + CALL.
    let mut g = FunctionBuilder::new(1);
    let two = g.number(2.0);
    g.binop(Opcode::Mul, 1, 0, two);
    g.ret(1);

    let mut vm = Vm::new();
    let gfn = vm.closure(g.build());
    vm.define_global("g", gfn);

    let v = try_run_in(&mut vm, |b| {
        b.csvar(0, "g");
        b.ldint(2, 21);
        b.call(0, 0, 1);
        b.ret(0);
    })
    .unwrap();
    assert_eq!(v.as_number(), Some(42.0));
}

#[test]
fn test_inner_function_closure_captures_scope() {
    // function outer() { var n = 5; return function() { return n; }; }
    let mut inner = FunctionBuilder::new(0);
    inner.getvar(0, "n");
    inner.ret(0);

    let mut outer = FunctionBuilder::new(0);
    let five = outer.number(5.0);
    outer.declvar(esrun::bytecode::PROP_WEC, "n", five);
    let inner_idx = outer.inner_function(inner.build());
    outer.closure(0, inner_idx);
    outer.ret(0);

    let mut vm = Vm::new();
    let outer_fn = vm.closure(outer.build());
    let inner_fn = vm.call(outer_fn, TVal::Undefined, &[]).unwrap();
    let v = vm.call(inner_fn, TVal::Undefined, &[]).unwrap();
    assert_eq!(v.as_number(), Some(5.0));
}

#[test]
fn test_native_function_call() {
    fn double(_heap: &mut Heap, _this: TVal, args: &[TVal]) -> Result<TVal, JsError> {
        let n = args.first().and_then(|v| v.as_number()).unwrap_or(f64::NAN);
        Ok(TVal::Number(n * 2.0))
    }

    let mut vm = Vm::new();
    let f = vm.native_function("double", double, 1);
    vm.define_global("double", f);

    let v = try_run_in(&mut vm, |b| {
        b.csvar(0, "double");
        b.ldint(2, 8);
        b.call(0, 0, 1);
        b.ret(0);
    })
    .unwrap();
    assert_eq!(v.as_number(), Some(16.0));
}

#[test]
fn test_native_error_propagates_as_throw() {
    fn boom(_heap: &mut Heap, _this: TVal, _args: &[TVal]) -> Result<TVal, JsError> {
        Err(JsError::type_error("boom"))
    }

    let mut vm = Vm::new();
    let f = vm.native_function("boom", boom, 0);
    vm.define_global("boom", f);

    let r = try_run_in(&mut vm, |b| {
        b.csvar(0, "boom");
        b.call(0, 0, 0);
        b.ret(0);
    });
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "TypeError");
}

#[test]
fn test_tail_call_runs_in_constant_frames() {
    // function f(n, a) { return n === 0 ? a : f(n - 1, a + 1); }  f(100000, 0)
    let mut f = FunctionBuilder::new(2);
    let zero = f.number(0.0);
    let one = f.number(1.0);
    f.binop(Opcode::Seq, 2, 0, zero);
    f.branch_if(false, 2);
    f.ret(1);
    f.csvar(3, "f");
    f.binop(Opcode::Sub, 5, 0, one);
    f.binop(Opcode::Add, 6, 1, one);
    f.call(CALL_FLAG_TAILCALL, 3, 2);
    // The compiler always emits a plain RETURN after a tail call.
    f.ret(3);

    let mut vm = Vm::new();
    let func = vm.closure(f.build());
    vm.define_global("f", func.clone());
    let v = vm
        .call(func, TVal::Undefined, &[TVal::Number(100000.0), TVal::Number(0.0)])
        .unwrap();
    assert_eq!(v.as_number(), Some(100000.0));
}

#[test]
fn test_non_tail_recursion_hits_callstack_limit() {
    // function f(n) { return f(n + 1); } without the tailcall flag.
    let mut f = FunctionBuilder::new(1);
    let one = f.number(1.0);
    f.csvar(1, "f");
    f.binop(Opcode::Add, 3, 0, one);
    f.call(0, 1, 1);
    f.ret(1);

    let mut vm = Vm::new();
    let func = vm.closure(f.build());
    vm.define_global("f", func.clone());
    let r = vm.call(func, TVal::Undefined, &[TVal::Number(0.0)]);
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "RangeError");
}

#[test]
fn test_construct_creates_instance() {
    // function Point() { this.x = 3; }  new Point() instanceof Point, .x == 3
    let mut ctor = FunctionBuilder::new(0);
    ctor.ldthis(0);
    let xkey = ctor.string("x");
    let three = ctor.number(3.0);
    ctor.putprop(0, xkey, three);
    ctor.ret_undef();

    let mut vm = Vm::new();
    let point = vm.closure(ctor.build());
    let instance = vm.construct(point.clone(), &[]).unwrap();
    assert!(instance.is_object());

    let x = vm.heap.get_prop(&instance, &TVal::from("x")).unwrap();
    assert_eq!(x.as_number(), Some(3.0));
    assert!(vm.heap.instanceof(&instance, &point).unwrap());
}

#[test]
fn test_construct_keeps_object_return() {
    // A constructor returning an object overrides the fresh instance.
    let mut ctor = FunctionBuilder::new(0);
    ctor.newobj(0);
    let k = ctor.string("tag");
    let t = ctor.number(9.0);
    ctor.putprop(0, k, t);
    ctor.ret(0);

    let mut vm = Vm::new();
    let f = vm.closure(ctor.build());
    let v = vm.construct(f, &[]).unwrap();
    let tag = vm.heap.get_prop(&v, &TVal::from("tag")).unwrap();
    assert_eq!(tag.as_number(), Some(9.0));
}

#[test]
fn test_new_opcode() {
    // function Box() { this.v = 1; }  (new Box()).v via the NEW opcode.
    let mut ctor = FunctionBuilder::new(0);
    ctor.ldthis(0);
    let vkey = ctor.string("v");
    let one = ctor.number(1.0);
    ctor.putprop(0, vkey, one);
    ctor.ret_undef();

    let mut vm = Vm::new();
    let boxed = vm.closure(ctor.build());
    vm.define_global("Box", boxed);

    let v = try_run_in(&mut vm, |b| {
        b.reserve_regs(3);
        b.getvar(0, "Box");
        b.construct(0, 0);
        let vkey = b.string("v");
        b.getprop(1, 0, vkey);
        b.ret(1);
    })
    .unwrap();
    assert_eq!(v.as_number(), Some(1.0));
}

#[test]
fn test_bound_function_chain_flattens() {
    // f(a, b) { return a + b; } bound twice, each link prepending one arg.
    let mut f = FunctionBuilder::new(2);
    f.binop(Opcode::Add, 2, 0, 1);
    f.ret(2);

    let mut vm = Vm::new();
    let base = vm.closure(f.build());
    let bound1 = TVal::Object(esrun::object::create_function(
        esrun::JsFunction::Bound(Box::new(esrun::object::BoundFunction {
            target: base,
            this_arg: TVal::Undefined,
            bound_args: vec![TVal::Number(10.0)],
        })),
    ));
    let bound2 = TVal::Object(esrun::object::create_function(
        esrun::JsFunction::Bound(Box::new(esrun::object::BoundFunction {
            target: bound1,
            this_arg: TVal::Undefined,
            bound_args: vec![],
        })),
    ));
    let v = vm
        .call(bound2, TVal::Undefined, &[TVal::Number(5.0)])
        .unwrap();
    assert_eq!(v.as_number(), Some(15.0));
}

#[test]
fn test_this_binding_through_csprop() {
    // o = { x: 7, m: function() { return this.x; } }; o.m()
    let mut m = FunctionBuilder::new(0);
    m.ldthis(0);
    let xkey = m.string("x");
    m.getprop(1, 0, xkey);
    m.ret(1);

    let mut vm = Vm::new();
    let method = vm.closure(m.build());
    vm.define_global("m", method);

    let v = try_run_in(&mut vm, |b| {
        b.reserve_regs(4);
        b.newobj(0);
        let xkey = b.string("x");
        let seven = b.number(7.0);
        b.putprop(0, xkey, seven);
        b.getvar(1, "m");
        let mkey = b.string("m");
        b.putprop(0, mkey, 1);
        b.csprop(2, 0, mkey);
        b.call(0, 2, 0);
        b.ret(2);
    })
    .unwrap();
    assert_eq!(v.as_number(), Some(7.0));
}
