//! Resource limits: the interrupt step budget and host recursion

use super::{thrown, try_run_in};
use esrun::{FunctionBuilder, Heap, JsError, TVal, Vm};

#[test]
fn test_step_limit_raises_range_error() {
    let mut vm = Vm::new();
    vm.set_step_limit(Some(50_000));

    // while (true) {}
    let r = try_run_in(&mut vm, |b| {
        let top = b.here();
        b.jump_to(top);
    });
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "RangeError");
}

#[test]
fn test_step_limit_cannot_be_swallowed_by_catch() {
    // The interrupt keeps tripping, so a catch-all loop still terminates.
    let mut vm = Vm::new();
    vm.set_step_limit(Some(50_000));

    let r = try_run_in(&mut vm, |b| {
        b.reserve_regs(3);
        let top = b.here();
        let slots = b.trycatch(esrun::bytecode::TRYCATCH_FLAG_HAVE_CATCH, 0, 0);
        let inner = b.here();
        b.jump_to(inner);
        b.patch_jump(slots.catch_slot);
        b.jump_to(top);
    });
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "RangeError");
}

#[test]
fn test_host_recursion_limit() {
    // A native that re-enters compiled code which calls the native again:
    // every round consumes host stack, so the recursion limit must trip.
    fn reenter(heap: &mut Heap, _this: TVal, args: &[TVal]) -> Result<TVal, JsError> {
        let func = args.first().cloned().unwrap_or(TVal::Undefined);
        esrun::call::call_value(heap, func, TVal::Undefined, &[])
    }

    let mut vm = Vm::new();
    let f = vm.native_function("reenter", reenter, 1);
    vm.define_global("reenter", f);

    // function me() { return reenter(me); }
    let mut lb = FunctionBuilder::new(0);
    lb.csvar(0, "reenter");
    lb.getvar(2, "me");
    lb.call(0, 0, 1);
    lb.ret(0);
    let me = vm.closure(lb.build());
    vm.define_global("me", me.clone());

    let r = vm.call(me, TVal::Undefined, &[]);
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "RangeError");
}
