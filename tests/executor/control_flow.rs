//! Branches, labels, try/catch/finally and with-binding behavior

use super::{run, thrown, try_run};
use esrun::bytecode::{
    TRYCATCH_FLAG_CATCH_BINDING, TRYCATCH_FLAG_HAVE_CATCH, TRYCATCH_FLAG_HAVE_FINALLY,
    TRYCATCH_FLAG_WITH_BINDING,
};
use esrun::{Opcode, TVal};

#[test]
fn test_if_and_jump_loop() {
    // Sum 0..10 with a plain conditional backward jump.
    let v = run(|b| {
        b.ldint(0, 0); // sum
        b.ldint(1, 0); // i
        let ten = b.number(10.0);
        let top = b.here();
        b.binop(Opcode::Lt, 2, 1, ten);
        b.branch_if(true, 2);
        let done = b.jump();
        b.binop(Opcode::Add, 0, 0, 1);
        b.unop(esrun::ExtraOp::Inc, 1, 1);
        b.jump_to(top);
        b.patch_jump(done);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(45.0));
}

#[test]
fn test_throw_caught_by_catch_binding() {
    // (function(){ try { throw 'e'; } catch (x) { return x; } })()
    let v = run(|b| {
        b.reserve_regs(3);
        let xname = b.const_index(TVal::from("x"));
        let slots = b.trycatch(
            TRYCATCH_FLAG_HAVE_CATCH | TRYCATCH_FLAG_CATCH_BINDING,
            0,
            xname,
        );
        b.ldconst(2, TVal::from("e"));
        b.throw(2);
        b.patch_jump(slots.catch_slot);
        b.getvar(2, "x");
        b.ret(2);
    });
    assert_eq!(v.as_str(), Some("e"));
}

#[test]
fn test_finally_replaces_return() {
    // (function(){ try { return 1; } finally { return 2; } })()
    let v = run(|b| {
        b.reserve_regs(3);
        let slots = b.trycatch(TRYCATCH_FLAG_HAVE_FINALLY, 0, 0);
        b.ldint(2, 1);
        b.ret(2);
        b.patch_jump(slots.finally_slot);
        b.ldint(2, 2);
        b.ret(2);
        b.endfin();
    });
    assert_eq!(v.as_number(), Some(2.0));
}

#[test]
fn test_finally_runs_on_normal_completion() {
    // try { r = 1 } finally { r = r + 10 } return r  -> 11
    let v = run(|b| {
        b.reserve_regs(3);
        let slots = b.trycatch(TRYCATCH_FLAG_HAVE_FINALLY, 0, 0);
        b.ldint(2, 1);
        b.endtry();
        b.patch_jump(slots.finally_slot);
        let ten = b.number(10.0);
        b.binop(Opcode::Add, 2, 2, ten);
        b.endfin();
        b.ret(2);
    });
    assert_eq!(v.as_number(), Some(11.0));
}

#[test]
fn test_finally_rethrows_pending_throw() {
    // try { throw 'boom' } finally { } -> 'boom' escapes after the finally.
    let r = try_run(|b| {
        b.reserve_regs(3);
        let slots = b.trycatch(TRYCATCH_FLAG_HAVE_FINALLY, 0, 0);
        b.ldconst(2, TVal::from("boom"));
        b.throw(2);
        b.patch_jump(slots.finally_slot);
        b.endfin();
        b.ret_undef();
    });
    assert_eq!(thrown(r).as_str(), Some("boom"));
}

#[test]
fn test_catch_then_finally_both_run() {
    // try { throw 1 } catch (x) { r = x + 1 } finally { r = r + 10 }  -> 12
    let v = run(|b| {
        b.reserve_regs(4);
        let xname = b.const_index(TVal::from("x"));
        let slots = b.trycatch(
            TRYCATCH_FLAG_HAVE_CATCH | TRYCATCH_FLAG_HAVE_FINALLY | TRYCATCH_FLAG_CATCH_BINDING,
            0,
            xname,
        );
        b.ldint(2, 1);
        b.throw(2);
        b.patch_jump(slots.catch_slot);
        b.getvar(3, "x");
        let one = b.number(1.0);
        b.binop(Opcode::Add, 2, 3, one);
        b.endcatch();
        b.patch_jump(slots.finally_slot);
        let ten = b.number(10.0);
        b.binop(Opcode::Add, 2, 2, ten);
        b.endfin();
        b.ret(2);
    });
    assert_eq!(v.as_number(), Some(12.0));
}

#[test]
fn test_labeled_continue_outer() {
    // var r=''; outer: for(var i=0;i<3;i++){ for(var j=0;j<3;j++){
    //   if(j===1) continue outer; r+=i+''+j+' '; } } return r;
    let v = run(|b| {
        b.reserve_regs(5);
        let empty = b.string("");
        let space = b.string(" ");
        let three = b.number(3.0);
        let one = b.number(1.0);

        b.ldconst(0, TVal::from(""));
        b.ldint(1, 0); // i
        let l = b.label(1);
        let loop_i = b.here();
        b.binop(Opcode::Lt, 4, 1, three);
        b.branch_if(true, 4);
        let to_end = b.jump();
        b.ldint(2, 0); // j
        let loop_j = b.here();
        b.binop(Opcode::Lt, 4, 2, three);
        b.branch_if(true, 4);
        let inner_done = b.jump();
        b.binop(Opcode::Seq, 4, 2, one);
        b.branch_if(false, 4);
        b.cont(1); // continue outer
        b.binop(Opcode::Add, 3, 1, empty);
        b.binop(Opcode::Add, 3, 3, 2);
        b.binop(Opcode::Add, 3, 3, space);
        b.binop(Opcode::Add, 0, 0, 3);
        b.unop(esrun::ExtraOp::Inc, 2, 2);
        b.jump_to(loop_j);

        let incr = b.here();
        b.patch_jump_to(l.continue_slot, incr);
        b.patch_jump_to(inner_done, incr);
        b.unop(esrun::ExtraOp::Inc, 1, 1);
        b.jump_to(loop_i);

        let end = b.here();
        b.patch_jump_to(l.break_slot, end);
        b.patch_jump_to(to_end, end);
        b.endlabel(1);
        b.ret(0);
    });
    assert_eq!(v.as_str(), Some("00 10 20 "));
}

#[test]
fn test_labeled_break() {
    // outer: while (true) { break outer; r = 99; } return r (0)
    let v = run(|b| {
        b.reserve_regs(2);
        b.ldint(0, 0);
        let l = b.label(1);
        let top = b.here();
        b.brk(1);
        b.ldint(0, 99);
        b.jump_to(top);
        let end = b.here();
        b.patch_jump_to(l.break_slot, end);
        b.patch_jump_to(l.continue_slot, top);
        b.endlabel(1);
        b.ret(0);
    });
    assert_eq!(v.as_number(), Some(0.0));
}

#[test]
fn test_break_captured_by_finally_first() {
    // outer: { try { break outer; } finally { r = 7; } } return r
    let v = run(|b| {
        b.reserve_regs(3);
        b.ldint(2, 0);
        let l = b.label(1);
        let body = b.here();
        let slots = b.trycatch(TRYCATCH_FLAG_HAVE_FINALLY, 0, 0);
        b.brk(1);
        b.patch_jump(slots.finally_slot);
        b.ldint(2, 7);
        b.endfin();
        let end = b.here();
        b.patch_jump_to(l.break_slot, end);
        b.patch_jump_to(l.continue_slot, body);
        b.endlabel(1);
        b.ret(2);
    });
    assert_eq!(v.as_number(), Some(7.0));
}

#[test]
fn test_with_binding_resolves_through_target() {
    // with ({v: 42}) { return v; }
    let v = run(|b| {
        b.reserve_regs(4);
        b.newobj(2);
        let vkey = b.string("v");
        let forty_two = b.number(42.0);
        b.putprop(2, vkey, forty_two);
        b.trycatch(TRYCATCH_FLAG_WITH_BINDING, 0, 2);
        b.getvar(3, "v");
        b.ret(3);
    });
    assert_eq!(v.as_number(), Some(42.0));
}

#[test]
fn test_with_binding_restored_after_endtry() {
    // with ({v: 1}) {} ; after the region 'v' is unresolvable again.
    let r = try_run(|b| {
        b.reserve_regs(4);
        b.newobj(2);
        let vkey = b.string("v");
        let one = b.number(1.0);
        b.putprop(2, vkey, one);
        let slots = b.trycatch(TRYCATCH_FLAG_WITH_BINDING, 0, 2);
        b.endtry();
        let after = b.here();
        b.patch_jump_to(slots.catch_slot, after);
        b.patch_jump_to(slots.finally_slot, after);
        b.getvar(3, "v");
        b.ret(3);
    });
    let mut vm = esrun::Vm::new();
    let v = thrown(r);
    assert_eq!(super::error_name(&mut vm, &v), "ReferenceError");
}

#[test]
fn test_trycatch_depth_neutral() {
    // A TRYCATCH whose body completes normally leaves the register file
    // where it was: run the region in a loop and return a register set
    // before it.
    let v = run(|b| {
        b.reserve_regs(4);
        b.ldint(2, 31);
        let slots = b.trycatch(TRYCATCH_FLAG_HAVE_FINALLY, 0, 0);
        b.endtry();
        b.patch_jump(slots.finally_slot);
        b.endfin();
        b.ret(2);
    });
    assert_eq!(v.as_number(), Some(31.0));
}

#[test]
fn test_uncaught_throw_escapes_to_embedder() {
    let r = try_run(|b| {
        b.ldint(0, 13);
        b.throw(0);
    });
    assert_eq!(thrown(r).as_number(), Some(13.0));
}
