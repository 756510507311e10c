//! The IR2 calling convention and label mangling.

use crate::ir::Operator;

/// Word size of the target, in bytes.
pub const WORD_SIZE: i64 = 8;

/// Argument-passing registers, in order.
pub const ARGUMENT_REGISTERS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// The instruction a callee uses to move its `index`-th parameter out of
/// the convention's register or stack slot. `value` is the IR2 rendering
/// of the parameter variable.
pub fn argument_loading_instruction(value: &str, index: usize, param_count: usize) -> String {
    assert!(index < param_count);
    if index < ARGUMENT_REGISTERS.len() {
        return format!("{value} <- {}", ARGUMENT_REGISTERS[index]);
    }
    let offset = WORD_SIZE * (param_count as i64 - index as i64 - 1);
    format!("{value} <- stack-arg {offset}")
}

/// The instruction a caller uses to put its `index`-th outgoing argument
/// in place. Arguments beyond the sixth go to the stack, the seventh at
/// `mem rsp -16` and each further one a word below.
pub fn argument_prepping_instruction(value: &str, index: usize) -> String {
    if index < ARGUMENT_REGISTERS.len() {
        return format!("{} <- {value}", ARGUMENT_REGISTERS[index]);
    }
    let overflow = (index - ARGUMENT_REGISTERS.len()) as i64;
    let offset = -WORD_SIZE * (overflow + 2);
    format!("mem rsp {offset} <- {value}")
}

/// IR3 labels are function-local but IR2 labels share one namespace, so
/// block labels are rewritten to carry their function's name. Return
/// labels are generated unique and bypass this.
pub fn mangle_label(function: &str, label: &str) -> String {
    format!("_{function}{label}")
}

/// The IR2 token for applying `op` to an accumulator in place.
/// Comparisons have no such form; they render as a compare-assign.
pub fn op_assign_token(op: Operator) -> &'static str {
    use Operator::*;
    match op {
        Plus => "+=",
        Minus => "-=",
        Times => "*=",
        BitAnd => "&=",
        Lshift => "<<=",
        Rshift => ">>=",
        Lt | Le | Eq | Ge | Gt => unreachable!("comparisons have no op-assign form"),
    }
}
