//! Translating between interpreter exceptions and [`Exception`]s.

use rustpython_vm::builtins::{PyBaseExceptionRef, PyStr, PyTuple, PyType};
use rustpython_vm::compiler::CompileError;
use rustpython_vm::{AsObject, PyObjectRef, TryFromObject, VirtualMachine};

use super::SKILL_FILENAME;
use crate::error::{Exception, Location, SyntaxError};

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// A parse failure of the program text.
pub(crate) fn syntax_error(err: &CompileError, code: &str) -> SyntaxError {
    let (line, column) = err.python_location();
    let line = clamp_line(to_u32(line), code);
    SyntaxError::new(err.to_string(), Location::new(line, to_u32(column)))
}

/// The parser reports errors found at end of input one row past the text.
fn clamp_line(line: u32, code: &str) -> u32 {
    let last = to_u32(code.lines().count()).max(1);
    line.min(last)
}

fn int_attr(vm: &VirtualMachine, obj: &PyObjectRef, name: &'static str) -> Option<u32> {
    let value = obj.get_attr(name, vm).ok()?;
    u32::try_from_object(vm, value).ok()
}

fn first_arg(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> Option<String> {
    let args = exc.as_object().get_attr("args", vm).ok()?;
    let first = args.downcast_ref::<PyTuple>()?.as_slice().first()?.clone();
    Some(first.str(vm).ok()?.as_str().to_owned())
}

/// A `SyntaxError` raised while rewriting the program.
pub(crate) fn rewrite_error(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> SyntaxError {
    let obj = exc.as_object().to_owned();
    let line = int_attr(vm, &obj, "lineno").unwrap_or(1);
    let column = int_attr(vm, &obj, "offset").unwrap_or(1);
    let message = first_arg(vm, exc).unwrap_or_else(|| message(vm, exc));
    SyntaxError::new(message, Location::new(line, column))
}

fn message(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    exc.as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default()
}

/// Line of the innermost traceback entry inside the program, falling back to
/// the innermost entry of any file.
fn program_line(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> Option<u32> {
    let mut tb = exc.as_object().get_attr("__traceback__", vm).ok()?;
    let mut in_program = None;
    let mut innermost = None;
    while !vm.is_none(&tb) {
        let line = int_attr(vm, &tb, "tb_lineno");
        let filename = tb
            .get_attr("tb_frame", vm)
            .and_then(|frame| frame.get_attr("f_code", vm))
            .and_then(|code| code.get_attr("co_filename", vm))
            .ok();
        let is_program = filename
            .as_ref()
            .and_then(|f| f.downcast_ref::<PyStr>())
            .is_some_and(|f| f.as_str() == SKILL_FILENAME);
        if is_program {
            in_program = line.or(in_program);
        }
        innermost = line.or(innermost);
        tb = tb.get_attr("tb_next", vm).ok()?;
    }
    in_program.or(innermost)
}

/// Classify an exception that escaped the program.
pub(crate) fn exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> Exception {
    let kind = exc.as_object().class().name().to_string();
    let mut failure = Exception::new(kind, message(vm, exc));
    if let Some(line) = program_line(vm, exc) {
        failure = failure.at(Location::new(line, 0));
    }
    failure
}

/// Raise `err` inside the program. Kinds without a builtin class get a fresh
/// `Exception` subclass of that name.
pub(crate) fn raise(vm: &VirtualMachine, err: &Exception) -> PyBaseExceptionRef {
    let builtin = vm
        .builtins
        .as_object()
        .dict()
        .and_then(|dict| dict.get_item_opt(err.kind(), vm).ok().flatten())
        .and_then(|cls| cls.downcast::<PyType>().ok())
        .filter(|cls| cls.fast_issubclass(vm.ctx.exceptions.base_exception_type));
    let class = builtin.unwrap_or_else(|| vm.ctx.new_exception_type("sluice", err.kind(), None));
    vm.new_exception_msg(class, err.message().to_owned())
}
