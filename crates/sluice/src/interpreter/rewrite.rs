//! Compiling mediated programs.
//!
//! The program is parsed once natively so syntax errors carry the parser's
//! own message and position, then handed to `rewrite.py`, which reroutes every
//! primitive operation through the guards and enforces the naming rules.

use rustpython_vm::builtins::{PyBaseExceptionRef, PyCode};
use rustpython_vm::compiler::Mode;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, PyObjectRef, PyRef, VirtualMachine};

use super::{SKILL_FILENAME, failure};
use crate::error::{Exception, ExecError, kind};
use crate::mediation::{GUARD_NAMES, PRIMITIVE_NAMES};

const REWRITER_SOURCE: &str = include_str!("rewrite.py");
const REWRITER_FILENAME: &str = "<sluice-rewrite>";

/// Internal failures of the rewriter are reported as `RuntimeError`s.
fn internal(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> ExecError {
    let inner = failure::exception(vm, exc);
    tracing::error!(kind = inner.kind(), message = inner.message(), "program rewriter failed");
    Exception::new(kind::RUNTIME_ERROR, format!("sandbox rewriter failed: {inner}")).into()
}

/// Compile `code` without mediation.
pub(crate) fn compile_plain(vm: &VirtualMachine, code: &str) -> Result<PyRef<PyCode>, ExecError> {
    vm.compile(code, Mode::Exec, SKILL_FILENAME.to_owned())
        .map_err(|e| failure::syntax_error(&e, code).into())
}

/// Compile `code` with every primitive routed through the guards.
pub(crate) fn compile_mediated(
    vm: &VirtualMachine,
    code: &str,
    deny_private: bool,
) -> Result<PyRef<PyCode>, ExecError> {
    compile_plain(vm, code)?;

    let rewriter = vm
        .compile(REWRITER_SOURCE, Mode::Exec, REWRITER_FILENAME.to_owned())
        .map_err(|e| {
            Exception::new(kind::RUNTIME_ERROR, format!("sandbox rewriter does not compile: {e}"))
        })?;
    let scope = vm.new_scope_with_builtins();
    vm.run_code_obj(rewriter, scope.clone())
        .map_err(|e| internal(vm, &e))?;
    let rewrite = scope
        .globals
        .get_item("rewrite", vm)
        .map_err(|e| internal(vm, &e))?;

    let protected: Vec<PyObjectRef> = PRIMITIVE_NAMES
        .iter()
        .chain(GUARD_NAMES)
        .map(|name| vm.ctx.new_str(*name).into())
        .collect();
    let args = FuncArgs::from(vec![
        vm.ctx.new_str(code).into(),
        vm.ctx.new_str(SKILL_FILENAME).into(),
        vm.ctx.new_tuple(protected).into(),
        vm.ctx.new_bool(deny_private).into(),
    ]);
    let compiled = match rewrite.call(args, vm) {
        Ok(compiled) => compiled,
        Err(e) if e.as_object().fast_isinstance(vm.ctx.exceptions.syntax_error) => {
            return Err(failure::rewrite_error(vm, &e).into());
        }
        Err(e) => return Err(internal(vm, &e)),
    };
    compiled.downcast::<PyCode>().map_err(|_| {
        Exception::new(kind::RUNTIME_ERROR, "sandbox rewriter returned no code object").into()
    })
}
