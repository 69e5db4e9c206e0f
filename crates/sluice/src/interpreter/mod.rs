//! Running programs on RustPython.
//!
//! Every run gets a fresh interpreter on its own thread, so nothing a program
//! does to builtins, `sys` or imported modules outlives it. The thread's stack
//! is sized for [`MAX_CALL_DEPTH`] whatever stack the caller runs on.

mod convert;
mod failure;
mod rewrite;

use rustpython_vm::builtins::{PyBaseExceptionRef, PyStr};
use rustpython_vm::compiler::Mode;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::scope::Scope;
use rustpython_vm::{Interpreter, PyObjectRef, PyResult, Settings, VirtualMachine};

use self::convert::SharedObjects;
use crate::bindings::Bindings;
use crate::error::{Exception, ExecError, kind};
use crate::mediation::primitives::{self, Installed};
use crate::mediation::{Guards, OutputSink};
use crate::scoped_env::EnvSnapshot;
use crate::value::{Namespace, Value};

pub(crate) const SKILL_FILENAME: &str = "<skill>";
const SKILL_MODULE: &str = "__skill__";

/// Deepest Python call stack a program may build before `RecursionError`.
pub const MAX_CALL_DEPTH: usize = 256;

const INTERPRETER_STACK_SIZE: usize = 256 * 1024 * 1024;

/// Runs before every program, in its own scope.
const SETUP: &str = r#"
import sys
sys.setrecursionlimit(recursion_limit)

import os
os.environ = snapshot
os.environb = {k.encode(): v.encode() for k, v in snapshot.items()}

def putenv(key, value):
    snapshot[key] = value

def unsetenv(key):
    snapshot.pop(key, None)

os.putenv = putenv
os.unsetenv = unsetenv
try:
    import posix
except ImportError:
    pass
else:
    posix.environ = os.environb
    posix.putenv = putenv
    posix.unsetenv = unsetenv
"#;

/// One configured way of running programs.
#[derive(Clone, Debug)]
pub(crate) struct Sandbox {
    guards: Option<Guards>,
    output: OutputSink,
    env: EnvSnapshot,
    modules: Vec<Namespace>,
}

impl Sandbox {
    /// Programs run as written; what they print goes to `output`.
    pub(crate) fn plain(output: OutputSink, env: EnvSnapshot) -> Self {
        Self {
            guards: None,
            output,
            env,
            modules: Vec::new(),
        }
    }

    /// Programs run behind `guards` and print nowhere.
    pub(crate) fn mediated(guards: Guards, env: EnvSnapshot) -> Self {
        Self {
            guards: Some(guards),
            output: OutputSink::Discard,
            env,
            modules: Vec::new(),
        }
    }

    /// Make `module` importable by its name.
    pub(crate) fn with_modules(mut self, modules: impl IntoIterator<Item = Namespace>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Run `code` with `bindings` as its globals, writing the globals back.
    ///
    /// Blocks until the program finishes.
    pub(crate) fn run(&self, code: &str, bindings: &mut Bindings) -> Result<(), ExecError> {
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let span = tracing::Span::current();
        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name("sluice-interpreter".to_string())
                .stack_size(INTERPRETER_STACK_SIZE)
                .spawn_scoped(scope, || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        span.in_scope(|| self.run_here(code, bindings))
                    })
                })
                .map_err(|e| {
                    Exception::new(kind::RUNTIME_ERROR, format!("failed to start interpreter: {e}"))
                })?;
            worker.join().unwrap_or_else(|_| {
                tracing::error!("interpreter thread panicked");
                Err(Exception::new(kind::RUNTIME_ERROR, "interpreter crashed").into())
            })
        })
    }

    fn run_here(&self, code: &str, bindings: &mut Bindings) -> Result<(), ExecError> {
        let interpreter = Interpreter::with_init(Settings::default(), |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
            vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
        });
        interpreter.enter(|vm| {
            let objects = SharedObjects::default();
            let outcome = self.execute(vm, &objects, code, bindings);
            // Host function objects capture the table.
            objects.borrow_mut().clear();
            outcome
        })
    }

    fn execute(
        &self,
        vm: &VirtualMachine,
        objects: &SharedObjects,
        code: &str,
        bindings: &mut Bindings,
    ) -> Result<(), ExecError> {
        let program = match &self.guards {
            Some(guards) => rewrite::compile_mediated(vm, code, guards.denies_private_names())?,
            None => rewrite::compile_plain(vm, code)?,
        };
        self.prepare(vm, objects).map_err(|e| setup_failed(vm, &e))?;

        let scope = vm.new_scope_with_builtins();
        bind(vm, objects, &scope, bindings).map_err(|e| setup_failed(vm, &e))?;
        let installed = match &self.guards {
            Some(guards) => Some(
                primitives::install(vm, &scope.globals, guards.clone())
                    .map_err(|e| setup_failed(vm, &e))?,
            ),
            None => None,
        };

        let outcome = vm.run_code_obj(program, scope.clone());
        write_back(vm, objects, &scope, installed.as_ref(), bindings);

        if let Some(fatal) = installed.as_ref().and_then(|i| i.fatal.take()) {
            let err = failure::exception(vm, &fatal).into_fatal();
            tracing::debug!(kind = err.kind(), fatal = true, "program rejected");
            return Err(err.into());
        }
        outcome.map(drop).map_err(|exc| {
            let err = failure::exception(vm, &exc);
            tracing::debug!(kind = err.kind(), fatal = false, "program raised");
            err.into()
        })
    }

    fn prepare(&self, vm: &VirtualMachine, objects: &SharedObjects) -> PyResult<()> {
        let writer = output_writer(vm, self.output.clone())?;
        vm.sys_module.set_attr("stdout", writer.clone(), vm)?;
        vm.sys_module.set_attr("stderr", writer, vm)?;

        let snapshot = vm.ctx.new_dict();
        for (key, value) in self.env.iter() {
            snapshot.set_item(key, vm.ctx.new_str(value).into(), vm)?;
        }
        let scope = vm.new_scope_with_builtins();
        scope.globals.set_item("snapshot", snapshot.into(), vm)?;
        scope
            .globals
            .set_item("recursion_limit", vm.ctx.new_int(MAX_CALL_DEPTH).into(), vm)?;
        let setup = vm
            .compile(SETUP, Mode::Exec, "<sluice-setup>".to_owned())
            .map_err(|e| vm.new_runtime_error(e.to_string()))?;
        vm.run_code_obj(setup, scope)?;

        let modules = vm.sys_module.get_attr("modules", vm)?;
        for namespace in &self.modules {
            let module = convert::to_py(vm, objects, &Value::Namespace(namespace.clone()))?;
            modules.set_item(namespace.name(), module, vm)?;
        }
        Ok(())
    }
}

fn setup_failed(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> ExecError {
    let inner = failure::exception(vm, exc);
    tracing::error!(kind = inner.kind(), message = inner.message(), "sandbox setup failed");
    Exception::new(kind::RUNTIME_ERROR, format!("sandbox setup failed: {inner}")).into()
}

/// A `sys.stdout` stand-in that hands every write to `sink`.
fn output_writer(vm: &VirtualMachine, sink: OutputSink) -> PyResult<PyObjectRef> {
    let write = vm.new_function("write", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        let text = match args.args.first() {
            Some(obj) => obj.str(vm)?.as_str().to_owned(),
            None => String::new(),
        };
        sink.write(&text);
        Ok(vm.ctx.new_int(text.chars().count()).into())
    });
    let flush = vm.new_function("flush", |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        Ok(vm.ctx.none())
    });
    let writer = vm.new_module("<output>", vm.ctx.new_dict(), None);
    writer.set_attr("write", write, vm)?;
    writer.set_attr("flush", flush, vm)?;
    writer.set_attr("closed", vm.ctx.new_bool(false), vm)?;
    writer.set_attr("encoding", vm.ctx.new_str("utf-8"), vm)?;
    Ok(writer.into())
}

fn bind(
    vm: &VirtualMachine,
    objects: &SharedObjects,
    scope: &Scope,
    bindings: &Bindings,
) -> PyResult<()> {
    scope
        .globals
        .set_item("__name__", vm.ctx.new_str(SKILL_MODULE).into(), vm)?;
    for (name, value) in bindings.iter() {
        if matches!(value, Value::Opaque(_)) {
            continue;
        }
        scope.globals.set_item(name, convert::to_py(vm, objects, value)?, vm)?;
    }
    Ok(())
}

/// Replace `bindings` with the program's globals.
///
/// Dunder names and installed guards are left out. Caller bindings the guards
/// shadowed, and opaque bindings the program never saw, are kept.
fn write_back(
    vm: &VirtualMachine,
    objects: &SharedObjects,
    scope: &Scope,
    installed: Option<&Installed>,
    bindings: &mut Bindings,
) {
    let globals: Vec<(PyObjectRef, PyObjectRef)> = (&scope.globals).into_iter().collect();
    let mut written: Vec<(String, Value)> = Vec::with_capacity(globals.len());
    let mut seen = std::collections::HashSet::new();
    for (key, value) in &globals {
        let Some(name) = key.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()) else {
            continue;
        };
        seen.insert(name.clone());
        if convert::is_dunder(&name) {
            continue;
        }
        if installed.is_some_and(|i| i.contains(value)) {
            if let Some(shadowed) = bindings.get(&name) {
                written.push((name, shadowed.clone()));
            }
            continue;
        }
        let converted = convert::from_py(vm, objects, value);
        written.push((name, converted));
    }
    for (name, value) in bindings.iter() {
        if matches!(value, Value::Opaque(_)) && !seen.contains(name) {
            written.push((name.to_string(), value.clone()));
        }
    }
    bindings.replace_all(written);
}
