//! The guard functions a rewritten program calls.
//!
//! [`install`] binds them into the program's globals; the builtins module
//! itself is left alone so library code imported by the program keeps the
//! real builtins.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use rustpython_vm::builtins::{
    PyBaseExceptionRef, PyByteArray, PyBytes, PyDictRef, PyInt, PyList, PyModule, PyStr, PyStrRef,
    PyTuple,
};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine};

use super::{DENIED_BUILTINS, Guards, MAX_FORMAT_SIZE};
use crate::error::Exception;

/// `str` methods whose arguments or receiver decide how much they allocate.
const SIZED_STR_METHODS: &[&str] =
    &["center", "ljust", "rjust", "zfill", "expandtabs", "format", "format_map"];

/// The first fatal rejection of a run.
///
/// Every guard re-raises it, so a program that catches the rejection cannot
/// get further, and the run reports it even if the program swallowed it.
#[derive(Clone, Default)]
pub(crate) struct FatalSlot(Rc<RefCell<Option<PyBaseExceptionRef>>>);

impl FatalSlot {
    pub(crate) fn check(&self) -> PyResult<()> {
        match &*self.0.borrow() {
            Some(exc) => Err(exc.clone()),
            None => Ok(()),
        }
    }

    fn record(&self, exc: &PyBaseExceptionRef) {
        self.0.borrow_mut().get_or_insert_with(|| exc.clone());
    }

    pub(crate) fn take(&self) -> Option<PyBaseExceptionRef> {
        self.0.borrow_mut().take()
    }
}

/// What [`install`] left in the program's globals.
pub(crate) struct Installed {
    pub(crate) fatal: FatalSlot,
    ids: HashSet<usize>,
}

impl Installed {
    /// Whether `obj` is one of the installed guards.
    pub(crate) fn contains(&self, obj: &PyObjectRef) -> bool {
        self.ids.contains(&obj.get_id())
    }
}

struct Gate {
    guards: Guards,
    fatal: FatalSlot,
    formatter_guarded: Cell<bool>,
}

impl Gate {
    fn reject(&self, vm: &VirtualMachine, err: &Exception) -> PyBaseExceptionRef {
        let exc = vm.new_exception_msg(
            vm.ctx.exceptions.permission_error.to_owned(),
            err.message().to_owned(),
        );
        self.fatal.record(&exc);
        exc
    }

    fn attribute(&self, vm: &VirtualMachine, name: &PyObjectRef) -> PyResult<PyStrRef> {
        let name = attribute_name(vm, name)?;
        self.attribute_str(vm, name.as_str())?;
        Ok(name)
    }

    fn attribute_str(&self, vm: &VirtualMachine, name: &str) -> PyResult<()> {
        self.fatal.check()?;
        self.guards
            .check_attribute(name)
            .map_err(|e| self.reject(vm, &e))
    }

    fn module_reference(&self, vm: &VirtualMachine, path: &str) -> PyResult<()> {
        self.fatal.check()?;
        self.guards
            .check_module_reference(path)
            .map_err(|e| self.reject(vm, &e))
    }

    /// Reject `value` when it is a denied module, by its own name or as
    /// `name` on the module `owner`.
    fn reached_module(
        &self,
        vm: &VirtualMachine,
        owner: &PyObjectRef,
        name: &str,
        value: &PyObjectRef,
    ) -> PyResult<()> {
        let Some(own) = module_name(vm, value) else {
            return Ok(());
        };
        if let Some(owner) = module_name(vm, owner) {
            self.module_reference(vm, &format!("{owner}.{name}"))?;
        }
        self.module_reference(vm, &own)
    }

    fn import(&self, vm: &VirtualMachine, path: &str) -> PyResult<()> {
        self.fatal.check()?;
        self.guards
            .check_import(path)
            .map(drop)
            .map_err(|e| self.reject(vm, &e))
    }
}

fn attribute_name(vm: &VirtualMachine, name: &PyObjectRef) -> PyResult<PyStrRef> {
    name.clone()
        .downcast::<PyStr>()
        .map_err(|_| vm.new_type_error("attribute name must be string".to_owned()))
}

fn module_name(vm: &VirtualMachine, obj: &PyObjectRef) -> Option<String> {
    obj.downcast_ref::<PyModule>()?;
    let name = obj.get_attr("__name__", vm).ok()?;
    Some(name.downcast_ref::<PyStr>()?.as_str().to_owned())
}

fn is_attribute_error(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> bool {
    exc.as_object().fast_isinstance(vm.ctx.exceptions.attribute_error)
}

fn positional<const N: usize>(
    args: FuncArgs,
    name: &str,
    vm: &VirtualMachine,
) -> PyResult<[PyObjectRef; N]> {
    if !args.kwargs.is_empty() {
        return Err(vm.new_type_error(format!("{name}() takes no keyword arguments")));
    }
    let given = args.args.len();
    <[PyObjectRef; N]>::try_from(args.args).map_err(|_| {
        vm.new_type_error(format!("{name}() takes exactly {N} arguments ({given} given)"))
    })
}

/// `getattr(obj, name[, default])` once `name` has passed the guards.
fn attribute_or_default(
    vm: &VirtualMachine,
    obj: &PyObjectRef,
    name: &PyStrRef,
    default: Option<PyObjectRef>,
) -> PyResult {
    match (obj.get_attr(name, vm), default) {
        (Err(e), Some(default)) if is_attribute_error(vm, &e) => Ok(default),
        (result, _) => result,
    }
}

/// Largest number in a format spec, which bounds the width or precision it
/// asks for.
pub(crate) fn spec_size(spec: &str) -> u64 {
    let mut max = 0u64;
    let mut current: Option<u64> = None;
    for c in spec.chars() {
        if let Some(d) = c.to_digit(10) {
            let n = current.unwrap_or(0).saturating_mul(10).saturating_add(u64::from(d));
            current = Some(n);
        } else if let Some(n) = current.take() {
            max = max.max(n);
        }
    }
    max.max(current.unwrap_or(0))
}

/// Replacement fields of a `str.format` template, without their braces.
/// Nested fields stay inside the field holding them.
fn template_fields(template: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut field = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if depth == 0 && chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                if depth > 0 {
                    field.push(c);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    fields.push(std::mem::take(&mut field));
                } else {
                    field.push(c);
                }
            }
            _ if depth > 0 => field.push(c),
            _ => {}
        }
    }
    fields
}

/// Largest [`spec_size`] of the replacement fields in a `str.format` template.
pub(crate) fn template_size(template: &str) -> u64 {
    template_fields(template)
        .iter()
        .map(|field| spec_size(field))
        .max()
        .unwrap_or(0)
}

/// Attribute names a `str.format` template reads with `.name` in its field
/// names, nested fields included.
pub(crate) fn template_attributes(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    for field in template_fields(template) {
        field_attributes(&field, &mut names);
    }
    names
}

fn field_attributes(field: &str, names: &mut Vec<String>) {
    let mut chars = field.char_indices();
    let mut current: Option<String> = None;
    let mut rest = "";
    while let Some((idx, c)) = chars.next() {
        match c {
            '[' => {
                names.extend(current.take());
                for (_, c) in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                }
            }
            '.' => {
                names.extend(current.take());
                current = Some(String::new());
            }
            ':' | '!' => {
                rest = &field[idx + 1..];
                break;
            }
            _ => {
                if let Some(name) = current.as_mut() {
                    name.push(c);
                }
            }
        }
    }
    names.extend(current);
    for nested in template_fields(rest) {
        field_attributes(&nested, names);
    }
}

/// Largest width or precision in a `%`-style template.
pub(crate) fn percent_size(template: &str) -> u64 {
    let mut max = 0u64;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        let mut spec = String::new();
        for c in chars.by_ref() {
            if c.is_ascii_alphabetic() || c == '%' {
                break;
            }
            spec.push(c);
        }
        max = max.max(spec_size(&spec));
    }
    max
}

fn check_size(vm: &VirtualMachine, size: u64, what: &str) -> PyResult<()> {
    if size > MAX_FORMAT_SIZE {
        tracing::debug!(size, what, "oversized request rejected");
        return Err(vm.new_overflow_error(format!("{what} is too large")));
    }
    Ok(())
}

fn is_sequence(obj: &PyObjectRef) -> bool {
    obj.downcast_ref::<PyStr>().is_some()
        || obj.downcast_ref::<PyList>().is_some()
        || obj.downcast_ref::<PyTuple>().is_some()
        || obj.downcast_ref::<PyBytes>().is_some()
        || obj.downcast_ref::<PyByteArray>().is_some()
}

/// `len(seq) * count`, when `seq * count` would repeat a sequence.
fn repeat_size(vm: &VirtualMachine, seq: &PyObjectRef, count: &PyObjectRef) -> PyResult<Option<u64>> {
    if !is_sequence(seq) || count.downcast_ref::<PyInt>().is_none() {
        return Ok(None);
    }
    let Ok(count) = i64::try_from_object(vm, count.clone()) else {
        // Too big for an index; the operator raises OverflowError itself.
        return Ok(None);
    };
    let count = u64::try_from(count).unwrap_or(0);
    let len = u64::try_from(seq.length(vm)?).unwrap_or(u64::MAX);
    Ok(Some(len.saturating_mul(count)))
}

fn check_repeat(vm: &VirtualMachine, a: &PyObjectRef, b: &PyObjectRef) -> PyResult<()> {
    let size = match repeat_size(vm, a, b)? {
        Some(size) => Some(size),
        None => repeat_size(vm, b, a)?,
    };
    match size {
        Some(size) => check_size(vm, size, "repeated sequence"),
        None => Ok(()),
    }
}

fn check_percent(vm: &VirtualMachine, template: &PyObjectRef) -> PyResult<()> {
    match template.downcast_ref::<PyStr>() {
        Some(template) => check_size(vm, percent_size(template.as_str()), "format width"),
        None => Ok(()),
    }
}

/// `current op= value` for the operators that size their result from an
/// operand.
fn inplace(
    vm: &VirtualMachine,
    op: &PyObjectRef,
    current: &PyObjectRef,
    value: &PyObjectRef,
) -> PyResult {
    let op = attribute_name(vm, op)?;
    match op.as_str() {
        "*" => {
            check_repeat(vm, current, value)?;
            vm._imul(current, value)
        }
        "%" => {
            check_percent(vm, current)?;
            vm._imod(current, value)
        }
        other => Err(vm.new_value_error(format!("unsupported in-place operator '{other}'"))),
    }
}

/// Size a `str` method call would allocate, judged from the receiver and the
/// first argument after it.
fn str_call_size(
    vm: &VirtualMachine,
    receiver: &str,
    method: &str,
    first: Option<&PyObjectRef>,
) -> u64 {
    let first = || {
        first
            .and_then(|n| i64::try_from_object(vm, n.clone()).ok())
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0)
    };
    match method {
        "format" | "format_map" => template_size(receiver),
        "expandtabs" => {
            let tabs = receiver.matches('\t').count() as u64;
            first().saturating_mul(tabs).saturating_add(receiver.len() as u64)
        }
        _ => first(),
    }
}

/// A `str` method that checks what its call would allocate and, for
/// `format`/`format_map`, which attributes its template reads. `receiver`
/// is `None` when the method was taken from `str` itself.
fn sized_str_method(
    vm: &VirtualMachine,
    gate: Rc<Gate>,
    method: PyObjectRef,
    name: String,
    receiver: Option<String>,
) -> PyObjectRef {
    vm.new_function("sized_method", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        let (receiver, offset) = match &receiver {
            Some(receiver) => (receiver.clone(), 0),
            None => {
                let first = args
                    .args
                    .first()
                    .and_then(|a| a.downcast_ref::<PyStr>())
                    .map(|s| s.as_str().to_owned());
                match first {
                    Some(receiver) => (receiver, 1),
                    None => return method.call(args, vm),
                }
            }
        };
        let first = args.args.get(offset).or_else(|| args.kwargs.get("tabsize"));
        check_size(vm, str_call_size(vm, &receiver, &name, first), "requested string size")?;
        if matches!(name.as_str(), "format" | "format_map") {
            for attribute in template_attributes(&receiver) {
                gate.attribute_str(vm, &attribute)?;
            }
        }
        method.call(args, vm)
    })
    .into()
}

/// The guarded `getattr`, also bound as `_getattr_`.
fn getattr_function(vm: &VirtualMachine, gate: Rc<Gate>) -> PyObjectRef {
    vm.new_function("getattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        let mut args = args.args.into_iter();
        let (Some(obj), Some(name)) = (args.next(), args.next()) else {
            return Err(vm.new_type_error("getattr expected at least 2 arguments".to_owned()));
        };
        let default = args.next();
        if args.next().is_some() {
            return Err(vm.new_type_error("getattr expected at most 3 arguments".to_owned()));
        }
        let name = gate.attribute(vm, &name)?;
        let value = attribute_or_default(vm, &obj, &name, default)?;
        if value.downcast_ref::<PyModule>().is_some() {
            gate.reached_module(vm, &obj, name.as_str(), &value)?;
            guard_formatter(vm, &gate)?;
        }
        if !SIZED_STR_METHODS.contains(&name.as_str()) {
            return Ok(value);
        }
        let receiver = obj.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned());
        let unbound = obj.get_id() == vm.ctx.types.str_type.get_id();
        if receiver.is_none() && !unbound {
            return Ok(value);
        }
        Ok(sized_str_method(vm, Rc::clone(&gate), value, name.as_str().to_owned(), receiver))
    })
    .into()
}

/// `string.Formatter` reads field attributes through the `getattr` in its
/// module globals. Once `string` is loaded, that is the guard.
fn guard_formatter(vm: &VirtualMachine, gate: &Rc<Gate>) -> PyResult<()> {
    if gate.formatter_guarded.get() {
        return Ok(());
    }
    let modules = vm.sys_module.get_attr("modules", vm)?;
    let Ok(string) = modules.get_item("string", vm) else {
        return Ok(());
    };
    string.set_attr("getattr", getattr_function(vm, Rc::clone(gate)), vm)?;
    gate.formatter_guarded.set(true);
    Ok(())
}

/// Bind every guard into `globals`.
pub(crate) fn install(
    vm: &VirtualMachine,
    globals: &PyDictRef,
    guards: Guards,
) -> PyResult<Installed> {
    let fatal = FatalSlot::default();
    let gate = Rc::new(Gate {
        guards,
        fatal: fatal.clone(),
        formatter_guarded: Cell::new(false),
    });
    let mut ids = HashSet::new();
    let mut bind = |name: &str, obj: PyObjectRef| -> PyResult<()> {
        ids.insert(obj.get_id());
        globals.set_item(name, obj, vm)
    };

    let original_import = vm.builtins.get_attr("__import__", vm)?;
    let builtin_iter = vm.builtins.get_attr("iter", vm)?;
    let builtin_list = vm.builtins.get_attr("list", vm)?;
    let builtin_map = vm.builtins.get_attr("map", vm)?;
    let builtin_format = vm.builtins.get_attr("format", vm)?;
    let builtin_ascii = vm.builtins.get_attr("ascii", vm)?;

    let getattr = getattr_function(vm, Rc::clone(&gate));
    bind("getattr", getattr.clone())?;
    bind("_getattr_", getattr)?;

    let setattr: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("setattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj, name, value] = positional(args, "setattr", vm)?;
            let name = gate.attribute(vm, &name)?;
            obj.set_attr(&name, value, vm)?;
            Ok(vm.ctx.none())
        })
        .into()
    };
    bind("setattr", setattr)?;

    let delattr: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("delattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj, name] = positional(args, "delattr", vm)?;
            let name = gate.attribute(vm, &name)?;
            obj.del_attr(&name, vm)?;
            Ok(vm.ctx.none())
        })
        .into()
    };
    bind("delattr", delattr)?;

    let hasattr: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("hasattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj, name] = positional(args, "hasattr", vm)?;
            gate.fatal.check()?;
            let name = attribute_name(vm, &name)?;
            if gate.guards.hides_attribute(name.as_str()) {
                return Ok(vm.ctx.new_bool(false).into());
            }
            let found = match obj.get_attr(&name, vm) {
                Ok(_) => true,
                Err(e) if is_attribute_error(vm, &e) => false,
                Err(e) => return Err(e),
            };
            Ok(vm.ctx.new_bool(found).into())
        })
        .into()
    };
    bind("hasattr", hasattr)?;

    let print: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("print", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            gate.fatal.check()?;
            Ok(vm.ctx.none())
        })
        .into()
    };
    bind("print", print)?;

    let write: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_write_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let mut args = args.args.into_iter();
            let obj = args
                .next()
                .ok_or_else(|| vm.new_type_error("_write_ expected a target".to_owned()))?;
            match args.next() {
                Some(name) => {
                    gate.attribute(vm, &name)?;
                }
                None => gate.fatal.check()?,
            }
            Ok(obj)
        })
        .into()
    };
    bind("_write_", write)?;

    let getitem: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_getitem_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj, key] = positional(args, "_getitem_", vm)?;
            gate.fatal.check()?;
            obj.get_item(&*key, vm)
        })
        .into()
    };
    bind("_getitem_", getitem)?;

    let getiter: PyObjectRef = {
        let gate = Rc::clone(&gate);
        let builtin_iter = builtin_iter.clone();
        vm.new_function("_getiter_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj] = positional(args, "_getiter_", vm)?;
            gate.fatal.check()?;
            builtin_iter.call(FuncArgs::from(vec![obj]), vm)
        })
        .into()
    };
    bind("_getiter_", getiter)?;

    bind("_slice_", vm.builtins.get_attr("slice", vm)?)?;

    let unpack: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_unpack_sequence_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj] = positional(args, "_unpack_sequence_", vm)?;
            gate.fatal.check()?;
            builtin_list.call(FuncArgs::from(vec![obj]), vm)
        })
        .into()
    };
    bind("_unpack_sequence_", unpack.clone())?;

    let iter_unpack: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_iter_unpack_sequence_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj] = positional(args, "_iter_unpack_sequence_", vm)?;
            gate.fatal.check()?;
            let iterator = builtin_iter.call(FuncArgs::from(vec![obj]), vm)?;
            builtin_map.call(FuncArgs::from(vec![unpack.clone(), iterator]), vm)
        })
        .into()
    };
    bind("_iter_unpack_sequence_", iter_unpack)?;

    let import: PyObjectRef = {
        let gate = Rc::clone(&gate);
        let original_import = original_import.clone();
        vm.new_function("_import_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let mut args = args.args.into_iter();
            let module = args
                .next()
                .ok_or_else(|| vm.new_type_error("_import_ expected a module name".to_owned()))?;
            let leaf = args.next().is_some_and(|flag| !vm.is_none(&flag));
            let path = attribute_name(vm, &module)?;
            gate.import(vm, path.as_str())?;
            let top = original_import.call(FuncArgs::from(vec![module]), vm)?;
            guard_formatter(vm, &gate)?;
            if !leaf {
                return Ok(top);
            }
            vm.sys_module.get_attr("modules", vm)?.get_item(path.as_str(), vm)
        })
        .into()
    };
    bind("_import_", import)?;

    let import_from: PyObjectRef = {
        let gate = Rc::clone(&gate);
        let original_import = original_import.clone();
        vm.new_function("_import_from_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [module, names, level] = positional(args, "_import_from_", vm)?;
            let path = attribute_name(vm, &module)?;
            let absolute = usize::try_from_object(vm, level.clone())? == 0;
            if absolute {
                gate.import(vm, path.as_str())?;
            } else {
                gate.fatal.check()?;
            }
            let names = names
                .downcast::<PyTuple>()
                .map_err(|_| vm.new_type_error("_import_from_ expected a tuple of names".to_owned()))?;
            let mut checked = Vec::with_capacity(names.len());
            for name in names.as_slice() {
                let name = gate.attribute(vm, name)?;
                if absolute {
                    // Submodules load during the import itself.
                    gate.module_reference(vm, &format!("{}.{}", path.as_str(), name.as_str()))?;
                }
                checked.push(name);
            }
            let imported = original_import.call(
                FuncArgs::from(vec![module, vm.ctx.none(), vm.ctx.none(), names.into(), level]),
                vm,
            )?;
            guard_formatter(vm, &gate)?;
            let mut values = Vec::with_capacity(checked.len());
            for name in checked {
                let value = imported.get_attr(&name, vm).map_err(|e| {
                    if is_attribute_error(vm, &e) {
                        vm.new_import_error(
                            format!("cannot import name '{}' from '{}'", name.as_str(), path.as_str()),
                            path.clone(),
                        )
                    } else {
                        e
                    }
                })?;
                gate.reached_module(vm, &imported, name.as_str(), &value)?;
                values.push(value);
            }
            Ok(vm.ctx.new_tuple(values).into())
        })
        .into()
    };
    bind("_import_from_", import_from)?;

    let dunder_import: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("__import__", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let module = args
                .args
                .first()
                .ok_or_else(|| vm.new_type_error("__import__() missing argument 'name'".to_owned()))?;
            let path = attribute_name(vm, module)?;
            let level = match args.args.get(4).or_else(|| args.kwargs.get("level")) {
                Some(level) => usize::try_from_object(vm, level.clone())?,
                None => 0,
            };
            if level == 0 {
                gate.import(vm, path.as_str())?;
            } else {
                gate.fatal.check()?;
            }
            let imported = original_import.call(args, vm)?;
            guard_formatter(vm, &gate)?;
            Ok(imported)
        })
        .into()
    };
    bind("__import__", dunder_import)?;

    let format_value: PyObjectRef = {
        let gate = Rc::clone(&gate);
        let builtin_format = builtin_format.clone();
        vm.new_function("_format_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [value, spec, conversion] = positional(args, "_format_", vm)?;
            gate.fatal.check()?;
            let value = match char::from_u32(u32::try_from_object(vm, conversion).unwrap_or(0)) {
                Some('s') => value.str(vm)?.into(),
                Some('r') => value.repr(vm)?.into(),
                Some('a') => builtin_ascii.call(FuncArgs::from(vec![value]), vm)?,
                _ => value,
            };
            let spec = attribute_name(vm, &spec)?;
            check_size(vm, spec_size(spec.as_str()), "format width")?;
            builtin_format.call(FuncArgs::from(vec![value, spec.into()]), vm)
        })
        .into()
    };
    bind("_format_", format_value)?;

    let format: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("format", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            gate.fatal.check()?;
            if let Some(spec) = args.args.get(1).and_then(|s| s.downcast_ref::<PyStr>()) {
                check_size(vm, spec_size(spec.as_str()), "format width")?;
            }
            builtin_format.call(args, vm)
        })
        .into()
    };
    bind("format", format)?;

    let mul: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_mul_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [a, b] = positional(args, "_mul_", vm)?;
            gate.fatal.check()?;
            check_repeat(vm, &a, &b)?;
            vm._mul(&a, &b)
        })
        .into()
    };
    bind("_mul_", mul)?;

    let modulo: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_mod_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [a, b] = positional(args, "_mod_", vm)?;
            gate.fatal.check()?;
            check_percent(vm, &a)?;
            vm._mod(&a, &b)
        })
        .into()
    };
    bind("_mod_", modulo)?;

    let inplace_name: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_inplace_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [op, current, value] = positional(args, "_inplace_", vm)?;
            gate.fatal.check()?;
            inplace(vm, &op, &current, &value)
        })
        .into()
    };
    bind("_inplace_", inplace_name)?;

    let inplace_item: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_inplace_item_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj, key, op, value] = positional(args, "_inplace_item_", vm)?;
            gate.fatal.check()?;
            let current = obj.get_item(&*key, vm)?;
            let result = inplace(vm, &op, &current, &value)?;
            obj.set_item(&*key, result, vm)?;
            Ok(vm.ctx.none())
        })
        .into()
    };
    bind("_inplace_item_", inplace_item)?;

    let inplace_attr: PyObjectRef = {
        let gate = Rc::clone(&gate);
        vm.new_function("_inplace_attr_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let [obj, name, op, value] = positional(args, "_inplace_attr_", vm)?;
            let name = gate.attribute(vm, &name)?;
            let current = obj.get_attr(&name, vm)?;
            let result = inplace(vm, &op, &current, &value)?;
            obj.set_attr(&name, result, vm)?;
            Ok(vm.ctx.none())
        })
        .into()
    };
    bind("_inplace_attr_", inplace_attr)?;

    let check_fatal: PyObjectRef = {
        let fatal = fatal.clone();
        vm.new_function("_check_fatal_", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            fatal.check()?;
            Ok(vm.ctx.none())
        })
        .into()
    };
    bind("_check_fatal_", check_fatal)?;

    for &name in DENIED_BUILTINS {
        let gate = Rc::clone(&gate);
        let denied: PyObjectRef = vm
            .new_function(name, move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
                Err(gate.reject(
                    vm,
                    &Exception::permission_denied(format!("\"{name}\" is not allowed in skill code")),
                ))
            })
            .into();
        bind(name, denied)?;
    }

    Ok(Installed { fatal, ids })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_size_takes_largest_number() {
        assert_eq!(spec_size(">10.3f"), 10);
        assert_eq!(spec_size("0>5"), 5);
        assert_eq!(spec_size(""), 0);
        assert_eq!(spec_size(">99999999999999999999999"), u64::MAX);
    }

    #[test]
    fn test_template_size_only_reads_fields() {
        assert_eq!(template_size("Order 123456789012: {0:>8}"), 8);
        assert_eq!(template_size("{{9999999999}} {}"), 0);
        assert_eq!(template_size("{x:{w}} {y:>300}"), 300);
    }

    #[test]
    fn test_percent_size() {
        assert_eq!(percent_size("%5d and %-12.3f"), 12);
        assert_eq!(percent_size("100%% sure"), 0);
        assert_eq!(percent_size("%9999999999999s"), 9_999_999_999_999);
    }

    #[test]
    fn test_template_attributes() {
        assert_eq!(template_attributes("{0._token}"), ["_token"]);
        assert_eq!(template_attributes("{user.name.upper!r:>4}"), ["name", "upper"]);
        assert_eq!(template_attributes("{0[a.b]._c}"), ["_c"]);
        assert_eq!(template_attributes("{x:{w._width}}"), ["_width"]);
        assert!(template_attributes("{{0._token}} {} {name:.3}").is_empty());
    }
}
