//! Moving [`Value`]s in and out of the interpreter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rustpython_vm::builtins::{PyDict, PyFloat, PyInt, PyList, PyModule, PyStr, PyTuple};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine};

use super::failure;
use crate::value::{HostFunction, Namespace, Opaque, Value};

/// Containers nested deeper than this come back opaque.
const MAX_DEPTH: usize = 64;

/// Interpreter objects created for host values during one run, keyed by
/// object id, so they convert back to the same host value.
///
/// Holding the objects keeps their ids stable. [`clear`](Self::clear) must run
/// before the interpreter goes away: host function objects capture the table.
#[derive(Default)]
pub(crate) struct HostObjects {
    functions: HashMap<usize, (PyObjectRef, HostFunction)>,
    namespaces: HashMap<usize, (PyObjectRef, String)>,
}

pub(crate) type SharedObjects = Rc<RefCell<HostObjects>>;

impl HostObjects {
    pub(crate) fn clear(&mut self) {
        self.functions.clear();
        self.namespaces.clear();
    }
}

/// Build the interpreter object for `value`.
pub(crate) fn to_py(vm: &VirtualMachine, objects: &SharedObjects, value: &Value) -> PyResult {
    Ok(match value {
        Value::None | Value::Opaque(_) => vm.ctx.none(),
        Value::Bool(b) => vm.ctx.new_bool(*b).into(),
        Value::Int(i) => vm.ctx.new_int(*i).into(),
        Value::Float(f) => vm.ctx.new_float(*f).into(),
        Value::Str(s) => vm.ctx.new_str(s.as_str()).into(),
        Value::List(items) => vm.ctx.new_list(to_py_all(vm, objects, items)?).into(),
        Value::Tuple(items) => vm.ctx.new_tuple(to_py_all(vm, objects, items)?).into(),
        Value::Dict(pairs) => {
            let dict = vm.ctx.new_dict();
            for (k, v) in pairs {
                let key = to_py(vm, objects, k)?;
                dict.set_item(&*key, to_py(vm, objects, v)?, vm)?;
            }
            dict.into()
        }
        Value::Namespace(ns) => {
            let dict = vm.ctx.new_dict();
            for (name, attr) in ns.iter() {
                dict.set_item(name, to_py(vm, objects, attr)?, vm)?;
            }
            let module: PyObjectRef = vm.new_module(ns.name(), dict, None).into();
            objects
                .borrow_mut()
                .namespaces
                .insert(module.get_id(), (module.clone(), ns.name().to_string()));
            module
        }
        Value::Function(func) => function_to_py(vm, objects, func),
    })
}

fn to_py_all(vm: &VirtualMachine, objects: &SharedObjects, items: &[Value]) -> PyResult<Vec<PyObjectRef>> {
    items.iter().map(|item| to_py(vm, objects, item)).collect()
}

fn function_to_py(vm: &VirtualMachine, objects: &SharedObjects, func: &HostFunction) -> PyObjectRef {
    let host = func.clone();
    let table = Rc::clone(objects);
    let obj: PyObjectRef = vm
        .new_function("host_function", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let positional: Vec<Value> = args.args.iter().map(|a| from_py(vm, &table, a)).collect();
            let keywords: Vec<(String, Value)> = args
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), from_py(vm, &table, v)))
                .collect();
            match host.call(&positional, &keywords) {
                Ok(result) => to_py(vm, &table, &result),
                Err(e) => Err(failure::raise(vm, &e)),
            }
        })
        .into();
    objects
        .borrow_mut()
        .functions
        .insert(obj.get_id(), (obj.clone(), func.clone()));
    obj
}

/// Convert an interpreter object back into a host value.
pub(crate) fn from_py(vm: &VirtualMachine, objects: &SharedObjects, obj: &PyObjectRef) -> Value {
    from_py_at(vm, objects, obj, 0)
}

fn from_py_at(vm: &VirtualMachine, objects: &SharedObjects, obj: &PyObjectRef, depth: usize) -> Value {
    if vm.is_none(obj) {
        return Value::None;
    }
    if obj.fast_isinstance(vm.ctx.types.bool_type) {
        return Value::Bool(bool::try_from_object(vm, obj.clone()).unwrap_or(false));
    }
    if obj.downcast_ref::<PyInt>().is_some() {
        return match i64::try_from_object(vm, obj.clone()) {
            Ok(i) => Value::Int(i),
            Err(_) => opaque(vm, obj),
        };
    }
    if let Some(f) = obj.downcast_ref::<PyFloat>() {
        return Value::Float(f.to_f64());
    }
    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Value::Str(s.as_str().to_owned());
    }
    if let Some(func) = objects.borrow().functions.get(&obj.get_id()) {
        return Value::Function(func.1.clone());
    }
    if depth >= MAX_DEPTH {
        return opaque(vm, obj);
    }
    if let Some(list) = obj.downcast_ref::<PyList>() {
        let items = list.borrow_vec().to_vec();
        return Value::List(items.iter().map(|i| from_py_at(vm, objects, i, depth + 1)).collect());
    }
    if let Some(tuple) = obj.downcast_ref::<PyTuple>() {
        let items = tuple.as_slice().to_vec();
        return Value::Tuple(items.iter().map(|i| from_py_at(vm, objects, i, depth + 1)).collect());
    }
    if let Some(dict) = obj.downcast_ref::<PyDict>() {
        let pairs: Vec<(PyObjectRef, PyObjectRef)> = dict.into_iter().collect();
        return Value::Dict(
            pairs
                .iter()
                .map(|(k, v)| {
                    (
                        from_py_at(vm, objects, k, depth + 1),
                        from_py_at(vm, objects, v, depth + 1),
                    )
                })
                .collect(),
        );
    }
    let namespace = objects.borrow().namespaces.get(&obj.get_id()).map(|(_, name)| name.clone());
    if let Some(name) = namespace {
        if obj.downcast_ref::<PyModule>().is_some() {
            let mut ns = Namespace::new(name);
            for (key, value) in public_attributes(obj) {
                ns.set(key, from_py_at(vm, objects, &value, depth + 1));
            }
            return Value::Namespace(ns);
        }
    }
    opaque(vm, obj)
}

pub(crate) fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Non-dunder entries of `obj.__dict__`.
pub(crate) fn public_attributes(obj: &PyObjectRef) -> Vec<(String, PyObjectRef)> {
    let Some(dict) = obj.dict() else {
        return Vec::new();
    };
    (&dict)
        .into_iter()
        .filter_map(|(k, v)| {
            let name = k.downcast_ref::<PyStr>()?.as_str().to_owned();
            (!is_dunder(&name)).then_some((name, v))
        })
        .collect()
}

fn opaque(vm: &VirtualMachine, obj: &PyObjectRef) -> Value {
    let type_name = obj.class().name().to_string();
    // Integers are safe to render; anything else could run program code.
    let repr = match obj.downcast_ref::<PyInt>() {
        Some(_) => obj
            .str(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_else(|_| format!("<{type_name} object>")),
        None => format!("<{type_name} object>"),
    };
    Value::Opaque(Opaque { type_name, repr })
}
