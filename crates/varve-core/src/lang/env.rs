//! Lexical environments: a chain of name → value mappings.
//!
//! Environments are reference-counted. A function registered in its own
//! environment would form a cycle (env → function → env), so named functions
//! capture their defining scope weakly; the scope stays alive through the
//! interpreter's global chain for as long as the function is callable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use super::value::Value;

pub type EnvRef = Rc<RefCell<Environment>>;

/// A captured scope: strong for anonymous functions, weak for functions
/// registered under their own name (cycle break).
#[derive(Clone)]
pub enum Capture {
    Strong(EnvRef),
    Weak(Weak<RefCell<Environment>>),
}

impl Capture {
    pub fn upgrade(&self) -> Option<EnvRef> {
        match self {
            Capture::Strong(env) => Some(Rc::clone(env)),
            Capture::Weak(weak) => weak.upgrade(),
        }
    }
}

#[derive(Default)]
pub struct Environment {
    vars: HashMap<String, Value>,
    parent: Option<EnvRef>,
}

impl Environment {
    pub fn root() -> EnvRef {
        Rc::new(RefCell::new(Environment::default()))
    }

    pub fn child(parent: &EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Environment {
            vars: HashMap::new(),
            parent: Some(Rc::clone(parent)),
        }))
    }

    /// Define in this scope, shadowing any enclosing binding.
    pub fn define(env: &EnvRef, name: impl Into<String>, value: Value) {
        env.borrow_mut().vars.insert(name.into(), value);
    }

    /// `LET` semantics: rebind the nearest enclosing scope that already has
    /// the name, otherwise define here. This is what lets a `WHILE` body
    /// update its loop variable.
    pub fn bind(env: &EnvRef, name: &str, value: Value) {
        let mut current = Rc::clone(env);
        loop {
            if current.borrow().vars.contains_key(name) {
                current.borrow_mut().vars.insert(name.to_string(), value);
                return;
            }
            let parent = current.borrow().parent.clone();
            match parent {
                Some(p) => current = p,
                None => break,
            }
        }
        env.borrow_mut().vars.insert(name.to_string(), value);
    }

    pub fn get(env: &EnvRef, name: &str) -> Option<Value> {
        let mut current = Rc::clone(env);
        loop {
            if let Some(value) = current.borrow().vars.get(name) {
                return Some(value.clone());
            }
            let parent = current.borrow().parent.clone();
            match parent {
                Some(p) => current = p,
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_sees_parent_bindings() {
        let root = Environment::root();
        Environment::define(&root, "x", Value::Number(1.0));
        let child = Environment::child(&root);
        assert!(matches!(Environment::get(&child, "x"), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn define_shadows_bind_rebinds() {
        let root = Environment::root();
        Environment::define(&root, "x", Value::Number(1.0));
        let child = Environment::child(&root);

        Environment::define(&child, "x", Value::Number(2.0));
        assert!(matches!(Environment::get(&child, "x"), Some(Value::Number(n)) if n == 2.0));
        // The parent is untouched by the shadow.
        assert!(matches!(Environment::get(&root, "x"), Some(Value::Number(n)) if n == 1.0));

        let grandchild = Environment::child(&child);
        Environment::bind(&grandchild, "x", Value::Number(3.0));
        // bind walked up to the shadowing scope.
        assert!(matches!(Environment::get(&child, "x"), Some(Value::Number(n)) if n == 3.0));
    }

    #[test]
    fn bind_defines_when_absent() {
        let root = Environment::root();
        let child = Environment::child(&root);
        Environment::bind(&child, "fresh", Value::Bool(true));
        assert!(Environment::get(&child, "fresh").is_some());
        assert!(Environment::get(&root, "fresh").is_none());
    }

    #[test]
    fn weak_capture_breaks_cycles() {
        let root = Environment::root();
        let weak = Capture::Weak(Rc::downgrade(&root));
        assert!(weak.upgrade().is_some());
        drop(root);
        assert!(weak.upgrade().is_none());
    }
}
