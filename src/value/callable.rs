use std::fmt;
use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope, AST};

use super::Value;

/// Script functions compiled from one source, together with the engine
/// allowed to run them.
pub struct FunctionLib {
    engine: Engine,
    ast: AST,
}

impl FunctionLib {
    /// Keeps only the function definitions of `ast`; top-level statements
    /// are dropped so calling into the library never re-runs them.
    pub fn new(engine: Engine, ast: &AST) -> Self {
        Self {
            engine,
            ast: ast.clone_functions_only(),
        }
    }

    pub fn defines(&self, name: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == name)
    }
}

/// A function defined by submitted code, callable from grading code
#[derive(Clone)]
pub struct Callable {
    name: String,
    curry: Vec<Value>,
    lib: Arc<FunctionLib>,
}

impl Callable {
    pub fn new(name: impl Into<String>, curry: Vec<Value>, lib: Arc<FunctionLib>) -> Self {
        Self {
            name: name.into(),
            curry,
            lib,
        }
    }

    /// Human-readable identity; closures have generated names
    pub fn display_name(&self) -> String {
        if self.name.starts_with("anon$") {
            "<anonymous closure>".to_string()
        } else {
            self.name.clone()
        }
    }

    /// Runs the function in the engine it was compiled for.
    ///
    /// Arguments and the result cross by value.
    pub fn call(&self, args: Vec<Value>) -> Result<Value, Box<EvalAltResult>> {
        let mut all: Vec<Dynamic> = self.curry.iter().cloned().map(Value::into_dynamic).collect();
        all.extend(args.into_iter().map(Value::into_dynamic));

        let mut scope = Scope::new();
        let result: Dynamic = self
            .lib
            .engine
            .call_fn(&mut scope, &self.lib.ast, &self.name, all)?;

        let captured = Value::capture(&result, Some(&self.lib));
        super::dismantle(result);
        captured.map_err(|e| {
            EvalAltResult::ErrorRuntime(
                Dynamic::from(format!("'{}' returned {e}", self.display_name())),
                Position::NONE,
            )
            .into()
        })
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.curry == other.curry && Arc::ptr_eq(&self.lib, &other.lib)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("curry", &self.curry)
            .finish_non_exhaustive()
    }
}
