use std::sync::Arc;

use rhai::Scope;

use crate::value::{Callable, FunctionLib, Value, ValueError};

/// What happened to the names that could not be copied
#[derive(Debug, Default, PartialEq)]
pub struct Transfer {
    /// Names not bound in the source scope
    pub missing: Vec<String>,
    /// Names bound to a value outside the transferable kinds
    pub rejected: Vec<(String, ValueError)>,
}

/// Names in first-occurrence order, without repeats
pub fn dedupe(names: &[String]) -> Vec<&str> {
    let mut seen = Vec::with_capacity(names.len());
    for name in names {
        if !seen.contains(&name.as_str()) {
            seen.push(name.as_str());
        }
    }
    seen
}

/// Snapshots of `names` taken from a scope, in first-occurrence order.
///
/// With `lib`, a name that is not a variable but a script function defined by
/// the source code is captured as a callable instead of being reported missing.
pub fn capture_names(
    names: &[String],
    from: &Scope<'_>,
    lib: Option<&Arc<FunctionLib>>,
) -> (Vec<(String, Value)>, Transfer) {
    let mut captured = Vec::new();
    let mut transfer = Transfer::default();

    for name in dedupe(names) {
        let copied = match from.get(name) {
            Some(value) => Value::capture(value, lib),
            None => match lib {
                Some(lib) if lib.defines(name) => {
                    Ok(Value::Function(Callable::new(name, Vec::new(), Arc::clone(lib))))
                }
                _ => {
                    transfer.missing.push(name.to_string());
                    continue;
                }
            },
        };

        match copied {
            Ok(value) => captured.push((name.to_string(), value)),
            Err(err) => transfer.rejected.push((name.to_string(), err)),
        }
    }

    (captured, transfer)
}

/// Copies `names` from one scope into another by value
pub fn copy_names(
    names: &[String],
    from: &Scope<'_>,
    to: &mut Scope<'_>,
    lib: Option<&Arc<FunctionLib>>,
) -> Transfer {
    let (captured, transfer) = capture_names(names, from, lib);
    for (name, value) in captured {
        to.push_dynamic(name, value.into_dynamic());
    }
    transfer
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Engine;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        assert_eq!(dedupe(&names(&["b", "a", "b", "c", "a"])), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_copies_do_not_alias() {
        let engine = Engine::new();
        let mut from = Scope::new();
        engine.run_with_scope(&mut from, "let xs = [1, 2, 3]; let m = #{ a: [1] };").unwrap();

        let mut to = Scope::new();
        let transfer = copy_names(&names(&["xs", "m"]), &from, &mut to, None);
        assert_eq!(transfer, Transfer::default());

        engine.run_with_scope(&mut to, "xs.push(4); m.a.push(2);").unwrap();

        assert_eq!(from.get_value::<rhai::Array>("xs").unwrap().len(), 3);
        assert_eq!(to.get_value::<rhai::Array>("xs").unwrap().len(), 4);
        let m = from.get_value::<rhai::Map>("m").unwrap();
        assert_eq!(m["a"].clone().into_array().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_and_rejected_do_not_abort() {
        #[derive(Clone)]
        struct Handle;

        let mut from = Scope::new();
        from.push("handle", Handle);
        from.push("x", 5_i64);

        let mut to = Scope::new();
        let transfer = copy_names(&names(&["nope", "handle", "x"]), &from, &mut to, None);
        assert_eq!(transfer.missing, vec!["nope".to_string()]);
        assert_eq!(transfer.rejected.len(), 1);
        assert_eq!(transfer.rejected[0].0, "handle");
        assert_eq!(to.get_value::<i64>("x"), Some(5));
        assert!(to.get("handle").is_none());
    }

    #[test]
    fn test_function_fallback() {
        let engine = Engine::new();
        let ast = engine.compile("fn answer(x) { x * 2 }").unwrap();
        let lib = Arc::new(FunctionLib::new(engine, &ast));

        let from = Scope::new();
        let mut to = Scope::new();
        let transfer = copy_names(&names(&["answer"]), &from, &mut to, Some(&lib));
        assert_eq!(transfer, Transfer::default());

        let Value::Function(callable) = Value::from_dynamic(to.get("answer").unwrap()).unwrap() else {
            panic!("expected a callable");
        };
        assert_eq!(callable.call(vec![Value::Int(21)]).unwrap(), Value::Int(42));
    }
}
