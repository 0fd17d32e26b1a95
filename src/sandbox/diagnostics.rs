//! Classification of script failures into `"<kind>: <description>"` messages
//! and trace text.

use rhai::{EvalAltResult, ParseError, Position};

use crate::value::Value;

pub const SETUP_LABEL: &str = "[setup code]";
pub const USER_LABEL: &str = "[user code]";
pub const TEST_LABEL: &str = "[test code]";

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: &'static str,
    pub description: String,
    pub traceback: String,
}

impl Failure {
    /// A failure that did not come out of the interpreter
    pub fn new(label: &str, kind: &'static str, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            traceback: format!("Traceback ({label}):\n{kind}: {description}"),
            kind,
            description,
        }
    }

    pub fn from_parse(label: &str, err: &ParseError) -> Self {
        let description = err.err_type().to_string();
        let mut lines = vec![format!("Traceback ({label}):")];
        if !err.position().is_none() {
            lines.push(format!("  at {}", err.position()));
        }
        lines.push(format!("SyntaxError: {description}"));

        Self {
            kind: "SyntaxError",
            description,
            traceback: lines.join("\n"),
        }
    }

    /// Walks the chain of script function calls down to the error that
    /// started it.
    pub fn from_eval(label: &str, err: &EvalAltResult) -> Self {
        let mut lines = vec![format!("Traceback ({label}):")];
        let mut current = err;
        while let EvalAltResult::ErrorInFunctionCall(name, _, inner, pos) = current {
            lines.push(format!("  in call to function '{name}'{}", at(*pos)));
            current = &**inner;
        }
        if !current.position().is_none() {
            lines.push(format!("  at {}", current.position()));
        }

        let (kind, description) = classify(current);
        lines.push(format!("{kind}: {description}"));

        Self {
            kind,
            description,
            traceback: lines.join("\n"),
        }
    }

    pub fn message(&self) -> String {
        format!("{}: {}", self.kind, self.description)
    }
}

fn at(pos: Position) -> String {
    if pos.is_none() {
        String::new()
    } else {
        format!(" ({pos})")
    }
}

fn classify(err: &EvalAltResult) -> (&'static str, String) {
    use EvalAltResult::*;

    let kind = match err {
        ErrorRuntime(value, _) => {
            let description = if value.is_unit() {
                "exception thrown".to_string()
            } else if value.is_array() || value.is_map() {
                Value::from_dynamic(value).map_or_else(|_| format!("<{}>", value.type_name()), |v| v.to_string())
            } else {
                value.to_string()
            };
            return ("RuntimeError", description);
        }
        ErrorParsing(..) => "SyntaxError",
        ErrorVariableNotFound(..) => "VariableNotFound",
        ErrorFunctionNotFound(..) => "FunctionNotFound",
        ErrorPropertyNotFound(..) | ErrorIndexNotFound(..) => "PropertyNotFound",
        ErrorMismatchDataType(..) | ErrorMismatchOutputType(..) | ErrorIndexingType(..) | ErrorFor(..) => {
            "TypeMismatch"
        }
        ErrorArithmetic(..) => "ArithmeticError",
        ErrorArrayBounds(..) | ErrorStringBounds(..) | ErrorBitFieldBounds(..) => "IndexOutOfBounds",
        ErrorStackOverflow(..) => "StackOverflow",
        ErrorTooManyOperations(..) => "TooManyOperations",
        _ => "EvalError",
    };
    (kind, strip_position(err))
}

/// Display text of an error without the trailing `(line x, position y)`
fn strip_position(err: &EvalAltResult) -> String {
    let text = err.to_string();
    let pos = err.position();
    if pos.is_none() {
        return text;
    }
    match text.strip_suffix(&format!(" ({pos})")) {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}
