use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Position, INT};

use super::figures::{self, Figures};
use crate::feedback;
use crate::value::{Complex, NdArray, Value};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Interpreter and worker limits applied to every run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    /// 0 means unlimited
    pub max_operations: u64,
    pub worker_stack_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_call_levels: 64,
            max_expr_depth: 64,
            max_operations: 0,
            worker_stack_size: 16 * 1024 * 1024,
        }
    }
}

/// Text and markup produced by scripts during one run
#[derive(Debug, Clone, Default)]
pub struct Streams {
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    html: Arc<Mutex<Vec<String>>>,
}

/// Contents of [`Streams`] at the end of a run
#[derive(Debug, Default, PartialEq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub html: Vec<String>,
}

impl Streams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Captured {
        Captured {
            stdout: self.stdout.lock().clone(),
            stderr: self.stderr.lock().clone(),
            html: self.html.lock().clone(),
        }
    }
}

fn base_engine(limits: &Limits, streams: &Streams, figures: &Figures) -> Engine {
    let mut engine = Engine::new();
    engine
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth)
        .set_max_operations(limits.max_operations);

    let stdout = Arc::clone(&streams.stdout);
    engine.on_print(move |text| {
        let mut stdout = stdout.lock();
        stdout.push_str(text);
        stdout.push('\n');
    });

    let stderr = Arc::clone(&streams.stderr);
    engine.on_debug(move |text, _source, pos| {
        let mut stderr = stderr.lock();
        if pos.is_none() {
            stderr.push_str(text);
        } else {
            stderr.push_str(&format!("[{pos}] {text}"));
        }
        stderr.push('\n');
    });

    register_numeric(&mut engine);
    figures::register(&mut engine, figures);
    engine
}

/// Engine for submitted code: neutral builtins only
pub fn submission_engine(limits: &Limits, streams: &Streams, figures: &Figures) -> Engine {
    base_engine(limits, streams, figures)
}

/// Engine for setup and test code, with the HTML sink and the accumulator API
pub fn maintenance_engine(limits: &Limits, streams: &Streams, figures: &Figures) -> Engine {
    let mut engine = base_engine(limits, streams, figures);

    let html = Arc::clone(&streams.html);
    engine.register_fn("output_html", move |markup: &str| {
        html.lock().push(markup.to_string());
    });
    feedback::register(&mut engine);
    engine
}

fn script_error(message: String) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message), Position::NONE).into()
}

fn flat_index(array: &NdArray, index: INT) -> ScriptResult<usize> {
    let len = array.len() as INT;
    let actual = if index < 0 { index + len } else { index };
    if actual < 0 || actual >= len {
        return Err(EvalAltResult::ErrorArrayBounds(array.len(), index, Position::NONE).into());
    }
    Ok(actual as usize)
}

fn shape_of(dims: &Array) -> ScriptResult<Vec<usize>> {
    dims.iter()
        .map(|dim| {
            dim.as_int()
                .ok()
                .and_then(|d| usize::try_from(d).ok())
                .ok_or_else(|| script_error(format!("invalid array dimension: {dim}")))
        })
        .collect()
}

/// Arrays and complex numbers as seen by scripts
fn register_numeric(engine: &mut Engine) {
    engine
        .register_type_with_name::<NdArray>("NdArray")
        .register_fn("array", |nested: Dynamic| -> ScriptResult<NdArray> {
            if nested.is::<NdArray>() {
                return nested
                    .try_cast::<NdArray>()
                    .ok_or_else(|| script_error("not an array".to_string()));
            }
            let value = Value::from_dynamic(&nested).map_err(|err| script_error(format!("cannot build an array from {err}")))?;
            NdArray::from_nested(&value).map_err(|err| script_error(err.to_string()))
        })
        .register_fn("zeros", |len: INT| -> ScriptResult<NdArray> {
            let len = usize::try_from(len).map_err(|_| script_error(format!("invalid array length: {len}")))?;
            NdArray::zeros(vec![len]).map_err(|err| script_error(err.to_string()))
        })
        .register_fn("zeros", |dims: Array| -> ScriptResult<NdArray> {
            NdArray::zeros(shape_of(&dims)?).map_err(|err| script_error(err.to_string()))
        })
        .register_get("shape", |a: &mut NdArray| {
            a.shape().iter().map(|&d| Dynamic::from(d as INT)).collect::<Array>()
        })
        .register_get("ndim", |a: &mut NdArray| a.ndim() as INT)
        .register_get("dtype", |a: &mut NdArray| a.dtype().name().to_string())
        .register_fn("len", |a: &mut NdArray| a.len() as INT)
        .register_fn("to_list", |a: &mut NdArray| a.to_nested().into_dynamic())
        .register_indexer_get(|a: &mut NdArray, index: INT| -> ScriptResult<Dynamic> {
            let i = flat_index(a, index)?;
            Ok(a.get(i).map_or(Dynamic::UNIT, Value::into_dynamic))
        })
        .register_indexer_set(|a: &mut NdArray, index: INT, item: Dynamic| -> ScriptResult<()> {
            let i = flat_index(a, index)?;
            let item = Value::from_dynamic(&item).map_err(|err| script_error(format!("cannot store {err}")))?;
            a.set(i, &item).map_err(|err| script_error(err.to_string()))
        })
        .register_fn("to_string", |a: &mut NdArray| a.to_string())
        .register_fn("to_debug", |a: &mut NdArray| a.to_string());

    engine
        .register_type_with_name::<Complex>("Complex")
        .register_fn("complex", |re: f64, im: f64| Complex::new(re, im))
        .register_fn("complex", |re: INT, im: INT| Complex::new(re as f64, im as f64))
        .register_get("re", |c: &mut Complex| c.re)
        .register_get("im", |c: &mut Complex| c.im)
        .register_fn("abs", |c: Complex| c.norm())
        .register_fn("to_string", |c: &mut Complex| c.to_string())
        .register_fn("to_debug", |c: &mut Complex| c.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engines() -> (Engine, Engine, Streams) {
        let streams = Streams::new();
        let figures = Figures::new();
        let limits = Limits::default();
        (
            submission_engine(&limits, &streams, &figures),
            maintenance_engine(&limits, &streams, &figures),
            streams,
        )
    }

    #[test]
    fn test_print_and_debug_are_captured() {
        let (submission, _, streams) = engines();
        submission.run(r#"print("hello"); debug("trace");"#).unwrap();
        let captured = streams.snapshot();
        assert_eq!(captured.stdout, "hello\n");
        assert!(captured.stderr.contains("\"trace\""));
    }

    #[test]
    fn test_html_sink_only_for_maintenance() {
        let (submission, maintenance, streams) = engines();
        maintenance.run(r#"output_html("<b>hi</b>");"#).unwrap();
        assert_eq!(streams.snapshot().html, vec!["<b>hi</b>".to_string()]);

        let err = submission.run(r#"output_html("<b>hi</b>");"#).unwrap_err();
        assert!(matches!(*err, EvalAltResult::ErrorFunctionNotFound(..)));
        let err = submission.run("grading_complete();").unwrap_err();
        assert!(matches!(*err, EvalAltResult::ErrorFunctionNotFound(..)));
    }

    #[test]
    fn test_numeric_contract() {
        let (submission, _, _) = engines();
        let script = r#"
            let a = array([[1.0, 2.0], [3.0, 4.0]]);
            if a.shape != [2, 2] { throw "shape"; }
            if a.ndim != 2 { throw "ndim"; }
            if a.dtype != "float64" { throw "dtype"; }
            if a.len() != 4 { throw "len"; }
            a[3] = 5.0;
            if a[-1] != 5.0 { throw "index"; }
            let z = zeros([2, 3]);
            if z.len() != 6 { throw "zeros"; }
            let c = complex(1.0, -2.0);
            if c.im != -2.0 { throw "complex"; }
            if array([1, 2]).dtype != "int64" { throw "int dtype"; }
            a.to_list()
        "#;
        let nested = submission.eval::<Dynamic>(script).unwrap();
        assert_eq!(
            Value::from_dynamic(&nested).unwrap(),
            Value::List(vec![
                Value::List(vec![Value::Float(1.0), Value::Float(2.0)]),
                Value::List(vec![Value::Float(3.0), Value::Float(5.0)]),
            ])
        );
    }

    #[test]
    fn test_narrowing_store_rejected() {
        let (submission, _, _) = engines();
        let err = submission.run("let a = array([1, 2]); a[0] = 1.5;").unwrap_err();
        assert!(matches!(*err, EvalAltResult::ErrorRuntime(..)));
    }

    #[test]
    fn test_operation_budget() {
        let streams = Streams::new();
        let limits = Limits {
            max_operations: 1_000,
            ..Limits::default()
        };
        let engine = submission_engine(&limits, &streams, &Figures::new());
        let err = engine.run("loop {}").unwrap_err();
        assert!(matches!(*err, EvalAltResult::ErrorTooManyOperations(..)));
    }
}
