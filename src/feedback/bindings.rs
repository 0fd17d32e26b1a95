use std::ops::ControlFlow;

use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Position, INT};

use super::checks::{as_number, CloseOptions, FeatureOptions};
use super::{Check, Feedback};
use crate::value::{Callable, Complex, NdArray, Value, KINDS};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Token carried by the termination error that ends the test stage early
#[derive(Debug, Clone, Copy)]
pub struct GradingComplete;

/// Error value that unwinds the interpreter without being catchable by
/// `try`/`catch` in script code.
pub fn grading_complete() -> Box<EvalAltResult> {
    EvalAltResult::ErrorTerminated(Dynamic::from(GradingComplete), Position::NONE).into()
}

pub fn is_grading_complete(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(token, _) => token.is::<GradingComplete>(),
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_grading_complete(inner),
        _ => false,
    }
}

fn settle<T>(check: Check<T>) -> ScriptResult<T> {
    match check {
        ControlFlow::Continue(value) => Ok(value),
        ControlFlow::Break(_) => Err(grading_complete()),
    }
}

fn script_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

fn number(value: &Dynamic, what: &str) -> ScriptResult<Complex> {
    Value::from_dynamic(value)
        .ok()
        .as_ref()
        .and_then(as_number)
        .ok_or_else(|| {
            script_error(format!(
                "{what} must be a number, got '{}'",
                value.type_name()
            ))
        })
}

fn score(value: &Dynamic) -> ScriptResult<f64> {
    let points = number(value, "points")?;
    if points.im != 0.0 || !(0.0..=1.0).contains(&points.re) {
        return Err(script_error(format!(
            "points must be a real number between 0 and 1, got {points}"
        )));
    }
    Ok(points.re)
}

fn reference_array(value: &Dynamic) -> ScriptResult<NdArray> {
    if let Some(array) = value.clone().try_cast::<NdArray>() {
        return Ok(array);
    }
    let nested = Value::from_dynamic(value).map_err(|err| script_error(format!("reference is {err}")))?;
    NdArray::from_nested(&nested).map_err(|err| script_error(format!("invalid reference array: {err}")))
}

/// Candidate values are inspected, not trusted; anything that cannot be
/// snapshotted simply fails the kind checks.
fn observe(data: &Dynamic) -> Value {
    Value::from_dynamic(data).unwrap_or_else(|err| {
        log::debug!("candidate value not inspectable: {err}");
        Value::Null
    })
}

fn flag(key: &str, value: &Dynamic) -> ScriptResult<bool> {
    value
        .as_bool()
        .map_err(|found| script_error(format!("option '{key}' must be a bool, got '{found}'")))
}

fn tolerance(key: &str, value: &Dynamic) -> ScriptResult<Option<f64>> {
    if value.is_unit() {
        return Ok(None);
    }
    let tol = number(value, &format!("option '{key}'"))?;
    if tol.im != 0.0 || !tol.re.is_finite() || tol.re < 0.0 {
        return Err(script_error(format!(
            "option '{key}' must be a non-negative real number or ()"
        )));
    }
    Ok(Some(tol.re))
}

fn close_options(map: &Map) -> ScriptResult<CloseOptions> {
    let mut options = CloseOptions::default();
    for (key, value) in map {
        match key.as_str() {
            "accuracy_critical" => options.accuracy_critical = flag(key, value)?,
            "report_success" => options.report_success = flag(key, value)?,
            "report_failure" => options.report_failure = flag(key, value)?,
            "rtol" => options.rtol = tolerance(key, value)?,
            "atol" => options.atol = tolerance(key, value)?,
            other => return Err(script_error(format!("unknown option '{other}'"))),
        }
    }
    Ok(options)
}

fn feature_options(map: &Map) -> ScriptResult<FeatureOptions> {
    let mut options = FeatureOptions::default();
    for (key, value) in map {
        match key.as_str() {
            "check_finite" => options.check_finite = flag(key, value)?,
            "report_failure" => options.report_failure = flag(key, value)?,
            other => return Err(script_error(format!("unknown option '{other}'"))),
        }
    }
    Ok(options)
}

fn allclose(fb: &Feedback, name: &str, reference: &Dynamic, data: &Dynamic, options: CloseOptions) -> ScriptResult<bool> {
    let reference = reference_array(reference)?;
    settle(fb.check_array_allclose(name, &reference, &observe(data), options))
}

fn features(fb: &Feedback, name: &str, reference: &Dynamic, data: &Dynamic, options: FeatureOptions) -> ScriptResult<bool> {
    let reference = reference_array(reference)?;
    settle(fb.check_array_features(name, &reference, &observe(data), options))
}

fn scalar(fb: &Feedback, name: &str, reference: &Dynamic, data: &Dynamic, options: CloseOptions) -> ScriptResult<bool> {
    let reference = number(reference, "reference")?;
    settle(fb.check_scalar(name, reference, &observe(data), options))
}

fn list(fb: &Feedback, name: &str, reference: Array, data: &Dynamic, entry_kind: Option<&str>) -> ScriptResult<()> {
    if let Some(kind) = entry_kind {
        if !KINDS.contains(&kind) {
            return Err(script_error(format!(
                "unknown entry kind '{kind}', expected one of: {}",
                KINDS.join(", ")
            )));
        }
    }
    let reference = reference
        .iter()
        .map(Value::from_dynamic)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| script_error(format!("reference list contains {err}")))?;
    settle(fb.check_list(name, &reference, &observe(data), entry_kind))
}

fn call_user(fb: &Feedback, function: &Dynamic, args: Array) -> ScriptResult<Dynamic> {
    let args = args
        .iter()
        .map(Value::from_dynamic)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| script_error(format!("argument is {err}")))?;
    settle(fb.call_user(&observe(function), args)).map(Value::into_dynamic)
}

/// Makes the accumulator and its validators available to grading code
pub fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<Feedback>("Feedback")
        .register_type_with_name::<Callable>("Function")
        .register_fn("to_string", |f: &mut Callable| format!("<function {}>", f.display_name()))
        .register_fn("to_debug", |f: &mut Callable| format!("<function {}>", f.display_name()))
        .register_fn("grading_complete", || -> ScriptResult<()> { Err(grading_complete()) });

    engine
        .register_get("points", |fb: &mut Feedback| match fb.points() {
            Some(points) => Dynamic::from(points),
            None => Dynamic::UNIT,
        })
        .register_get("items", |fb: &mut Feedback| {
            fb.items().into_iter().map(Dynamic::from).collect::<Array>()
        })
        .register_fn("set_points", |fb: &mut Feedback, points: Dynamic| -> ScriptResult<()> {
            fb.set_points(score(&points)?);
            Ok(())
        })
        .register_fn("add_feedback", |fb: &mut Feedback, text: &str| fb.add_feedback(text))
        .register_fn(
            "finish",
            |fb: &mut Feedback, points: Dynamic, text: &str| -> ScriptResult<()> {
                let points = score(&points)?;
                settle(fb.finish(points, text))
            },
        );

    engine.register_fn(
        "check_array_sanity",
        |fb: &mut Feedback, name: &str, num_axes: INT, data: Dynamic| -> ScriptResult<()> {
            let num_axes = usize::try_from(num_axes)
                .map_err(|_| script_error(format!("invalid number of axes: {num_axes}")))?;
            settle(fb.check_array_sanity(name, num_axes, &observe(&data)))
        },
    );

    engine
        .register_fn(
            "check_array_features",
            |fb: &mut Feedback, name: &str, reference: Dynamic, data: Dynamic| {
                features(fb, name, &reference, &data, FeatureOptions::default())
            },
        )
        .register_fn(
            "check_array_features",
            |fb: &mut Feedback, name: &str, reference: Dynamic, data: Dynamic, options: Map| -> ScriptResult<bool> {
                features(fb, name, &reference, &data, feature_options(&options)?)
            },
        );

    engine
        .register_fn(
            "check_array_allclose",
            |fb: &mut Feedback, name: &str, reference: Dynamic, data: Dynamic| {
                allclose(fb, name, &reference, &data, CloseOptions::default())
            },
        )
        .register_fn(
            "check_array_allclose",
            |fb: &mut Feedback, name: &str, reference: Dynamic, data: Dynamic, options: Map| -> ScriptResult<bool> {
                allclose(fb, name, &reference, &data, close_options(&options)?)
            },
        );

    engine
        .register_fn(
            "check_scalar",
            |fb: &mut Feedback, name: &str, reference: Dynamic, data: Dynamic| {
                scalar(fb, name, &reference, &data, CloseOptions::default())
            },
        )
        .register_fn(
            "check_scalar",
            |fb: &mut Feedback, name: &str, reference: Dynamic, data: Dynamic, options: Map| -> ScriptResult<bool> {
                scalar(fb, name, &reference, &data, close_options(&options)?)
            },
        );

    engine
        .register_fn(
            "check_list",
            |fb: &mut Feedback, name: &str, reference: Array, data: Dynamic| {
                list(fb, name, reference, &data, None)
            },
        )
        .register_fn(
            "check_list",
            |fb: &mut Feedback, name: &str, reference: Array, data: Dynamic, entry_kind: &str| {
                list(fb, name, reference, &data, Some(entry_kind))
            },
        );

    engine
        .register_fn("call_user", |fb: &mut Feedback, function: Dynamic| {
            call_user(fb, &function, Array::new())
        })
        .register_fn("call_user", |fb: &mut Feedback, function: Dynamic, args: Array| {
            call_user(fb, &function, args)
        });
}
