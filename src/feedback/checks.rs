use std::ops::ControlFlow;

use super::{Check, Feedback, Finalized};
use crate::sandbox::diagnostics::{Failure, USER_LABEL};
use crate::value::{dismantle_error, Complex, NdArray, Value};

/// Options of the array feature check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureOptions {
    /// Reject NaN and infinite elements
    pub check_finite: bool,
    /// Hard mode: a violation finishes grading at zero points.
    /// Soft mode: a violation only returns `false`.
    pub report_failure: bool,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            check_finite: true,
            report_failure: true,
        }
    }
}

/// Options of the approximate-equality checks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseOptions {
    pub accuracy_critical: bool,
    /// `None` disables the relative tolerance
    pub rtol: Option<f64>,
    /// `None` disables the absolute tolerance
    pub atol: Option<f64>,
    pub report_success: bool,
    pub report_failure: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            accuracy_critical: true,
            rtol: Some(1e-5),
            atol: Some(1e-8),
            report_success: true,
            report_failure: true,
        }
    }
}

/// Either tolerance alone is enough for a match
pub fn is_close(reference: Complex, candidate: Complex, rtol: Option<f64>, atol: Option<f64>) -> bool {
    let diff = (reference - candidate).norm();
    rtol.is_some_and(|rtol| diff < reference.norm() * rtol) || atol.is_some_and(|atol| diff < atol)
}

/// Numeric value of a scalar.
///
/// Besides ints, floats and complex numbers this accepts maps that describe
/// themselves as numbers through an `is_number: true` field and carry their
/// numeric `value`, which is how symbolic values are handed to grading code.
pub fn as_number(value: &Value) -> Option<Complex> {
    match value {
        Value::Int(i) => Some(Complex::real(*i as f64)),
        Value::Float(f) => Some(Complex::real(*f)),
        Value::Complex(c) => Some(*c),
        Value::Map(fields) => match fields.get("is_number") {
            Some(Value::Bool(true)) => match fields.get("value") {
                Some(inner @ (Value::Int(_) | Value::Float(_) | Value::Complex(_))) => {
                    as_number(inner)
                }
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// First way `data` differs from `reference` in container kind, shape,
/// element kind or, with `check_finite`, finiteness
fn feature_mismatch(name: &str, reference: &NdArray, data: &Value, check_finite: bool) -> Option<String> {
    let Value::Array(array) = data else {
        return Some(format!("'{name}' is not an array"));
    };

    if array.shape() != reference.shape() {
        return Some(format!(
            "'{name}' does not have correct shape--got: '{}', expected: '{}'",
            array.shape_string(),
            reference.shape_string()
        ));
    }

    if array.dtype() != reference.dtype() {
        return Some(format!(
            "'{name}' does not have correct data type--got: '{}', expected: '{}'",
            array.dtype().name(),
            reference.dtype().name()
        ));
    }

    if check_finite {
        if array.has_nan() {
            return Some(format!("'{name}' contains NaN"));
        }
        if array.has_inf() {
            return Some(format!("'{name}' contains Inf"));
        }
    }

    None
}

impl Feedback {
    /// Requires a float or complex array with exactly `num_axes` axes
    pub fn check_array_sanity(&self, name: &str, num_axes: usize, data: &Value) -> Check<()> {
        let Value::Array(array) = data else {
            return self.finish(0.0, format!("'{name}' is not an array"));
        };

        if array.ndim() != num_axes {
            return self.finish(
                0.0,
                format!(
                    "'{name}' does not have the correct number of axes--got: {}, expected: {num_axes}",
                    array.ndim()
                ),
            );
        }

        if !array.dtype().is_inexact() {
            return self.finish(
                0.0,
                format!(
                    "'{name}' does not consist of floating point numbers--got: '{}'",
                    array.dtype().name()
                ),
            );
        }

        ControlFlow::Continue(())
    }

    /// Compares container kind, shape and element kind against `reference`
    pub fn check_array_features(
        &self,
        name: &str,
        reference: &NdArray,
        data: &Value,
        options: FeatureOptions,
    ) -> Check {
        match feature_mismatch(name, reference, data, options.check_finite) {
            None => ControlFlow::Continue(true),
            Some(message) if options.report_failure => self.finish(0.0, message),
            Some(message) => {
                log::debug!("soft feature check failed: {message}");
                ControlFlow::Continue(false)
            }
        }
    }

    /// Feature check followed by elementwise approximate equality.
    ///
    /// A feature mismatch counts as an inaccurate answer: `report_failure`
    /// only decides whether it is reported.
    pub fn check_array_allclose(
        &self,
        name: &str,
        reference: &NdArray,
        data: &Value,
        options: CloseOptions,
    ) -> Check {
        let array = match (feature_mismatch(name, reference, data, true), data) {
            (None, Value::Array(array)) => array,
            (mismatch, _) => {
                let message = mismatch.unwrap_or_else(|| format!("'{name}' is not an array"));
                if options.report_failure {
                    self.add_feedback(message);
                } else {
                    log::debug!("feature check failed: {message}");
                }
                if options.accuracy_critical {
                    self.set_points(0.0);
                    return ControlFlow::Break(Finalized);
                }
                return ControlFlow::Continue(false);
            }
        };

        let good = (0..reference.len()).all(|i| {
            is_close(
                reference.complex_at(i),
                array.complex_at(i),
                options.rtol,
                options.atol,
            )
        });
        self.report_closeness(name, good, options)
    }

    /// Numeric-kind check followed by approximate equality
    pub fn check_scalar(
        &self,
        name: &str,
        reference: Complex,
        data: &Value,
        options: CloseOptions,
    ) -> Check {
        let Some(candidate) = as_number(data) else {
            return self.finish(0.0, format!("'{name}' is not a number"));
        };

        let good = is_close(reference, candidate, options.rtol, options.atol);
        self.report_closeness(name, good, options)
    }

    fn report_closeness(&self, name: &str, good: bool, options: CloseOptions) -> Check {
        if good {
            if options.report_success {
                self.add_feedback(format!("'{name}' looks good"));
            }
        } else if options.report_failure {
            self.add_feedback(format!("'{name}' is inaccurate"));
        }

        if options.accuracy_critical && !good {
            self.set_points(0.0);
            return ControlFlow::Break(Finalized);
        }

        ControlFlow::Continue(good)
    }

    /// Requires a list of the reference's length, optionally with a uniform
    /// element kind
    pub fn check_list(
        &self,
        name: &str,
        reference: &[Value],
        data: &Value,
        entry_kind: Option<&str>,
    ) -> Check<()> {
        let Value::List(items) = data else {
            return self.finish(0.0, format!("'{name}' is not a list"));
        };

        if items.len() != reference.len() {
            return self.finish(
                0.0,
                format!(
                    "'{name}' has the wrong length--expected {}, got {}",
                    reference.len(),
                    items.len()
                ),
            );
        }

        if let Some(kind) = entry_kind {
            if let Some(i) = items.iter().position(|item| !item.is_kind(kind)) {
                return self.finish(0.0, format!("'{name}[{i}]' has the wrong type"));
            }
        }

        ControlFlow::Continue(())
    }

    /// Calls a function supplied by the submission.
    ///
    /// Any failure inside it, or a non-callable value, ends grading at zero
    /// points with an explanation instead of failing the test stage.
    pub fn call_user(&self, function: &Value, args: Vec<Value>) -> Check<Value> {
        let Value::Function(callable) = function else {
            self.add_feedback(
                "<p>Your code was supposed to supply a function or callable, \
                 but the variable you supplied was not callable.</p>",
            );
            self.set_points(0.0);
            return ControlFlow::Break(Finalized);
        };

        match callable.call(args) {
            Ok(result) => ControlFlow::Continue(result),
            Err(err) => {
                let failure = Failure::from_eval(USER_LABEL, &err);
                dismantle_error(err);
                log::debug!("submitted callable failed: {}", failure.message());
                self.add_feedback(format!(
                    "<p>The callable '{}' supplied in your code failed with an error \
                     while it was being called by the grading code:</p><pre>{}</pre>",
                    escape_html(&callable.display_name()),
                    escape_html(&failure.traceback)
                ));
                self.set_points(0.0);
                ControlFlow::Break(Finalized)
            }
        }
    }
}
