//! Request/response payloads exchanged with the driver that feeds the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Text that replaces the test source once it has been compiled.
pub const REDACTED_SOURCE: &str = "// (removed)";

/// A test-source line holding only this marker is replaced by the reference
/// solution.
pub const CORRECT_CODE_TAG: &str = "###CORRECT_CODE###";

/// Expands every [`CORRECT_CODE_TAG`] line of `test_code` into the lines of
/// `correct_code`, each prefixed with the marker line's indentation.
pub fn substitute_correct_code(test_code: &str, correct_code: &str) -> String {
    let mut lines = Vec::new();
    for line in test_code.split('\n') {
        let body = line.trim_start();
        if body.trim_end() != CORRECT_CODE_TAG {
            lines.push(line.to_string());
            continue;
        }
        let indent = &line[..line.len() - body.len()];
        lines.extend(correct_code.split('\n').map(|cc| format!("{indent}{cc}")));
    }
    lines.join("\n")
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Request {
    #[serde(default)]
    pub setup_code: Option<String>,
    pub user_code: String,
    #[serde(default)]
    pub test_code: Option<String>,
    /// Names copied from the setup stage into the submission namespace
    #[serde(default)]
    pub names_for_user: Vec<String>,
    /// Names copied back out of the submission namespace for the test stage
    #[serde(default)]
    pub names_from_user: Vec<String>,
    /// Data file name to base64-encoded contents
    #[serde(default)]
    pub data_files: BTreeMap<String, String>,
    #[serde(default)]
    pub compile_only: bool,
}

impl Request {
    /// Substitutes the reference solution into the test source
    pub fn with_correct_code(mut self, correct_code: &str) -> Self {
        if let Some(test_code) = &self.test_code {
            self.test_code = Some(substitute_correct_code(test_code, correct_code));
        }
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Success,
    Timeout,
    UncaughtError,
    SetupCompileError,
    SetupError,
    UserCompileError,
    UserError,
    TestCompileError,
    TestError,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::UncaughtError => "uncaught_error",
            Self::SetupCompileError => "setup_compile_error",
            Self::SetupError => "setup_error",
            Self::UserCompileError => "user_compile_error",
            Self::UserError => "user_error",
            Self::TestCompileError => "test_compile_error",
            Self::TestError => "test_error",
        };
        f.write_str(s)
    }
}

/// A rendered figure, transported as an `[index, mime_type, data]` triple
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "(i64, String, String)", into = "(i64, String, String)")]
pub struct Figure {
    pub index: i64,
    pub mime_type: String,
    /// base64-encoded image bytes
    pub data: String,
}

impl From<(i64, String, String)> for Figure {
    fn from((index, mime_type, data): (i64, String, String)) -> Self {
        Self {
            index,
            mime_type,
            data,
        }
    }
}

impl From<Figure> for (i64, String, String) {
    fn from(figure: Figure) -> Self {
        (figure.index, figure.mime_type, figure.data)
    }
}

/// Score and feedback produced by the test stage
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Grade {
    /// `None` when the test code never assigned points
    pub points: Option<f64>,
    pub feedback: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub result: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figures: Option<Vec<Figure>>,
    /// Raw markup fragments; the consumer sanitizes them before display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<Vec<String>>,
    #[serde(flatten)]
    pub grade: Option<Grade>,
}

impl Response {
    pub fn new(result: ResultKind) -> Self {
        Self {
            result,
            message: None,
            traceback: None,
            stdout: None,
            stderr: None,
            figures: None,
            html: None,
            grade: None,
        }
    }

    pub fn failure(result: ResultKind, message: String, traceback: String) -> Self {
        Self {
            message: Some(message),
            traceback: Some(traceback),
            ..Self::new(result)
        }
    }

    /// Response for a fault of the orchestrator itself rather than of any stage
    pub fn uncaught(err: &anyhow::Error) -> Self {
        Self::failure(
            ResultKind::UncaughtError,
            format!("InternalError: {err}"),
            format!("{err:?}"),
        )
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        let message = format!(
            "TimeoutError: grading did not finish within {:.1} seconds",
            limit.as_secs_f64()
        );
        Self::failure(ResultKind::Timeout, message.clone(), message)
    }

    pub fn points(&self) -> Option<f64> {
        self.grade.as_ref().and_then(|g| g.points)
    }

    pub fn feedback(&self) -> Option<&[String]> {
        self.grade.as_ref().map(|g| g.feedback.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request: Request = serde_json::from_value(json!({ "user_code": "let x = 1;" })).unwrap();
        assert_eq!(request.setup_code, None);
        assert!(request.names_for_user.is_empty());
        assert!(request.data_files.is_empty());
        assert!(!request.compile_only);
    }

    #[test]
    fn test_correct_code_keeps_marker_indentation() {
        let test_code = "fn reference() {\n    ###CORRECT_CODE###  \n}\n###CORRECT_CODE###\nlet tag = \"###CORRECT_CODE###\";";
        let expanded = substitute_correct_code(test_code, "let a = 1;\nlet b = a;");
        assert_eq!(
            expanded,
            "fn reference() {\n    let a = 1;\n    let b = a;\n}\nlet a = 1;\nlet b = a;\nlet tag = \"###CORRECT_CODE###\";"
        );
    }

    #[test]
    fn test_with_correct_code_needs_test_code() {
        let request = Request {
            user_code: "let x = 1;".to_string(),
            ..Request::default()
        };
        assert_eq!(request.clone().with_correct_code("let y = 2;"), request);

        let request = Request {
            test_code: Some("\t###CORRECT_CODE###".to_string()),
            ..request
        };
        assert_eq!(
            request.with_correct_code("let y = 2;").test_code.as_deref(),
            Some("\tlet y = 2;")
        );
    }

    #[test]
    fn test_failure_omits_grade_fields() {
        let response = Response::failure(
            ResultKind::UserError,
            "RuntimeError: boom".to_string(),
            "trace".to_string(),
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["result"], "user_error");
        assert!(value.get("points").is_none());
        assert!(value.get("feedback").is_none());
    }

    #[test]
    fn test_success_emits_null_points() {
        let mut response = Response::new(ResultKind::Success);
        response.grade = Some(Grade {
            points: None,
            feedback: vec![],
        });
        response.figures = Some(vec![Figure {
            index: 1,
            mime_type: "image/svg+xml".to_string(),
            data: "PHN2Zz4=".to_string(),
        }]);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "result": "success",
                "figures": [[1, "image/svg+xml", "PHN2Zz4="]],
                "points": null,
                "feedback": [],
            })
        );
    }
}
