use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rhai::{Dynamic, Engine, Map, Scope, AST};

use super::bridge::{self, Transfer};
use super::diagnostics::{Failure, SETUP_LABEL, TEST_LABEL, USER_LABEL};
use super::engine::{maintenance_engine, submission_engine, Captured, Limits, Streams};
use super::executor::{self, run_isolated, Outcome};
use super::figures::Figures;
use crate::feedback::{is_grading_complete, Feedback};
use crate::protocol::{Request, Response, ResultKind, REDACTED_SOURCE};
use crate::value::{dismantle, dismantle_error, FunctionLib, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Setup,
    User,
    Test,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Self::Setup => SETUP_LABEL,
            Self::User => USER_LABEL,
            Self::Test => TEST_LABEL,
        }
    }

    fn compile_error(self) -> ResultKind {
        match self {
            Self::Setup => ResultKind::SetupCompileError,
            Self::User => ResultKind::UserCompileError,
            Self::Test => ResultKind::TestCompileError,
        }
    }

    fn run_error(self) -> ResultKind {
        match self {
            Self::Setup => ResultKind::SetupError,
            Self::User => ResultKind::UserError,
            Self::Test => ResultKind::TestError,
        }
    }
}

fn compile(engine: &Engine, stage: Stage, source: &str) -> Result<AST, Response> {
    engine.compile(source).map_err(|err| {
        let failure = Failure::from_parse(stage.label(), &err);
        log::debug!("{} failed to compile: {}", stage.label(), failure.message());
        Response::failure(stage.compile_error(), failure.message(), failure.traceback)
    })
}

/// Present and not just whitespace
fn non_empty(source: &Option<String>) -> Option<&str> {
    source.as_deref().filter(|s| !s.trim().is_empty())
}

fn decode_data_files(request: &Request) -> Result<Map> {
    request
        .data_files
        .iter()
        .map(|(name, encoded)| {
            let bytes = STANDARD
                .decode(encoded)
                .with_context(|| format!("Data file '{name}' is not valid base64"))?;
            Ok((name.as_str().into(), Dynamic::from_blob(bytes)))
        })
        .collect()
}

/// What the orchestrator keeps of a finished submission
struct Submitted {
    answers: Vec<(String, Value)>,
    transfer: Transfer,
    failure: Option<Failure>,
}

impl Submitted {
    /// Runs on the submission worker: snapshots the answers, then takes the
    /// submission's namespace apart there.
    fn settle(outcome: Outcome, names: &[String]) -> Self {
        let Outcome {
            engine,
            ast,
            scope,
            error,
        } = outcome;
        let lib = Arc::new(FunctionLib::new(engine, &ast));
        let (answers, transfer) = bridge::capture_names(names, &scope, Some(&lib));
        for (_, value, _) in scope {
            dismantle(value);
        }
        let failure = error.map(|err| {
            let failure = Failure::from_eval(USER_LABEL, &err);
            dismantle_error(err);
            failure
        });

        Self {
            answers,
            transfer,
            failure,
        }
    }
}

/// Output collected so far, attached to every response after decoding
fn with_output(mut response: Response, captured: Captured) -> Response {
    response.stdout = Some(captured.stdout).filter(|s| !s.is_empty());
    response.stderr = Some(captured.stderr).filter(|s| !s.is_empty());
    response.html = Some(captured.html).filter(|h| !h.is_empty());
    response
}

/// Compiles and runs the three stages of a grading request
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    limits: Limits,
}

impl Pipeline {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Grades one request.
    ///
    /// Only one run is in flight per process; a concurrent caller waits.
    pub fn run(&self, request: Request) -> Response {
        let _flight = executor::single_flight();

        let response = match self.grade(request) {
            Ok(response) => response,
            Err(e) => {
                log::error!("Grading run failed: {e:#}");
                Response::uncaught(&e)
            }
        };
        log::info!("Grading run finished: {}", response.result);
        response
    }

    fn grade(&self, mut request: Request) -> Result<Response> {
        let streams = Streams::new();
        let figures = Figures::new();
        let maintenance = maintenance_engine(&self.limits, &streams, &figures);
        let submission = submission_engine(&self.limits, &streams, &figures);

        // 1-3. Compile everything before running anything
        let setup_ast = match non_empty(&request.setup_code) {
            Some(source) => match compile(&maintenance, Stage::Setup, source) {
                Ok(ast) => Some(ast),
                Err(response) => return Ok(response),
            },
            None => None,
        };
        let user_ast = match compile(&submission, Stage::User, &request.user_code) {
            Ok(ast) => ast,
            Err(response) => return Ok(response),
        };
        let test_ast = match non_empty(&request.test_code) {
            Some(source) => match compile(&maintenance, Stage::Test, source) {
                Ok(ast) => Some(ast),
                Err(response) => return Ok(response),
            },
            None => None,
        };
        if request.test_code.is_some() {
            request.test_code = Some(REDACTED_SOURCE.to_string());
        }

        // 4.
        if request.compile_only {
            log::debug!("Compile-only request, skipping execution");
            return Ok(Response::new(ResultKind::Success));
        }

        // 5.
        let data_files = decode_data_files(&request)?;

        // 6. Setup stage in the maintenance namespace
        let mut scope = Scope::new();
        scope.push("user_code", request.user_code.clone());
        scope.push("data_files", data_files);
        let setup_functions = setup_ast
            .as_ref()
            .map(AST::clone_functions_only)
            .unwrap_or_default();

        if let Some(ast) = &setup_ast {
            log::debug!("Running setup code");
            if let Err(err) = maintenance.run_ast_with_scope(&mut scope, ast) {
                return Ok(self.stage_failure(Stage::Setup, &err, &streams));
            }
        }

        // 7-8. Bridge allow-listed names into a fresh submission namespace
        let mut user_scope = Scope::new();
        let transfer = bridge::copy_names(&request.names_for_user, &scope, &mut user_scope, None);
        let defined: BTreeSet<&str> = setup_functions.iter_functions().map(|f| f.name).collect();
        let mut shared_functions = BTreeSet::new();
        for name in bridge::dedupe(&request.names_for_user) {
            if let Some((_, err)) = transfer.rejected.iter().find(|(n, _)| n == name) {
                let failure = Failure::new(SETUP_LABEL, "TypeMismatch", format!("'{name}' is bound to {err}"));
                return Ok(self.failure(Stage::Setup, failure, &streams));
            }
            if !transfer.missing.iter().any(|n| n == name) {
                continue;
            }
            if !defined.contains(name) {
                let failure = Failure::new(
                    SETUP_LABEL,
                    "VariableNotFound",
                    format!("Setup code did not define '{name}'."),
                );
                return Ok(self.failure(Stage::Setup, failure, &streams));
            }
            shared_functions.insert(name.to_string());
        }
        let user_ast = setup_functions
            .clone_functions_only_filtered(|_, _, _, name, _| shared_functions.contains(name))
            .merge(&user_ast);
        user_scope.push("source_code", request.user_code.clone());

        // 9.
        log::debug!("Running submitted code");
        let names = request.names_from_user.clone();
        let submitted = run_isolated(
            submission,
            user_ast,
            user_scope,
            self.limits.worker_stack_size,
            move |outcome| Submitted::settle(outcome, &names),
        )?;

        // 10. The accumulator only exists once submitted code is done
        let feedback = Feedback::new();
        scope.push("feedback", feedback.clone());

        // 11.
        if figures.is_engaged() {
            log::debug!("Capturing figures");
        }
        let captured_figures = figures.capture();

        // 12. Bridge answers back
        for (name, value) in submitted.answers {
            scope.push_dynamic(name, value.into_dynamic());
        }
        for name in &submitted.transfer.missing {
            log::warn!("Submission did not define answer '{name}'");
            feedback.add_feedback(format!("Required answer variable '{name}' is not defined."));
            scope.push_dynamic(name.as_str(), Dynamic::UNIT);
        }
        for (name, err) in &submitted.transfer.rejected {
            log::warn!("Submission answer '{name}' cannot be transferred: {err}");
            feedback.add_feedback(format!(
                "Required answer variable '{name}' is {err}."
            ));
            scope.push_dynamic(name.as_str(), Dynamic::UNIT);
        }

        // 13.
        if let Some(failure) = submitted.failure {
            return Ok(self.failure(Stage::User, failure, &streams));
        }

        // 14.
        if let Some(ast) = test_ast {
            log::debug!("Running test code");
            let ast = setup_functions.merge(&ast);
            match maintenance.run_ast_with_scope(&mut scope, &ast) {
                Ok(()) => {}
                Err(err) if is_grading_complete(&err) => {
                    log::debug!("Grading finalized early by test code");
                }
                Err(err) => return Ok(self.stage_failure(Stage::Test, &err, &streams)),
            }
        }

        // 15.
        let mut response = Response::new(ResultKind::Success);
        response.figures = Some(captured_figures).filter(|f| !f.is_empty());
        response.grade = Some(feedback.to_grade());
        Ok(with_output(response, streams.snapshot()))
    }

    fn stage_failure(&self, stage: Stage, err: &rhai::EvalAltResult, streams: &Streams) -> Response {
        self.failure(stage, Failure::from_eval(stage.label(), err), streams)
    }

    fn failure(&self, stage: Stage, failure: Failure, streams: &Streams) -> Response {
        log::debug!("{} failed: {}", stage.label(), failure.message());
        let response = Response::failure(stage.run_error(), failure.message(), failure.traceback);
        with_output(response, streams.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user_code: &str) -> Request {
        Request {
            user_code: user_code.to_string(),
            ..Request::default()
        }
    }

    #[test]
    fn test_blank_sources_are_skipped() {
        let response = Pipeline::default().run(Request {
            setup_code: Some("   ".to_string()),
            test_code: Some("\n".to_string()),
            ..request("let x = 1;")
        });
        assert_eq!(response.result, ResultKind::Success);
        assert_eq!(response.points(), None);
        assert_eq!(response.feedback(), Some(&[][..]));
    }

    #[test]
    fn test_bad_data_file_is_uncaught() {
        let mut req = request("let x = 1;");
        req.data_files.insert("data.bin".to_string(), "not base64!".to_string());
        let response = Pipeline::default().run(req);
        assert_eq!(response.result, ResultKind::UncaughtError);
        assert!(response.message.unwrap().starts_with("InternalError: "));
    }

    #[test]
    fn test_data_files_are_decoded() {
        let mut req = request("let x = 1;");
        req.data_files.insert("hello.txt".to_string(), STANDARD.encode("hi"));
        req.test_code = Some(
            r#"
            let blob = data_files["hello.txt"];
            if blob.len() == 2 { feedback.set_points(1.0); }
            "#
            .to_string(),
        );
        let response = Pipeline::default().run(req);
        assert_eq!(response.result, ResultKind::Success);
        assert_eq!(response.points(), Some(1.0));
    }

    #[test]
    fn test_user_code_visible_to_grading_only() {
        let mut req = request("let answer = source_code.len();");
        req.names_from_user = vec!["answer".to_string()];
        req.test_code = Some(
            r#"
            if user_code.len() == answer { feedback.set_points(1.0); }
            "#
            .to_string(),
        );
        let response = Pipeline::default().run(req);
        assert_eq!(response.result, ResultKind::Success);
        assert_eq!(response.points(), Some(1.0));
    }
}
