//! Score and feedback accumulated by grading code.
//!
//! The accumulator only exists from the test stage onwards; the pipeline
//! creates it after the submission has finished running, so submitted code
//! never holds a reference to it.

mod bindings;
mod checks;

pub use bindings::{grading_complete, is_grading_complete, register};
pub use checks::{as_number, escape_html, is_close, CloseOptions, FeatureOptions};

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::Grade;

/// Grading was finalized early; the rest of the test stage must not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalized;

/// Result of a validator: either keep grading with a value, or stop.
pub type Check<T = bool> = ControlFlow<Finalized, T>;

#[derive(Debug, Default)]
struct State {
    points: Option<f64>,
    items: Vec<String>,
}

/// Handle to the accumulator of one pipeline run
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    state: Arc<Mutex<State>>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the score; earlier values are discarded
    pub fn set_points(&self, points: f64) {
        self.state.lock().points = Some(points);
    }

    pub fn add_feedback(&self, text: impl Into<String>) {
        self.state.lock().items.push(text.into());
    }

    /// Records a final message and score, then stops grading
    pub fn finish<T>(&self, points: f64, text: impl Into<String>) -> Check<T> {
        self.add_feedback(text);
        self.set_points(points);
        ControlFlow::Break(Finalized)
    }

    pub fn points(&self) -> Option<f64> {
        self.state.lock().points
    }

    pub fn items(&self) -> Vec<String> {
        self.state.lock().items.clone()
    }

    pub fn to_grade(&self) -> Grade {
        let state = self.state.lock();
        Grade {
            points: state.points,
            feedback: state.items.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_last_write_wins() {
        let feedback = Feedback::new();
        assert_eq!(feedback.points(), None);
        feedback.set_points(0.5);
        feedback.set_points(0.25);
        assert_eq!(feedback.points(), Some(0.25));
    }

    #[test]
    fn test_finish_appends_and_stops() {
        let feedback = Feedback::new();
        feedback.add_feedback("first");
        let flow: Check<()> = feedback.finish(0.0, "done");
        assert_eq!(flow, ControlFlow::Break(Finalized));
        assert_eq!(
            feedback.to_grade(),
            Grade {
                points: Some(0.0),
                feedback: vec!["first".to_string(), "done".to_string()],
            }
        );
    }

    #[test]
    fn test_clones_share_state() {
        let feedback = Feedback::new();
        let alias = feedback.clone();
        alias.add_feedback("from alias");
        assert_eq!(feedback.items(), vec!["from alias".to_string()]);
    }
}
