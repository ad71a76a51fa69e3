//! The workflow as an explicit finite-state machine.
//!
//! Stage runners perform side effects and report an [`Event`]; the pure
//! [`transition`] function decides where execution goes next.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{QueryTalkError, Result};
use crate::workflow::state::QuestionClass;

/// Named workflow nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Classify,
    GeneralAnswer,
    Analyze,
    Clarify,
    Refine,
    SynthesizeQuery,
    Execute,
    Answer,
}

impl Node {
    /// Returns the node name as stored in snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::GeneralAnswer => "general_answer",
            Self::Analyze => "analyze",
            Self::Clarify => "clarify",
            Self::Refine => "refine",
            Self::SynthesizeQuery => "synthesize_query",
            Self::Execute => "execute",
            Self::Answer => "answer",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported by a stage runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Classified(QuestionClass),
    /// A general or final answer was produced.
    Answered,
    Analyzed {
        clarify: bool,
    },
    /// A new clarifying question was appended and needs a human answer.
    ClarificationNeeded,
    ClarificationComplete {
        rounds: usize,
    },
    Refined,
    QuerySynthesized,
    ResultShaped,
    /// Execution failed and the query may be regenerated.
    QueryFailed,
}

/// Where execution continues after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Goto(Node),
    /// Pause; resume at the given node once the caller supplies input.
    Suspend(Node),
    Finish,
}

/// Computes the next step for `event` reported at `node`.
///
/// A pair that cannot occur is an internal error.
pub fn transition(node: Node, event: &Event) -> Result<Transition> {
    use Event::*;
    use Node::*;

    let next = match (node, event) {
        (Classify, Classified(QuestionClass::Data)) => Transition::Goto(Analyze),
        (Classify, Classified(QuestionClass::Conversational)) => Transition::Goto(GeneralAnswer),
        (GeneralAnswer, Answered) => Transition::Finish,
        (Analyze, Analyzed { clarify: true }) => Transition::Goto(Clarify),
        (Analyze, Analyzed { clarify: false }) => Transition::Goto(SynthesizeQuery),
        (Clarify, ClarificationNeeded) => Transition::Suspend(Clarify),
        (Clarify, ClarificationComplete { rounds: 0 }) => Transition::Goto(SynthesizeQuery),
        (Clarify, ClarificationComplete { .. }) => Transition::Goto(Refine),
        (Refine, Refined) => Transition::Goto(SynthesizeQuery),
        (SynthesizeQuery, QuerySynthesized) => Transition::Goto(Execute),
        (Execute, ResultShaped) => Transition::Goto(Answer),
        (Execute, QueryFailed) => Transition::Goto(SynthesizeQuery),
        (Answer, Answered) => Transition::Finish,
        (node, event) => {
            return Err(QueryTalkError::internal(format!(
                "No transition from {node} on {event:?}"
            )))
        }
    };

    Ok(next)
}
