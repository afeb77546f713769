use safeagent_core::RunContext;
use safeagent_observe::Observer;

mod manual;
mod pipeline;
mod publish;
mod repair;
mod validate;
pub mod verify;

pub use manual::{MANUAL_HEADING, MANUAL_MARKER, MANUAL_TARGET, manual_plan};
pub use pipeline::{Pipeline, PipelineServices, RunReport};
pub use repair::AppliedPlan;
pub use validate::validate_plan;
pub use verify::{
    CommandOutcome, CommandRunner, GateOutcome, ShellCommandRunner, Verifier, check_python_syntax,
};

/// Adds a note to the run trace and mirrors it to the run log.
pub(crate) fn trace_note(observer: &Observer, ctx: &mut RunContext, detail: impl Into<String>) {
    let run_id = ctx.run_id;
    let event = ctx.note(detail).clone();
    let _ = observer.record_trace_event(run_id, &event);
}
