//! Span conventions shared by DataFed services.
//!
//! Subscriber setup belongs to the process that hosts the orchestrator;
//! this module only fixes the field layout of task spans.

use tracing::Span;

use crate::id::TaskId;

/// Creates a span for task operations with standard fields.
///
/// # Example
///
/// ```rust
/// use datafed_core::id::TaskId;
/// use datafed_core::observability::task_span;
///
/// let span = task_span("run", &TaskId::generate());
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn task_span(operation: &str, task_id: &TaskId) -> Span {
    tracing::info_span!("task", op = operation, task_id = %task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_span_can_be_entered() {
        let span = task_span("test_operation", &TaskId::generate());
        let _guard = span.enter();
        tracing::info!("message in task span");
    }
}
