//! Deno ops exposed to scripts running in the bridge runtime.

use deno_core::{extension, op2};

/// Whether the bridge job queue has nothing pending.
#[op2(fast)]
fn op_tandem_job_queue_is_empty() -> bool {
    crate::job_queue::is_empty()
}

extension!(
    tandem_ops,
    ops = [
        op_tandem_job_queue_is_empty,
    ],
);
