//! Shared run-handler pool: a secondary scheduler that multiplexes inter-op
//! closures across concurrent runs when the session uses the single global
//! pool.

use std::sync::{Arc, OnceLock};

use crate::config::SessionOptions;
use crate::status::Result;
use crate::threadpool::{self, Closure, ComputePool};

pub struct RunHandlerPool {
    inter: Arc<ComputePool>,
    intra: Arc<ComputePool>,
}

impl RunHandlerPool {
    fn new(num_inter_threads: usize, num_intra_threads: usize) -> Result<Self> {
        Ok(Self {
            inter: Arc::new(ComputePool::new("RunHandlerInter", num_inter_threads)?),
            intra: Arc::new(ComputePool::new("RunHandlerIntra", num_intra_threads)?),
        })
    }

    pub fn get(self: &Arc<Self>, step_id: i64) -> RunHandler {
        RunHandler {
            inter: Arc::clone(&self.inter),
            intra: Arc::clone(&self.intra),
            step_id,
        }
    }
}

static POOL: OnceLock<Arc<RunHandlerPool>> = OnceLock::new();

/// Sized once from the first requesting session's options (environment
/// thread counts take precedence).
pub fn get_or_create_run_handler_pool(options: &SessionOptions) -> Result<Arc<RunHandlerPool>> {
    if let Some(pool) = POOL.get() {
        return Ok(Arc::clone(pool));
    }
    let env_inter = threadpool::num_inter_op_threads_from_environment();
    let env_intra = threadpool::num_intra_op_threads_from_environment();
    let num_inter = if env_inter > 0 {
        env_inter as usize
    } else {
        threadpool::num_inter_op_threads_from_options(options)
    };
    let num_intra = if env_intra > 0 {
        env_intra as usize
    } else {
        threadpool::num_intra_op_threads_from_options(options)
    };
    let pool = Arc::new(RunHandlerPool::new(num_inter, num_intra)?);
    Ok(Arc::clone(POOL.get_or_init(|| pool)))
}

/// Per-step lease on the run-handler pool.
pub struct RunHandler {
    inter: Arc<ComputePool>,
    intra: Arc<ComputePool>,
    step_id: i64,
}

impl RunHandler {
    pub fn schedule_inter_op_closure(&self, closure: Closure) {
        crate::trace!("run handler scheduling closure for step {}", self.step_id);
        self.inter.schedule_boxed(closure);
    }

    pub fn as_intra_thread_pool(&self) -> Arc<ComputePool> {
        Arc::clone(&self.intra)
    }
}
