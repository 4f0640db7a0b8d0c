//! Callables: a fixed `(feeds, fetches, targets)` request compiled once and
//! re-run cheaply under a dense integer handle.

use std::collections::HashMap;
use std::sync::Arc;

use crate::callframe::{CallFrame, FunctionCallFrame};
use crate::config::CallableOptions;
use crate::executor::stats::RunMetadata;
use crate::metrics;
use crate::session::run_state::{ExecutorsAndKeys, FunctionInfo, RunStateArgs};
use crate::session::{next_step_id, Session};
use crate::status::{Result, Status};
use crate::tensor::{DType, TensorValue};
use crate::threadpool::ExternalThreadPools;

pub type CallableHandle = i64;

/// Field order matters: executors must be released before the function
/// info they consult while tearing kernels down.
pub(crate) struct Callable {
    pub executors_and_keys: Arc<ExecutorsAndKeys>,
    #[allow(dead_code)]
    pub function_info: Arc<FunctionInfo>,
}

pub(crate) struct CallableTable {
    next_handle: CallableHandle,
    entries: HashMap<CallableHandle, Callable>,
}

impl CallableTable {
    pub fn new() -> Self {
        Self {
            next_handle: 0,
            entries: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Session {
    /// Eagerly build and cache the executors for the given options.
    pub fn make_callable(&self, callable_options: &CallableOptions) -> Result<CallableHandle> {
        self.check_not_closed()?;
        self.check_graph_created("MakeCallable()")?;

        let run_state_args =
            RunStateArgs::new(callable_options.run_options.debug_options.clone());
        let (executors_and_keys, function_info) =
            self.create_executors(callable_options.clone(), &run_state_args)?;
        let mut callables = self.callables.lock().expect("callables poisoned");
        let handle = callables.next_handle;
        callables.next_handle += 1;
        callables.entries.insert(
            handle,
            Callable {
                executors_and_keys,
                function_info,
            },
        );
        Ok(handle)
    }

    pub fn run_callable(
        &self,
        handle: CallableHandle,
        feed_tensors: &[TensorValue],
        fetch_tensors: &mut Vec<TensorValue>,
        run_metadata: &mut RunMetadata,
    ) -> Result<()> {
        self.run_callable_with_pools(
            handle,
            feed_tensors,
            fetch_tensors,
            run_metadata,
            &ExternalThreadPools::default(),
        )
    }

    pub fn run_callable_with_pools(
        &self,
        handle: CallableHandle,
        feed_tensors: &[TensorValue],
        fetch_tensors: &mut Vec<TensorValue>,
        run_metadata: &mut RunMetadata,
        thread_pools: &ExternalThreadPools,
    ) -> Result<()> {
        self.check_not_closed()?;
        self.check_graph_created("RunCallable()")?;
        metrics::increment_session_runs();

        let step_id = next_step_id();
        let executors_and_keys = {
            let callables = self.callables.lock().expect("callables poisoned");
            if handle >= callables.next_handle {
                return Err(Status::invalid_argument(format!(
                    "no such callable handle: {handle}"
                )));
            }
            callables
                .entries
                .get(&handle)
                .map(|callable| Arc::clone(&callable.executors_and_keys))
                .ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "attempted to run callable after handle was released: {handle}"
                    ))
                })?
        };

        if feed_tensors.len() != executors_and_keys.input_types.len() {
            return Err(Status::invalid_argument(format!(
                "expected {} feed tensors, but got {}",
                executors_and_keys.input_types.len(),
                feed_tensors.len()
            )));
        }

        let input_bytes: usize = feed_tensors.iter().map(TensorValue::byte_size).sum();
        metrics::record_graph_input_tensors(input_bytes);

        // The frame is backed by the caller's feed vector; resource-typed
        // entries still resolve through the session tensor store.
        let mut resolved_feeds = Vec::with_capacity(feed_tensors.len());
        for value in feed_tensors {
            if value.dtype() == DType::Resource {
                resolved_feeds.push(self.resource_handle_to_input_tensor(value)?);
            } else {
                resolved_feeds.push(value.clone());
            }
        }
        let mut frame = FunctionCallFrame::new(
            executors_and_keys.input_types.clone(),
            executors_and_keys.output_types.clone(),
        );
        frame
            .set_args(resolved_feeds)
            .map_err(Status::demote_internal)?;
        let frame = Arc::new(frame);

        let run_options = executors_and_keys.callable_options.run_options.clone();
        self.run_internal(
            step_id,
            &run_options,
            Some(Arc::clone(&frame) as Arc<dyn CallFrame>),
            &executors_and_keys,
            run_metadata,
            thread_pools,
        )?;

        *fetch_tensors = frame.consume_retvals().map_err(Status::demote_internal)?;
        let output_bytes: usize = fetch_tensors.iter().map(TensorValue::byte_size).sum();
        metrics::record_graph_output_tensors(output_bytes);
        Ok(())
    }

    /// Drop the callable; its executors are released before the function
    /// info (see `Callable`).
    pub fn release_callable(&self, handle: CallableHandle) -> Result<()> {
        let mut callables = self.callables.lock().expect("callables poisoned");
        if handle >= callables.next_handle {
            return Err(Status::invalid_argument(format!(
                "no such callable handle: {handle}"
            )));
        }
        callables.entries.remove(&handle);
        Ok(())
    }
}
