//! Partial runs: a stateful multi-call interface that feeds and fetches a
//! pre-pruned subgraph incrementally through a persistent rendezvous.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExecutorPolicy;
use crate::executor::{ExecutorArgs, ExecutorBarrier};
use crate::graph::parse_tensor_name;
use crate::rendezvous::parse_key;
use crate::session::run_state::{ExecutorsAndKeys, RunState, RunStateArgs};
use crate::session::{next_step_id, Session};
use crate::status::{Result, Status};
use crate::tensor::{DType, TensorValue};

impl Session {
    /// Build (or reuse) partial-run executors for the given endpoint sets,
    /// launch every partition on a persistent rendezvous, and hand back the
    /// handle later `prun` calls advance.
    pub fn prun_setup(
        &self,
        input_names: &[String],
        output_names: &[String],
        target_names: &[String],
    ) -> Result<String> {
        self.check_not_closed()?;
        self.check_graph_created("PRunSetup()")?;

        // Run options are not available during setup, so pool 0 serves the
        // whole partial run.
        let pool = Arc::clone(&self.thread_pools[0]);

        let mut run_state_args = RunStateArgs::default();
        run_state_args.is_partial_run = true;
        let executors_and_keys = self.get_or_create_executors(
            input_names,
            output_names,
            target_names,
            &mut run_state_args,
        )?;
        let handle = run_state_args.handle.clone();

        let step_id = next_step_id();
        let run_state = Arc::new(RunState::new(
            step_id,
            self.devices.clone(),
            input_names,
            output_names,
        ));
        {
            let mut cache = self.executor_cache.lock().expect("executor cache poisoned");
            if cache
                .partial_runs
                .insert(handle.clone(), Arc::clone(&run_state))
                .is_some()
            {
                return Err(Status::internal(format!(
                    "the handle {handle} created for this partial run is not unique"
                )));
            }
        }

        let barrier = {
            let status = Arc::clone(&run_state.status);
            let executors_done = Arc::clone(&run_state.executors_done);
            ExecutorBarrier::new(
                executors_and_keys.items.len(),
                Arc::clone(&run_state.rendezvous),
                move |aggregate| {
                    if aggregate.is_err() {
                        status
                            .lock()
                            .expect("run state status poisoned")
                            .update(aggregate);
                    }
                    executors_done.notify();
                },
            )
        };

        // Partial-run partitions park inside rendezvous receives, so they
        // always dispatch to the pool, never inline in the caller.
        let policy = if self.run_cost_model_executor {
            ExecutorPolicy::CostModel
        } else {
            ExecutorPolicy::Normal
        };
        let runner_pool = Arc::clone(&pool);
        let cost_pool = Arc::clone(&pool);
        let args = ExecutorArgs {
            step_id,
            session_handle: self.session_handle().to_string(),
            call_frame: None,
            rendezvous: Arc::clone(&run_state.rendezvous),
            collective_executor: None,
            cancellation_manager: Arc::clone(&self.cancellation_manager),
            session_state: Arc::clone(&self.session_state),
            tensor_store: Arc::clone(&run_state.tensor_store),
            step_container: Arc::clone(&run_state.step_container),
            sync_on_finish: self.sync_on_finish,
            policy,
            runner: Arc::new(move |closure| runner_pool.schedule_boxed(closure)),
            cost_runner: Arc::new(move |closure, _cost| cost_pool.schedule_boxed(closure)),
            stats_collector: None,
            user_intra_op_pool: None,
        };
        for item in &executors_and_keys.items {
            item.executor.run_async(args.clone(), barrier.get());
        }
        Ok(handle)
    }

    /// Advance a partial run: feed some pending inputs, fetch some pending
    /// outputs. The entry is erased once everything pending has been used.
    pub fn prun(
        &self,
        handle: &str,
        inputs: &[(String, TensorValue)],
        output_names: &[String],
        outputs: &mut Vec<TensorValue>,
    ) -> Result<()> {
        self.check_not_closed()?;
        let key = handle.split(';').next().unwrap_or(handle);

        let (executors_and_keys, run_state) = {
            let cache = self.executor_cache.lock().expect("executor cache poisoned");
            let executors_and_keys = cache.executors.get(key).cloned().ok_or_else(|| {
                Status::invalid_argument(
                    "must run PRunSetup before performing partial runs",
                )
            })?;
            let run_state = cache.partial_runs.get(handle).cloned().ok_or_else(|| {
                Status::invalid_argument(
                    "must run PRunSetup before performing partial runs",
                )
            })?;

            // Feeds and fetches must be pending and unused.
            let pending_inputs = run_state
                .pending_inputs
                .lock()
                .expect("pending inputs poisoned");
            for (name, _) in inputs {
                match pending_inputs.get(name) {
                    None => {
                        return Err(Status::invalid_argument(format!(
                            "the feed {name} was not specified in partial_run_setup"
                        )))
                    }
                    Some(true) => {
                        return Err(Status::invalid_argument(format!(
                            "the feed {name} has already been fed"
                        )))
                    }
                    Some(false) => {}
                }
            }
            let pending_outputs = run_state
                .pending_outputs
                .lock()
                .expect("pending outputs poisoned");
            for name in output_names {
                match pending_outputs.get(name) {
                    None => {
                        return Err(Status::invalid_argument(format!(
                            "the fetch {name} was not specified in partial_run_setup"
                        )))
                    }
                    Some(true) => {
                        return Err(Status::invalid_argument(format!(
                            "the fetch {name} has already been fetched"
                        )))
                    }
                    Some(false) => {}
                }
            }
            drop(pending_inputs);
            drop(pending_outputs);
            (executors_and_keys, run_state)
        };

        // Every tensor the fetches depend on must have been supplied
        // already or be part of this call.
        self.check_fetch(inputs, output_names, &executors_and_keys, &run_state)?;

        let result = self
            .send_prun_inputs(inputs, &executors_and_keys, &run_state)
            .and_then(|_| {
                self.recv_prun_outputs(output_names, &executors_and_keys, &run_state, outputs)
            })
            .and_then(|_| {
                run_state
                    .tensor_store
                    .save_tensors(output_names, &self.session_state)
            });

        {
            let mut cache = self.executor_cache.lock().expect("executor cache poisoned");
            let mut done = true;
            if result.is_ok() {
                if let Err(status) = run_state.current_status() {
                    crate::warning!(
                        "an error unrelated to this partial run has been detected: {status}"
                    );
                }
                {
                    let mut pending_inputs = run_state
                        .pending_inputs
                        .lock()
                        .expect("pending inputs poisoned");
                    for (name, _) in inputs {
                        pending_inputs.insert(name.clone(), true);
                    }
                }
                {
                    let mut pending_outputs = run_state
                        .pending_outputs
                        .lock()
                        .expect("pending outputs poisoned");
                    for name in output_names {
                        pending_outputs.insert(name.clone(), true);
                    }
                }
                done = run_state.pending_done();
            }
            if done {
                super::wait_for_notification(
                    &run_state,
                    &self.cancellation_manager,
                    self.operation_timeout_in_ms(),
                );
                cache.partial_runs.remove(handle);
            }
        }
        result
    }

    /// Reverse reachability from the requested fetches: if any still-pending
    /// feed is touched, the fetches cannot be computed yet.
    fn check_fetch(
        &self,
        feeds: &[(String, TensorValue)],
        fetches: &[String],
        executors_and_keys: &ExecutorsAndKeys,
        run_state: &RunState,
    ) -> Result<()> {
        let graph = executors_and_keys.client_graph.as_ref().ok_or_else(|| {
            Status::internal("partial-run executors are missing their client graph")
        })?;
        let name_to_node = &executors_and_keys.name_to_node;

        let mut pending_feeds: HashSet<(usize, i32)> = HashSet::new();
        {
            let pending_inputs = run_state
                .pending_inputs
                .lock()
                .expect("pending inputs poisoned");
            for (name, already_fed) in pending_inputs.iter() {
                if *already_fed {
                    continue;
                }
                let (node_name, slot) = parse_tensor_name(name);
                let node_id = *name_to_node.get(&node_name).ok_or_else(|| {
                    Status::not_found(format!("feed {name}: not found"))
                })?;
                pending_feeds.insert((node_id, slot));
            }
        }
        for (name, _) in feeds {
            let (node_name, slot) = parse_tensor_name(name);
            if let Some(node_id) = name_to_node.get(&node_name) {
                pending_feeds.remove(&(*node_id, slot));
            }
        }

        let mut stack: Vec<usize> = Vec::new();
        for fetch in fetches {
            let (node_name, _) = parse_tensor_name(fetch);
            let node_id = *name_to_node.get(&node_name).ok_or_else(|| {
                Status::not_found(format!("fetch {fetch}: not found"))
            })?;
            stack.push(node_id);
        }

        let mut visited = vec![false; graph.num_nodes()];
        while let Some(node_id) = stack.pop() {
            for edge in graph.in_edges(node_id) {
                let src = graph.node(edge.src);
                if pending_feeds.contains(&(edge.src, edge.src_output.max(0))) {
                    return Err(Status::invalid_argument(format!(
                        "fetch {}:{} can't be computed from the feeds that have been \
                         fed so far",
                        src.name,
                        edge.src_output.max(0)
                    )));
                }
                if !visited[edge.src] {
                    visited[edge.src] = true;
                    stack.push(edge.src);
                }
            }
        }
        Ok(())
    }

    fn send_prun_inputs(
        &self,
        inputs: &[(String, TensorValue)],
        executors_and_keys: &ExecutorsAndKeys,
        run_state: &RunState,
    ) -> Result<()> {
        for (name, value) in inputs {
            let rendezvous_key = executors_and_keys
                .input_name_to_rendezvous_key
                .get(name)
                .ok_or_else(|| {
                    Status::internal(format!("{name} is not a pre-defined feed"))
                })?;
            let parsed = match parse_key(rendezvous_key) {
                Ok(parsed) => parsed,
                Err(status) => {
                    run_state.rendezvous.start_abort(status.clone());
                    return Err(status);
                }
            };
            let resolved = if value.dtype() == DType::Resource {
                self.resource_handle_to_input_tensor(value)?
            } else {
                value.clone()
            };
            if let Err(status) = run_state.rendezvous.send(&parsed, resolved, false) {
                run_state.rendezvous.start_abort(status.clone());
                return Err(status);
            }
        }
        Ok(())
    }

    fn recv_prun_outputs(
        &self,
        output_names: &[String],
        executors_and_keys: &ExecutorsAndKeys,
        run_state: &RunState,
        outputs: &mut Vec<TensorValue>,
    ) -> Result<()> {
        outputs.clear();
        let timeout = match self.operation_timeout_in_ms() {
            ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        };
        for output_name in output_names {
            let rendezvous_key = executors_and_keys
                .output_name_to_rendezvous_key
                .get(output_name)
                .ok_or_else(|| {
                    Status::internal(format!("{output_name} is not a pre-defined fetch"))
                })?;
            let received = parse_key(rendezvous_key)
                .and_then(|parsed| run_state.rendezvous.recv(&parsed, timeout))
                .and_then(|(value, is_dead)| {
                    if is_dead {
                        Err(Status::invalid_argument(format!(
                            "the tensor returned for {output_name} was not valid"
                        )))
                    } else {
                        Ok(value)
                    }
                });
            match received {
                Ok(value) => outputs.push(value),
                Err(status) => {
                    run_state.rendezvous.start_abort(status.clone());
                    outputs.clear();
                    return Err(status);
                }
            }
        }
        Ok(())
    }
}
