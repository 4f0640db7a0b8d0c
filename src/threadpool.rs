//! Compute pools: session-local pools, process-wide named pools interned
//! first-writer-wins, the default global pool, and the globally indexed
//! per-device pools used by session groups.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::{SessionOptions, ThreadPoolOptions};
use crate::status::{Result, Status};

pub type Closure = Box<dyn FnOnce() + Send>;

/// A named pool of worker threads for inter-op closures.
#[derive(Debug)]
pub struct ComputePool {
    pool: ThreadPool,
    num_threads: usize,
    name: String,
    affinity: Mutex<Vec<usize>>,
}

impl ComputePool {
    pub fn new(name: impl Into<String>, num_threads: usize) -> Result<Self> {
        let name = name.into();
        let thread_name = name.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |index| format!("{thread_name}_{index}"))
            .build()
            .map_err(|err| {
                Status::internal(format!("failed to build thread pool {name}: {err}"))
            })?;
        Ok(Self {
            pool,
            num_threads,
            name,
            affinity: Mutex::new(Vec::new()),
        })
    }

    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.pool.spawn(task);
    }

    pub fn schedule_boxed(&self, task: Closure) {
        self.pool.spawn(task);
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records the CPU slice the pool's workers should run on.
    pub fn set_affinity(&self, cpus: &[usize]) {
        for cpu in cpus {
            crate::trace!("pool {} pinned to core {}", self.name, cpu);
        }
        *self.affinity.lock().expect("pool affinity poisoned") = cpus.to_vec();
    }

    pub fn affinity(&self) -> Vec<usize> {
        self.affinity.lock().expect("pool affinity poisoned").clone()
    }
}

fn read_int_env(name: &str) -> i32 {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<i32>() {
            Ok(value) => value,
            Err(_) => {
                crate::error_log!("failed to parse {name}={raw} as an integer; ignoring");
                0
            }
        },
        Err(_) => 0,
    }
}

pub fn num_inter_op_threads_from_environment() -> i32 {
    read_int_env("TF_NUM_INTEROP_THREADS")
}

pub fn num_intra_op_threads_from_environment() -> i32 {
    read_int_env("TF_NUM_INTRAOP_THREADS")
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1)
}

pub fn num_inter_op_threads_from_options(options: &SessionOptions) -> usize {
    let configured = options.config.inter_op_parallelism_threads;
    if configured > 0 {
        return configured as usize;
    }
    let from_env = num_inter_op_threads_from_environment();
    if from_env > 0 {
        return from_env as usize;
    }
    default_parallelism()
}

pub fn num_intra_op_threads_from_options(options: &SessionOptions) -> usize {
    let configured = options.config.intra_op_parallelism_threads;
    if configured > 0 {
        return configured as usize;
    }
    let from_env = num_intra_op_threads_from_environment();
    if from_env > 0 {
        return from_env as usize;
    }
    default_parallelism()
}

pub fn new_thread_pool_from_session_options(
    options: &SessionOptions,
    pool_number: usize,
) -> Result<Arc<ComputePool>> {
    let num_threads = num_inter_op_threads_from_options(options);
    crate::trace!(
        "session inter op parallelism threads for pool {pool_number}: {num_threads}"
    );
    Ok(Arc::new(ComputePool::new(
        format!("Compute{pool_number}"),
        num_threads,
    )?))
}

static GLOBAL_NAMED_POOLS: Lazy<Mutex<HashMap<String, (i32, Arc<ComputePool>)>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Build the pool described by one `session_inter_op_thread_pool` entry.
/// Pools with a `global_name` are interned process-wide; re-using a name with
/// a different thread count is an error.
pub fn new_thread_pool_from_pool_options(
    options: &SessionOptions,
    pool_options: &ThreadPoolOptions,
    pool_number: usize,
) -> Result<(Arc<ComputePool>, bool)> {
    let num_threads = if pool_options.num_threads > 0 {
        pool_options.num_threads as usize
    } else {
        num_inter_op_threads_from_options(options)
    };
    if pool_options.global_name.is_empty() {
        crate::trace!(
            "session-local inter op pool {pool_number} with {num_threads} threads"
        );
        let pool = Arc::new(ComputePool::new(
            format!("Compute{pool_number}"),
            num_threads,
        )?);
        return Ok((pool, true));
    }

    let mut pools = GLOBAL_NAMED_POOLS
        .lock()
        .expect("global named pools poisoned");
    if let Some((stored_count, pool)) = pools.get(&pool_options.global_name) {
        if *stored_count != pool_options.num_threads {
            return Err(Status::invalid_argument(format!(
                "pool {} configured previously with num_threads={}; cannot re-configure \
                 with num_threads={}",
                pool_options.global_name, stored_count, pool_options.num_threads
            )));
        }
        return Ok((Arc::clone(pool), false));
    }
    let pool = Arc::new(ComputePool::new(
        format!("Compute{pool_number}"),
        num_threads,
    )?);
    pools.insert(
        pool_options.global_name.clone(),
        (pool_options.num_threads, Arc::clone(&pool)),
    );
    Ok((pool, false))
}

static GLOBAL_POOL: Lazy<Mutex<Option<Arc<ComputePool>>>> = Lazy::new(|| Mutex::new(None));

/// The single process-wide pool used when a session configures nothing.
/// `TF_OVERRIDE_GLOBAL_THREADPOOL=true` makes each session build a private
/// pool instead of sharing the interned one.
pub fn global_thread_pool(options: &SessionOptions) -> Result<Arc<ComputePool>> {
    let override_global = match read_bool_from_env_var("TF_OVERRIDE_GLOBAL_THREADPOOL", false)
    {
        Ok(value) => value,
        Err(message) => {
            crate::error_log!("{message}");
            false
        }
    };
    if override_global {
        return new_thread_pool_from_session_options(options, 0);
    }
    let mut global = GLOBAL_POOL.lock().expect("global pool poisoned");
    if let Some(pool) = global.as_ref() {
        return Ok(Arc::clone(pool));
    }
    let pool = new_thread_pool_from_session_options(options, 0)?;
    *global = Some(Arc::clone(&pool));
    Ok(pool)
}

static GLOBAL_INDEXED_POOLS: Lazy<Mutex<HashMap<usize, Arc<ComputePool>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Device-layer pools shared across session-group members, one per index.
pub fn global_indexed_pool(index: usize, num_threads: usize) -> Result<Arc<ComputePool>> {
    let mut pools = GLOBAL_INDEXED_POOLS
        .lock()
        .expect("global indexed pools poisoned");
    if let Some(pool) = pools.get(&index) {
        return Ok(Arc::clone(pool));
    }
    let pool = Arc::new(ComputePool::new(
        format!("DeviceCompute{index}"),
        num_threads,
    )?);
    pools.insert(index, Arc::clone(&pool));
    Ok(pool)
}

/// Caller-supplied pools a single run may substitute for the session's own.
#[derive(Clone, Default)]
pub struct ExternalThreadPools {
    pub inter_op: Option<Arc<ComputePool>>,
    pub intra_op: Option<Arc<ComputePool>>,
}

/// Parse a boolean environment variable. Unset yields the default; anything
/// unparseable is an error the caller decides how to treat.
pub fn read_bool_from_env_var(
    name: &str,
    default: bool,
) -> std::result::Result<bool, String> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(format!("failed to parse {name}={other} as a boolean")),
        },
    }
}
