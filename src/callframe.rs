//! Call frames: the executor's view of argument and return-value slots.

use std::sync::Mutex;

use crate::status::{Result, Status};
use crate::tensor::{DType, TensorValue};

/// Abstraction over argument/return-value slots. Executors read feeds
/// through `get_arg` and write fetches through `set_retval`.
pub trait CallFrame: Send + Sync {
    fn num_args(&self) -> usize;
    fn num_retvals(&self) -> usize;
    fn get_arg(&self, index: usize) -> Result<TensorValue>;
    fn set_retval(&self, index: usize, value: TensorValue) -> Result<()>;
}

/// Owned-slot call frame used by `Run`: arguments are installed once before
/// dispatch, return values consumed once after the join barrier.
pub struct FunctionCallFrame {
    input_types: Vec<DType>,
    output_types: Vec<DType>,
    args: Vec<TensorValue>,
    retvals: Mutex<Vec<Option<TensorValue>>>,
}

impl FunctionCallFrame {
    pub fn new(input_types: Vec<DType>, output_types: Vec<DType>) -> Self {
        let retvals = (0..output_types.len()).map(|_| None).collect();
        Self {
            input_types,
            output_types,
            args: Vec::new(),
            retvals: Mutex::new(retvals),
        }
    }

    /// Installs the argument vector. Count and type mismatches are internal
    /// errors; the session boundary demotes them to invalid-argument.
    pub fn set_args(&mut self, args: Vec<TensorValue>) -> Result<()> {
        if args.len() != self.input_types.len() {
            return Err(Status::internal(format!(
                "expected {} call-frame arguments, got {}",
                self.input_types.len(),
                args.len()
            )));
        }
        for (index, (arg, expected)) in args.iter().zip(&self.input_types).enumerate() {
            if arg.dtype() != *expected {
                return Err(Status::internal(format!(
                    "call-frame argument {index} has dtype {:?}, expected {:?}",
                    arg.dtype(),
                    expected
                )));
            }
        }
        self.args = args;
        Ok(())
    }

    /// Drains the return-value slots in index order.
    pub fn consume_retvals(&self) -> Result<Vec<TensorValue>> {
        let mut retvals = self.retvals.lock().expect("call frame poisoned");
        let mut outputs = Vec::with_capacity(retvals.len());
        for (index, slot) in retvals.iter_mut().enumerate() {
            match slot.take() {
                Some(value) => outputs.push(value),
                None => {
                    return Err(Status::internal(format!(
                        "return value {index} was never set"
                    )))
                }
            }
        }
        Ok(outputs)
    }

    pub fn output_types(&self) -> &[DType] {
        &self.output_types
    }
}

impl CallFrame for FunctionCallFrame {
    fn num_args(&self) -> usize {
        self.input_types.len()
    }

    fn num_retvals(&self) -> usize {
        self.output_types.len()
    }

    fn get_arg(&self, index: usize) -> Result<TensorValue> {
        self.args.get(index).cloned().ok_or_else(|| {
            Status::internal(format!("call-frame argument index {index} out of bounds"))
        })
    }

    fn set_retval(&self, index: usize, value: TensorValue) -> Result<()> {
        let mut retvals = self.retvals.lock().expect("call frame poisoned");
        match retvals.get_mut(index) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(Status::internal(format!(
                "return value index {index} out of bounds"
            ))),
        }
    }
}
