//! Intra-process rendezvous: key-matched tensor handoff between partitions
//! and, for partial runs, between the client and the executors.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::device::DeviceAttributes;
use crate::status::{Result, Status};
use crate::tensor::TensorValue;

/// A parsed rendezvous key:
/// `"{src_device};{hex(incarnation)};{dst_device};{tensor_name};{frame}:{iter}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub src_device: String,
    pub src_incarnation: u64,
    pub dst_device: String,
    pub tensor_name: String,
    pub frame_id: u64,
    pub iter_id: u64,
    pub full_key: String,
}

pub fn compose_key(
    src: &DeviceAttributes,
    dst_device: &str,
    tensor_name: &str,
    frame_id: u64,
    iter_id: u64,
) -> String {
    format!(
        "{};{:x};{};{};{}:{}",
        src.name, src.incarnation, dst_device, tensor_name, frame_id, iter_id
    )
}

/// Key for a client-side feed or fetch: the client device fills both device
/// slots and the frame is pinned to `(0, 0)`.
pub fn client_key(client: &DeviceAttributes, tensor_name: &str) -> String {
    compose_key(client, &client.name, tensor_name, 0, 0)
}

pub fn parse_key(key: &str) -> Result<ParsedKey> {
    let parts: Vec<&str> = key.split(';').collect();
    if parts.len() != 5 {
        return Err(Status::invalid_argument(format!(
            "invalid rendezvous key: {key}"
        )));
    }
    let src_incarnation = u64::from_str_radix(parts[1], 16).map_err(|_| {
        Status::invalid_argument(format!("invalid incarnation in rendezvous key: {key}"))
    })?;
    let (frame, iter) = parts[4].rsplit_once(':').ok_or_else(|| {
        Status::invalid_argument(format!("invalid frame/iter in rendezvous key: {key}"))
    })?;
    let frame_id = frame.parse::<u64>().map_err(|_| {
        Status::invalid_argument(format!("invalid frame id in rendezvous key: {key}"))
    })?;
    let iter_id = iter.parse::<u64>().map_err(|_| {
        Status::invalid_argument(format!("invalid iter id in rendezvous key: {key}"))
    })?;
    Ok(ParsedKey {
        src_device: parts[0].to_string(),
        src_incarnation,
        dst_device: parts[2].to_string(),
        tensor_name: parts[3].to_string(),
        frame_id,
        iter_id,
        full_key: key.to_string(),
    })
}

#[derive(Debug)]
struct RendezvousState {
    items: HashMap<String, (TensorValue, bool)>,
    aborted: Option<Status>,
}

/// Matches `Send` and `Recv` calls by key. Shared by `Arc` between the run
/// state, the barrier, and the executors; an abort wakes every waiter.
#[derive(Debug)]
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    cv: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                items: HashMap::new(),
                aborted: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// `Send` happens-before the matching `Recv`; each key carries exactly
    /// one tensor per step.
    pub fn send(&self, parsed: &ParsedKey, value: TensorValue, is_dead: bool) -> Result<()> {
        let mut state = self.state.lock().expect("rendezvous poisoned");
        if let Some(status) = &state.aborted {
            return Err(status.clone());
        }
        if state.items.contains_key(&parsed.full_key) {
            return Err(Status::invalid_argument(format!(
                "duplicate send for rendezvous key {}",
                parsed.full_key
            )));
        }
        state.items.insert(parsed.full_key.clone(), (value, is_dead));
        self.cv.notify_all();
        Ok(())
    }

    /// Blocks until the matching send, an abort, or the timeout. `None`
    /// waits indefinitely (an abort still wakes the waiter).
    pub fn recv(
        &self,
        parsed: &ParsedKey,
        timeout: Option<Duration>,
    ) -> Result<(TensorValue, bool)> {
        let deadline = timeout.map(|duration| Instant::now() + duration);
        let mut state = self.state.lock().expect("rendezvous poisoned");
        loop {
            if let Some(item) = state.items.remove(&parsed.full_key) {
                return Ok(item);
            }
            if let Some(status) = &state.aborted {
                return Err(status.clone());
            }
            state = match deadline {
                None => self.cv.wait(state).expect("rendezvous poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Status::deadline_exceeded(format!(
                            "timed out waiting for rendezvous key {}",
                            parsed.full_key
                        )));
                    }
                    let (guard, _) = self
                        .cv
                        .wait_timeout(state, deadline - now)
                        .expect("rendezvous poisoned");
                    guard
                }
            };
        }
    }

    /// Terminal for the current step: pending and future operations fail with
    /// the given status.
    pub fn start_abort(&self, status: Status) {
        let mut state = self.state.lock().expect("rendezvous poisoned");
        if state.aborted.is_none() {
            state.aborted = Some(status);
        }
        self.cv.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state
            .lock()
            .expect("rendezvous poisoned")
            .aborted
            .is_some()
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceLocality;
    use crate::tensor::Tensor;

    fn attrs() -> DeviceAttributes {
        DeviceAttributes {
            name: "/job:localhost/replica:0/task:0/device:CPU:0".to_string(),
            device_type: "CPU".to_string(),
            incarnation: 0x1234_abcd,
            locality: DeviceLocality::default(),
            memory_limit_mb: 0,
        }
    }

    #[test]
    fn key_round_trip_is_bit_exact() {
        let key = client_key(&attrs(), "a:0");
        assert_eq!(
            key,
            "/job:localhost/replica:0/task:0/device:CPU:0;1234abcd;\
             /job:localhost/replica:0/task:0/device:CPU:0;a:0;0:0"
        );
        let parsed = parse_key(&key).unwrap();
        assert_eq!(parsed.tensor_name, "a:0");
        assert_eq!(parsed.src_incarnation, 0x1234_abcd);
        assert_eq!(parsed.frame_id, 0);
        assert_eq!(parsed.iter_id, 0);
        assert_eq!(parsed.full_key, key);
    }

    #[test]
    fn send_then_recv_delivers_value() {
        let rendez = Rendezvous::new();
        let parsed = parse_key(&client_key(&attrs(), "x:0")).unwrap();
        rendez
            .send(&parsed, TensorValue::I32(Tensor::scalar(7)), false)
            .unwrap();
        let (value, is_dead) = rendez.recv(&parsed, None).unwrap();
        assert!(!is_dead);
        assert_eq!(value, TensorValue::I32(Tensor::scalar(7)));
    }

    #[test]
    fn recv_times_out_with_deadline_exceeded() {
        let rendez = Rendezvous::new();
        let parsed = parse_key(&client_key(&attrs(), "x:0")).unwrap();
        let err = rendez
            .recv(&parsed, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::DeadlineExceeded);
    }

    #[test]
    fn abort_wakes_waiters() {
        use std::sync::Arc;
        let rendez = Arc::new(Rendezvous::new());
        let parsed = parse_key(&client_key(&attrs(), "x:0")).unwrap();
        let waiter = {
            let rendez = Arc::clone(&rendez);
            let parsed = parsed.clone();
            std::thread::spawn(move || rendez.recv(&parsed, None))
        };
        std::thread::sleep(Duration::from_millis(20));
        rendez.start_abort(Status::cancelled("step cancelled"));
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Cancelled);
    }

    #[test]
    fn duplicate_send_rejected() {
        let rendez = Rendezvous::new();
        let parsed = parse_key(&client_key(&attrs(), "x:0")).unwrap();
        rendez
            .send(&parsed, TensorValue::I32(Tensor::scalar(1)), false)
            .unwrap();
        let err = rendez
            .send(&parsed, TensorValue::I32(Tensor::scalar(2)), false)
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::InvalidArgument);
    }
}
