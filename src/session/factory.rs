//! The process-wide session factory: creates sessions over freshly
//! enumerated devices, tracks live sessions for `Reset`, and enforces
//! unique session metadata keys.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::config::SessionOptions;
use crate::device::{factory as device_factory, DeviceMgr, LOCAL_DEVICE_PREFIX};
use crate::session::Session;
use crate::status::{Result, Status, StatusGroup};

pub struct DirectSessionFactory {
    sessions: Mutex<Vec<Arc<Session>>>,
    session_metadata_keys: Mutex<HashSet<String>>,
}

static FACTORY: Lazy<DirectSessionFactory> = Lazy::new(|| DirectSessionFactory {
    sessions: Mutex::new(Vec::new()),
    session_metadata_keys: Mutex::new(HashSet::new()),
});

pub fn global() -> &'static DirectSessionFactory {
    &FACTORY
}

/// Create a new in-process session.
pub fn new_session(options: SessionOptions) -> Result<Arc<Session>> {
    global().new_session(options)
}

impl DirectSessionFactory {
    /// The in-process engine serves only empty targets.
    pub fn accepts_options(&self, options: &SessionOptions) -> bool {
        options.target.is_empty()
    }

    pub(crate) fn claim_metadata_key(&self, options: &SessionOptions) -> Result<()> {
        if let Some(metadata) = &options.config.experimental.session_metadata {
            if metadata.version < 0 {
                return Err(Status::invalid_argument(format!(
                    "session version shouldn't be negative: {}/{}",
                    metadata.name, metadata.version
                )));
            }
            let mut keys = self
                .session_metadata_keys
                .lock()
                .expect("metadata keys poisoned");
            if !keys.insert(metadata.key()) {
                return Err(Status::already_exists(format!(
                    "a session with the same name and version has already been \
                     created: {}/{}",
                    metadata.name, metadata.version
                )));
            }
        }
        Ok(())
    }

    pub fn new_session(&self, options: SessionOptions) -> Result<Arc<Session>> {
        self.claim_metadata_key(&options)?;
        let devices =
            device_factory::add_devices(&options, LOCAL_DEVICE_PREFIX, None, None)?;
        let device_mgr = Arc::new(DeviceMgr::new(devices));
        let session = Session::new(options, device_mgr, Vec::new());
        self.register(&session);
        Ok(session)
    }

    pub(crate) fn register(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().expect("sessions poisoned");
        sessions.push(Arc::clone(session));
    }

    /// Atomically capture and clear the session list, then reset the named
    /// containers on every captured session and close it.
    pub fn reset(&self, containers: &[String]) -> Result<()> {
        let captured = {
            let mut sessions = self.sessions.lock().expect("sessions poisoned");
            // A local copy avoids a deadlock: Close() deregisters, which
            // takes the sessions lock.
            std::mem::take(&mut *sessions)
        };
        let mut status = StatusGroup::default();
        for session in &captured {
            status.update(session.reset(containers));
        }
        for session in &captured {
            status.update(session.close());
        }
        status.take()
    }

    pub(crate) fn deregister(&self, session: &Session) {
        {
            let mut sessions = self.sessions.lock().expect("sessions poisoned");
            sessions.retain(|entry| entry.session_handle() != session.session_handle());
        }
        if let Some(metadata) = &session.options().config.experimental.session_metadata {
            let mut keys = self
                .session_metadata_keys
                .lock()
                .expect("metadata keys poisoned");
            keys.remove(&metadata.key());
        }
    }
}
