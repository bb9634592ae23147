//! Scriptable XA resources and a shared event log.
//!
//! Every call a [`MockXaResource`] receives is appended to an [`EventLog`] as
//! `"<call> <unique name>"` (`"commit-1pc db"` for one-phase commits), so a
//! test can assert the global order of resource calls and journal forces.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xatm_core::{Vote, XaError, XaFlag, XaResource, XaResult, Xid};

/// An ordered, shareable list of events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    /// Copy of every event.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Events starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Index of the first event starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|event| event.starts_with(prefix))
    }

    /// Forgets every event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// XA calls a [`MockXaResource`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaCall {
    /// `start`
    Start,
    /// `end`
    End,
    /// `prepare`
    Prepare,
    /// `commit`
    Commit,
    /// `rollback`
    Rollback,
}

/// An in-memory XA resource whose answers are scripted.
#[derive(Debug, Clone)]
pub struct MockXaResource {
    unique_name: String,
    events: EventLog,
    failures: HashMap<XaCall, i32>,
    read_only: bool,
    commit_delay: Option<Duration>,
}

impl MockXaResource {
    /// A resource that succeeds at everything.
    pub fn new(unique_name: &str, events: EventLog) -> Self {
        Self {
            unique_name: unique_name.to_string(),
            events,
            failures: HashMap::new(),
            read_only: false,
            commit_delay: None,
        }
    }

    /// Makes `call` fail with XA code `code`.
    #[must_use]
    pub fn failing(mut self, call: XaCall, code: i32) -> Self {
        self.failures.insert(call, code);
        self
    }

    /// Votes read-only on prepare.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Sleeps before answering commit.
    #[must_use]
    pub fn commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Wraps the resource for enlistment.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn answer(&self, call: XaCall, label: &str) -> XaResult<()> {
        self.events.push(format!("{label} {}", self.unique_name));
        match self.failures.get(&call) {
            Some(&code) => Err(XaError::new(code, format!("scripted {label} failure"))),
            None => Ok(()),
        }
    }
}

impl XaResource for MockXaResource {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn start(&self, _xid: &Xid, flag: XaFlag) -> XaResult<()> {
        let label = match flag {
            XaFlag::Join => "join",
            XaFlag::Resume => "resume",
            _ => "start",
        };
        self.answer(XaCall::Start, label)
    }

    fn end(&self, _xid: &Xid, flag: XaFlag) -> XaResult<()> {
        let label = match flag {
            XaFlag::Suspend => "suspend",
            XaFlag::Fail => "end-fail",
            _ => "end",
        };
        self.answer(XaCall::End, label)
    }

    fn prepare(&self, _xid: &Xid) -> XaResult<Vote> {
        self.answer(XaCall::Prepare, "prepare")?;
        Ok(if self.read_only {
            Vote::ReadOnly
        } else {
            Vote::Commit
        })
    }

    fn commit(&self, _xid: &Xid, one_phase: bool) -> XaResult<()> {
        if let Some(delay) = self.commit_delay {
            thread::sleep(delay);
        }
        self.answer(XaCall::Commit, if one_phase { "commit-1pc" } else { "commit" })
    }

    fn rollback(&self, _xid: &Xid) -> XaResult<()> {
        self.answer(XaCall::Rollback, "rollback")
    }

    fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool> {
        self.events.push(format!("timeout {} {seconds}", self.unique_name));
        Ok(true)
    }
}
