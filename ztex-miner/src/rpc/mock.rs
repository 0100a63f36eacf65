//! Scripted job server for tests.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::client::{JobServer, RpcReply};
use super::{EndpointConfig, RpcError};
use crate::codec::WorkItem;

/// A scripted reply to the next getwork fetch.
#[derive(Debug, Clone)]
pub enum Scripted {
    Fail(RpcError),
    Body(String),
}

#[derive(Debug, Default)]
struct State {
    work: Vec<WorkItem>,
    next_work: usize,
    scripted: VecDeque<Scripted>,
    submissions: Vec<(String, String)>,
    fetches: Vec<String>,
    submit_error: Option<String>,
    reject_reason: Option<String>,
    fetch_delay: Duration,
}

/// Hands out work items round-robin and records submissions.
#[derive(Debug, Default)]
pub struct MockJobServer {
    state: Mutex<State>,
}

impl MockJobServer {
    pub fn new(work: Vec<WorkItem>) -> Self {
        Self {
            state: Mutex::new(State {
                work,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue replies consumed by the next fetches, ahead of regular work.
    pub fn script(&self, reply: Scripted) {
        self.state().scripted.push_back(reply);
    }

    /// Make every getwork fetch take at least `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state().fetch_delay = delay;
    }

    pub fn set_submit_error(&self, error: Option<&str>) {
        self.state().submit_error = error.map(str::to_string);
    }

    pub fn set_reject_reason(&self, reason: Option<&str>) {
        self.state().reject_reason = reason.map(str::to_string);
    }

    /// `(endpoint url, submitted data hex)` in submission order.
    pub fn submissions(&self) -> Vec<(String, String)> {
        self.state().submissions.clone()
    }

    /// Endpoint url of every getwork fetch in order.
    pub fn fetches(&self) -> Vec<String> {
        self.state().fetches.clone()
    }

    pub fn work_reply(work: &WorkItem) -> String {
        format!(
            r#"{{"result":{{"data":"{}","midstate":"{}"}},"error":null,"id":1}}"#,
            hex::encode(work.data()),
            hex::encode(work.midstate())
        )
    }
}

impl JobServer for MockJobServer {
    fn call(
        &self,
        endpoint: &EndpointConfig,
        _method: &str,
        params: &[String],
    ) -> Result<RpcReply, RpcError> {
        if params.is_empty() {
            let delay = self.state().fetch_delay;
            thread::sleep(delay);
        }
        let mut state = self.state();
        if let Some(data) = params.first() {
            state.submissions.push((endpoint.url.clone(), data.clone()));
            let error = match &state.submit_error {
                Some(e) => format!("\"{}\"", e),
                None => "null".into(),
            };
            return Ok(RpcReply {
                body: format!(r#"{{"result":true,"error":{},"id":2}}"#, error),
                reject_reason: state.reject_reason.clone(),
            });
        }

        state.fetches.push(endpoint.url.clone());
        match state.scripted.pop_front() {
            Some(Scripted::Fail(e)) => return Err(e),
            Some(Scripted::Body(body)) => {
                return Ok(RpcReply {
                    body,
                    reject_reason: None,
                })
            }
            None => {}
        }
        if state.work.is_empty() {
            return Err(RpcError::Transport("no work configured".into()));
        }
        let idx = state.next_work % state.work.len();
        state.next_work += 1;
        Ok(RpcReply {
            body: Self::work_reply(&state.work[idx]),
            reject_reason: None,
        })
    }
}
