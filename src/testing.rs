//! Test helpers shared by unit tests

use crate::domain::ports::{ControlPlaneClient, Params, RemoteError, ResourceId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

type Reply = std::result::Result<Value, RemoteError>;

/// Client replaying scripted replies per action; the last reply repeats.
/// Unscripted actions answer `{}`.
#[derive(Default)]
pub struct ScriptedClient {
    label: String,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Params)>>,
}

impl ScriptedClient {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn reply(self, action: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn ok(self, action: &str, value: Value) -> Self {
        self.reply(action, Ok(value))
    }

    pub fn err(self, action: &str, code: &str) -> Self {
        self.reply(action, Err(RemoteError::new(code, "scripted")))
    }

    pub fn calls(&self) -> Vec<(String, Params)> {
        self.calls.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls.lock().iter().filter(|(a, _)| a == action).count()
    }
}

#[async_trait]
impl ControlPlaneClient for ScriptedClient {
    async fn invoke(&self, action: &str, params: &Params) -> Reply {
        self.calls.lock().push((action.to_string(), params.clone()));
        let mut replies = self.replies.lock();
        match replies.get_mut(action) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Ok(Value::Object(Default::default()))),
            None => Ok(Value::Object(Default::default())),
        }
    }

    async fn describe(&self, resource_id: &ResourceId) -> Reply {
        let mut params = Params::new();
        params.insert("id".into(), Value::String(resource_id.to_string()));
        self.invoke("Describe", &params).await
    }

    fn label(&self) -> &str {
        &self.label
    }
}
