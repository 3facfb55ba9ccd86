use serde::{Deserialize, Serialize};

use crate::types::EvaluateResponse;

pub type WatchId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchExpression {
    pub id: WatchId,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
    /// Set instead of `value` when the last evaluation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct WatchList {
    next_id: WatchId,
    items: Vec<WatchExpression>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, expression: &str) -> WatchExpression {
        self.next_id += 1;
        let watch = WatchExpression {
            id: self.next_id,
            expression: expression.trim().to_string(),
            value: None,
            type_name: None,
            variables_reference: 0,
            error: None,
        };
        self.items.push(watch.clone());
        watch
    }

    pub fn remove(&mut self, id: WatchId) -> Option<WatchExpression> {
        let index = self.items.iter().position(|w| w.id == id)?;
        Some(self.items.remove(index))
    }

    pub fn get(&self, id: WatchId) -> Option<&WatchExpression> {
        self.items.iter().find(|w| w.id == id)
    }

    pub fn all(&self) -> Vec<WatchExpression> {
        self.items.clone()
    }

    /// Stores an evaluation outcome; a failure clears the previous value.
    pub fn record(
        &mut self,
        id: WatchId,
        outcome: Result<EvaluateResponse, String>,
    ) -> Option<WatchExpression> {
        let watch = self.items.iter_mut().find(|w| w.id == id)?;
        match outcome {
            Ok(response) => {
                watch.value = Some(response.result);
                watch.type_name = response.type_name;
                watch.variables_reference = response.variables_reference;
                watch.error = None;
            }
            Err(message) => {
                watch.value = None;
                watch.type_name = None;
                watch.variables_reference = 0;
                watch.error = Some(message);
            }
        }
        Some(watch.clone())
    }
}
