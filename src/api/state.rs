use std::sync::Arc;

use crate::detect::DecisionEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
}

impl AppState {
    pub fn new(engine: DecisionEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}
