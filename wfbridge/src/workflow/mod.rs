//! Workflow side of the bridge.
//!
//! The engine asks the [`WorkflowBridge`] for one [`WorkflowProcess`] per
//! workflow run. Each process drives the run inside the single-slot
//! workflow pool by trading batches of messages at every workflow task.

mod process;

use std::sync::Arc;

use crate::bridge::codec::Codec;
use crate::bridge::sequence::SequenceCounter;
use crate::engine::{WorkflowDefinition, WorkflowDefinitionFactory};
use crate::generation::GenerationCell;

pub use process::WorkflowProcess;

#[derive(Clone)]
pub struct WorkflowBridge {
    codec: Arc<Codec>,
    generations: Arc<GenerationCell>,
    sequence: Arc<SequenceCounter>,
}

impl WorkflowBridge {
    pub fn new(
        codec: Arc<Codec>,
        generations: Arc<GenerationCell>,
        sequence: Arc<SequenceCounter>,
    ) -> Self {
        Self {
            codec,
            generations,
            sequence,
        }
    }
}

impl WorkflowDefinitionFactory for WorkflowBridge {
    fn new_definition(&self) -> Box<dyn WorkflowDefinition> {
        Box::new(WorkflowProcess::new(
            Arc::clone(&self.codec),
            Arc::clone(&self.generations),
            Arc::clone(&self.sequence),
        ))
    }
}
