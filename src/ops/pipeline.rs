//! Sample pipelines
//!
//! A [`SamplePipeline`] rewrites raw script samples into the shape one
//! consumer asked for: reordering attributes, injecting constants and
//! stamping a timestamp. Pipelines are built once per task and applied to
//! every delivered sample, so the per-sample work is a flat list of slot
//! moves.

use crate::error::{Result, RuntimeError};
use crate::types::{Attribute, AttributeType, Sample, Value};
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug)]
enum Action {
    Copy { from: usize, to: usize },
    Static { to: usize, value: Value },
    Timestamp { to: usize },
}

/// Compiled per-task sample rewrite
#[derive(Debug)]
pub struct SamplePipeline {
    output: Arc<Vec<Attribute>>,
    actions: Vec<Action>,
}

impl SamplePipeline {
    /// A pipeline that passes samples through unchanged
    pub fn identity(attributes: Arc<Vec<Attribute>>) -> Self {
        let actions = (0..attributes.len())
            .map(|i| Action::Copy { from: i, to: i })
            .collect();
        Self {
            output: attributes,
            actions,
        }
    }

    /// Attributes of the produced samples, in slot order
    pub fn attributes(&self) -> &[Attribute] {
        &self.output
    }

    pub(crate) fn attributes_arc(&self) -> &Arc<Vec<Attribute>> {
        &self.output
    }

    /// Rewrite one sample
    pub fn process(&self, source: &Sample) -> Sample {
        let mut values = vec![Value::Null; self.output.len()];
        for action in &self.actions {
            match action {
                Action::Copy { from, to } => {
                    values[*to] = source.value(*from).cloned().unwrap_or(Value::Null);
                }
                Action::Static { to, value } => values[*to] = value.clone(),
                Action::Timestamp { to } => values[*to] = Value::Timestamp(Utc::now()),
            }
        }
        Sample::new(self.output.clone(), values)
    }
}

/// Builder for [`SamplePipeline`]
///
/// Starts from the attribute order of the producing script and layers on
/// injected values; [`build`](Self::build) appends injections after the
/// source attributes, [`build_reordered`](Self::build_reordered) produces an
/// arbitrary output order.
pub struct SamplePipelineBuilder {
    source: Vec<Attribute>,
    statics: Vec<(Attribute, Value)>,
    timestamp: Option<Attribute>,
}

impl SamplePipelineBuilder {
    pub fn new(source: &[Attribute]) -> Self {
        Self {
            source: source.to_vec(),
            statics: Vec::new(),
            timestamp: None,
        }
    }

    /// Inject a constant value under `attribute`
    pub fn add_static(mut self, attribute: Attribute, value: Value) -> Self {
        self.statics.push((attribute, value));
        self
    }

    /// Inject the delivery time under `attribute`
    pub fn add_timestamp(mut self, id: impl Into<String>) -> Self {
        self.timestamp = Some(Attribute::new(id, AttributeType::Timestamp));
        self
    }

    /// Build with source attributes first, injections appended
    pub fn build(self) -> SamplePipeline {
        let mut output = self.source.clone();
        output.extend(self.statics.iter().map(|(a, _)| a.clone()));
        if let Some(ts) = &self.timestamp {
            output.push(ts.clone());
        }
        // Everything is covered by construction.
        self.build_reordered(&output)
            .expect("default pipeline layout always covers its outputs")
    }

    /// Build with an explicit output order.
    ///
    /// Every output attribute must be sourced: from the script's sample, a
    /// static injection, or the timestamp.
    pub fn build_reordered(self, output: &[Attribute]) -> Result<SamplePipeline> {
        let mut actions = Vec::with_capacity(output.len());
        for (to, attribute) in output.iter().enumerate() {
            if let Some(from) = self.source.iter().position(|a| a == attribute) {
                actions.push(Action::Copy { from, to });
            } else if let Some((_, value)) =
                self.statics.iter().find(|(a, _)| a == attribute)
            {
                actions.push(Action::Static {
                    to,
                    value: value.clone(),
                });
            } else if self.timestamp.as_ref() == Some(attribute) {
                actions.push(Action::Timestamp { to });
            } else {
                return Err(RuntimeError::UnmappedAttribute(attribute.id.clone()));
            }
        }
        Ok(SamplePipeline {
            output: Arc::new(output.to_vec()),
            actions,
        })
    }
}
