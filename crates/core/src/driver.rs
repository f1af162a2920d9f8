//! Step loop: per-checkpoint sampling and scheduled interventions.
//!
//! The loop owns nothing global: the intervention schedule comes in as a
//! parameter and the intervention timestamp goes out in the result.

use crate::{
    codec::Value,
    controller::{SimulationController, StepOutcome},
    error::{Result, SerializationError},
};

/// One `do` command scheduled at a fixed step index, issued after that
/// step's samples are taken and before the step itself.
#[derive(Debug, Clone)]
pub struct Intervention {
    pub at_step: usize,
    pub action: String,
    pub params: Vec<Value>,
}

/// Samples taken at one checkpoint. The timestamp is the clock path's value
/// in unix epoch seconds; `values` holds the configured paths in query order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: i64,
    pub values: Vec<(String, Value)>,
}

/// Everything a completed run produced. Owned by the caller; the controller
/// retains none of it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub samples: Vec<Sample>,
    /// Clock value at the intervention step, if one was scheduled and the
    /// run lasted long enough to reach it.
    pub intervention_ts: Option<i64>,
}

/// Drives a controller already in `Running` until the engine reports
/// completion, collecting one [`Sample`] per step.
#[derive(Debug, Clone)]
pub struct StepLoop {
    clock_path: String,
    sample_paths: Vec<String>,
    intervention: Option<Intervention>,
}

impl StepLoop {
    pub fn new(clock_path: impl Into<String>, sample_paths: Vec<String>) -> Self {
        StepLoop {
            clock_path: clock_path.into(),
            sample_paths,
            intervention: None,
        }
    }

    pub fn with_intervention(mut self, intervention: Intervention) -> Self {
        self.intervention = Some(intervention);
        self
    }

    /// Runs to completion. Per iteration: query the clock, query each
    /// sample path in order, apply the scheduled intervention if this is its
    /// step, then `step()`; stop when the engine reports `Done`.
    pub fn run(&self, controller: &mut SimulationController) -> Result<LoopOutcome> {
        let mut samples = Vec::new();
        let mut intervention_ts = None;
        for step in 0_usize.. {
            let clock = controller.get_value(&self.clock_path)?;
            let timestamp = clock
                .as_i64()
                .ok_or_else(|| SerializationError::Clock(format!("{clock:?}")))?;
            let mut values = Vec::with_capacity(self.sample_paths.len());
            for path in &self.sample_paths {
                values.push((path.clone(), controller.get_value(path)?));
            }
            samples.push(Sample { timestamp, values });

            if let Some(iv) = self.intervention.as_ref().filter(|iv| iv.at_step == step) {
                tracing::info!(step, action = %iv.action, "applying scheduled intervention");
                controller.do_action(&iv.action, &iv.params)?;
                intervention_ts = Some(timestamp);
            }

            if controller.step()? == StepOutcome::Done {
                break;
            }
        }
        tracing::info!(steps = samples.len(), "step loop complete");
        Ok(LoopOutcome {
            samples,
            intervention_ts,
        })
    }
}
