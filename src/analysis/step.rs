//! Analysis steps and the per-machine analysis contract.

use crate::config::{AnalysisSettings, BudgetConfig};
use crate::error::AppResult;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Priorities handled by a pending-modification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PriorityFilter {
    /// Normal priority only (fast path)
    Normal,
    /// Normal and low priorities
    NormalAndLow,
    /// Every priority
    All,
}

/// An analysis action of the per-machine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AnalysisStep {
    /// Apply the machine state templates
    MachineStateTemplate,
    /// Split the operation slots
    OperationSlotSplit,
    /// Production analysis
    Production,
    /// Activity analysis
    Activity,
    /// Process the reason slots, over `recent` only when set
    ProcessingReasonSlots {
        /// Restrict the pass to this recent window
        recent: Option<Duration>,
    },
    /// Detection analysis
    Detection,
    /// Auto-sequence analysis
    AutoSequence,
    /// Process the pending modifications
    PendingModifications(PriorityFilter),
    /// Remove the modifications flagged for deletion
    CleanFlaggedModifications,
}

impl AnalysisStep {
    /// Stable name, for logs and the status handle.
    pub fn name(&self) -> &'static str {
        match self {
            AnalysisStep::MachineStateTemplate => "MachineStateTemplate",
            AnalysisStep::OperationSlotSplit => "OperationSlotSplit",
            AnalysisStep::Production => "Production",
            AnalysisStep::Activity => "Activity",
            AnalysisStep::ProcessingReasonSlots { recent: None } => "ProcessingReasonSlots",
            AnalysisStep::ProcessingReasonSlots { recent: Some(_) } => "ProcessingReasonSlotsRecent",
            AnalysisStep::Detection => "Detection",
            AnalysisStep::AutoSequence => "AutoSequence",
            AnalysisStep::PendingModifications(PriorityFilter::Normal) => "PendingModificationsNormal",
            AnalysisStep::PendingModifications(PriorityFilter::NormalAndLow) => "PendingModificationsLow",
            AnalysisStep::PendingModifications(PriorityFilter::All) => "PendingModificationsAll",
            AnalysisStep::CleanFlaggedModifications => "CleanFlaggedModifications",
        }
    }

    /// Budget of the step in steady state.
    pub fn budget(&self, settings: &AnalysisSettings) -> StepBudget {
        let budgets = &settings.budgets;
        let config = match self {
            AnalysisStep::ProcessingReasonSlots { .. } => budgets.processing_reason_slots,
            AnalysisStep::Detection => budgets.detection,
            AnalysisStep::AutoSequence => budgets.auto_sequence,
            AnalysisStep::MachineStateTemplate => budgets.machine_state_template,
            _ => budgets.default,
        };
        StepBudget::from(config)
    }
}

impl fmt::Display for AnalysisStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Go on with the success continuation
    Continue,
    /// Stop the current iteration
    End,
    /// The step used its whole budget and stopped early
    ExceededBudget,
}

/// Time a step may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    /// The step is interrupted after this time
    pub max_time: Duration,
    /// The step may run at least this long before yielding
    pub min_time: Duration,
    /// Whether the step may reach back over the whole history (catch-up)
    pub unlimited_reach: bool,
}

impl StepBudget {
    /// Catch-up budget: no history limit.
    pub fn catch_up(settings: &AnalysisSettings) -> Self {
        Self {
            max_time: settings.catch_up_max_time,
            min_time: settings.catch_up_max_time,
            unlimited_reach: true,
        }
    }
}

impl From<BudgetConfig> for StepBudget {
    fn from(config: BudgetConfig) -> Self {
        Self {
            max_time: config.max_time,
            min_time: config.min_time,
            unlimited_reach: false,
        }
    }
}

/// The analysis work of one machine.
///
/// Implemented by the analysis collaborator. Every step must honor `cancel` at
/// its suspension points.
#[async_trait]
pub trait MachineAnalysis: Send + Sync {
    /// Machine analysed.
    fn machine_id(&self) -> u32;

    /// Prepare the context, resuming after the last processed modification.
    async fn initialize(&mut self, _resume_after: Option<u64>) -> AppResult<()> {
        Ok(())
    }

    /// Whether the machine is producing right now.
    fn is_producing(&self) -> bool;

    /// Whether flagged modifications wait to be cleaned.
    fn is_clean_flagged_modifications_required(&self) -> bool {
        false
    }

    /// Whether work is left after an iteration; the loop idles otherwise.
    fn has_pending_work(&self) -> bool {
        false
    }

    /// Last processed modification, persisted as the progress marker.
    fn last_modification_id(&self) -> Option<u64> {
        None
    }

    /// Run one step within `budget`.
    async fn run_step(
        &mut self,
        step: AnalysisStep,
        budget: &StepBudget,
        cancel: &CancellationToken,
    ) -> AppResult<StepOutcome>;
}

/// Additional step injected by an extension, run inside the multi-step node.
#[async_trait]
pub trait ExtensionStep: Send + Sync {
    /// Extension name.
    fn name(&self) -> &str;

    /// Run for `machine_id` within `budget`.
    async fn run(
        &self,
        machine_id: u32,
        budget: &StepBudget,
        cancel: &CancellationToken,
    ) -> AppResult<StepOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budgets_follow_settings() {
        let settings = AnalysisSettings::default();
        assert_eq!(
            AnalysisStep::Detection.budget(&settings).max_time,
            Duration::from_secs(40)
        );
        assert_eq!(
            AnalysisStep::Production.budget(&settings).max_time,
            Duration::from_secs(30)
        );
        let catch_up = StepBudget::catch_up(&settings);
        assert!(catch_up.unlimited_reach);
        assert_eq!(catch_up.max_time, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_step_names() {
        assert_eq!(
            AnalysisStep::PendingModifications(PriorityFilter::All).to_string(),
            "PendingModificationsAll"
        );
        assert_eq!(
            AnalysisStep::ProcessingReasonSlots {
                recent: Some(Duration::from_secs(60))
            }
            .name(),
            "ProcessingReasonSlotsRecent"
        );
    }
}
