//! Arena of analysis nodes, built once per machine and traversed by index.
//!
//! ```text
//! CatchUpSwitch --yes--> catch-up chain --> DeleteMarker --> End
//!       |
//!       no
//!       v
//! ProductionSwitch --yes--> producing chain --> End
//!       |
//!       no--> not-producing chain --> End
//! ```

use super::step::{AnalysisStep, PriorityFilter, StepBudget};
use crate::config::AnalysisSettings;
use std::time::{Duration, Instant};

/// Index of a node in the arena.
pub type NodeId = usize;

/// State-only predicate of a branch node, evaluated on every visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// A catch-up is pending for the machine
    CatchUp,
    /// The machine is producing
    Producing,
    /// Flagged modifications wait to be cleaned
    CleanFlaggedModificationsRequired,
}

/// Node of the analysis graph.
#[derive(Debug, Clone)]
pub enum Node {
    /// Run an analysis step
    Step {
        /// Step to run
        step: AnalysisStep,
        /// Budget of the step
        budget: StepBudget,
        /// Next node on `Continue`
        on_success: NodeId,
        /// Next node on error; an error is fatal without it
        on_failure: Option<NodeId>,
        /// Next node on `ExceededBudget` (success continuation when unset)
        on_exceeded: Option<NodeId>,
    },
    /// Choose between two nodes
    Branch {
        /// Branch name
        name: &'static str,
        /// Predicate
        predicate: Predicate,
        /// Next node when the predicate holds
        then: NodeId,
        /// Next node otherwise
        otherwise: NodeId,
    },
    /// Take `rare` once per `period`, `otherwise` in between
    Frequency {
        /// Branch name
        name: &'static str,
        /// Period of the rare edge
        period: Duration,
        /// When the rare edge was last taken
        last_taken: Option<Instant>,
        /// Rare edge
        rare: NodeId,
        /// Common edge
        otherwise: NodeId,
    },
    /// Run the extension steps in order
    Multi {
        /// Budget given to each extension step
        budget: StepBudget,
        /// Next node
        next: NodeId,
        /// Next node when an extension exceeded its budget
        on_exceeded: NodeId,
    },
    /// Remove the catch-up marker of the machine
    DeleteMarker {
        /// Next node
        next: NodeId,
    },
    /// End of the iteration
    End,
}

impl Node {
    /// Node name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Node::Step { step, .. } => step.name(),
            Node::Branch { name, .. } | Node::Frequency { name, .. } => *name,
            Node::Multi { .. } => "Extensions",
            Node::DeleteMarker { .. } => "DeleteCatchUpMarker",
            Node::End => "End",
        }
    }
}

/// The analysis graph of one machine.
#[derive(Debug, Clone)]
pub struct AnalysisGraph {
    nodes: Vec<Node>,
    entry: NodeId,
}

struct Builder<'a> {
    settings: &'a AnalysisSettings,
    nodes: Vec<Node>,
}

impl Builder<'_> {
    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn step(
        &mut self,
        step: AnalysisStep,
        next: NodeId,
        on_failure: Option<NodeId>,
        on_exceeded: Option<NodeId>,
    ) -> NodeId {
        let budget = step.budget(self.settings);
        self.push(Node::Step {
            step,
            budget,
            on_success: next,
            on_failure,
            on_exceeded,
        })
    }

    fn catch_up_step(&mut self, step: AnalysisStep, next: NodeId, on_exceeded: NodeId) -> NodeId {
        let budget = StepBudget::catch_up(self.settings);
        self.push(Node::Step {
            step,
            budget,
            on_success: next,
            on_failure: None,
            on_exceeded: Some(on_exceeded),
        })
    }

    fn multi(&mut self, next: NodeId, on_exceeded: NodeId) -> NodeId {
        let budget = StepBudget::from(self.settings.budgets.default);
        self.push(Node::Multi {
            budget,
            next,
            on_exceeded,
        })
    }

    /// Clean the flagged modifications when required, then end.
    fn clean_flagged(&mut self, end: NodeId) -> NodeId {
        let clean = self.step(AnalysisStep::CleanFlaggedModifications, end, None, Some(end));
        self.push(Node::Branch {
            name: "CleanFlaggedModificationsRequired",
            predicate: Predicate::CleanFlaggedModificationsRequired,
            then: clean,
            otherwise: end,
        })
    }

    /// Three-way pending-modification pass: all priorities every
    /// `very_low_frequency`, normal+low every `low_frequency`, normal otherwise.
    fn pending_modifications(&mut self, next: NodeId, on_exceeded: NodeId) -> (NodeId, NodeId) {
        let all = self.step(
            AnalysisStep::PendingModifications(PriorityFilter::All),
            next,
            None,
            Some(on_exceeded),
        );
        let low = self.step(
            AnalysisStep::PendingModifications(PriorityFilter::NormalAndLow),
            next,
            None,
            Some(on_exceeded),
        );
        let normal = self.step(
            AnalysisStep::PendingModifications(PriorityFilter::Normal),
            next,
            None,
            Some(on_exceeded),
        );
        let low_or_normal = self.push(Node::Frequency {
            name: "PendingModificationsLowSwitch",
            period: self.settings.low_frequency,
            last_taken: None,
            rare: low,
            otherwise: normal,
        });
        let entry = self.push(Node::Frequency {
            name: "PendingModificationsAllSwitch",
            period: self.settings.very_low_frequency,
            last_taken: None,
            rare: all,
            otherwise: low_or_normal,
        });
        (entry, normal)
    }

    fn producing(&mut self, end: NodeId) -> NodeId {
        let next = self.clean_flagged(end);
        let next = self.step(
            AnalysisStep::ProcessingReasonSlots { recent: None },
            next,
            None,
            Some(end),
        );
        let (pending, normal_pending) = self.pending_modifications(next, end);
        let next = self.multi(pending, normal_pending);
        let next = self.step(AnalysisStep::AutoSequence, next, None, None);
        let next = self.step(AnalysisStep::Detection, next, None, None);
        let recent = Some(self.settings.reason_slots_recent_window);
        let next = self.step(AnalysisStep::ProcessingReasonSlots { recent }, next, None, None);
        let next = self.step(AnalysisStep::Activity, next, None, None);
        let next = self.step(AnalysisStep::Production, next, None, None);
        let next = self.step(AnalysisStep::OperationSlotSplit, next, None, None);
        self.step(AnalysisStep::MachineStateTemplate, next, None, None)
    }

    fn not_producing(&mut self, end: NodeId) -> NodeId {
        let next = self.clean_flagged(end);
        let next = self.step(
            AnalysisStep::ProcessingReasonSlots { recent: None },
            next,
            None,
            Some(end),
        );
        let (pending, normal_pending) = self.pending_modifications(next, end);
        let next = self.multi(pending, normal_pending);
        let next = self.step(AnalysisStep::AutoSequence, next, None, Some(end));
        let next = self.step(AnalysisStep::Detection, next, None, None);
        let reason_slots_only = self.step(
            AnalysisStep::ProcessingReasonSlots { recent: None },
            end,
            Some(end),
            Some(end),
        );
        self.step(AnalysisStep::Activity, next, Some(reason_slots_only), None)
    }

    fn catch_up(&mut self, end: NodeId) -> NodeId {
        let next = self.push(Node::DeleteMarker { next: end });
        let next = self.catch_up_step(AnalysisStep::MachineStateTemplate, next, next);
        let next = self.catch_up_step(AnalysisStep::OperationSlotSplit, next, next);
        let next = self.catch_up_step(AnalysisStep::Production, next, next);
        let next = self.catch_up_step(
            AnalysisStep::PendingModifications(PriorityFilter::All),
            next,
            next,
        );
        let next = {
            let budget = StepBudget::catch_up(self.settings);
            self.push(Node::Multi {
                budget,
                next,
                on_exceeded: next,
            })
        };
        let next = self.catch_up_step(AnalysisStep::Activity, next, next);
        let next =
            self.catch_up_step(AnalysisStep::ProcessingReasonSlots { recent: None }, next, next);
        let next = self.catch_up_step(AnalysisStep::Detection, next, next);
        let next = self.catch_up_step(AnalysisStep::AutoSequence, next, end);
        self.catch_up_step(AnalysisStep::CleanFlaggedModifications, next, next)
    }
}

impl AnalysisGraph {
    /// Build the three entry graphs and their switches.
    pub fn build(settings: &AnalysisSettings) -> Self {
        let mut builder = Builder {
            settings,
            nodes: Vec::new(),
        };
        let end = builder.push(Node::End);
        let producing = builder.producing(end);
        let not_producing = builder.not_producing(end);
        let production_switch = builder.push(Node::Branch {
            name: "ProductionSwitch",
            predicate: Predicate::Producing,
            then: producing,
            otherwise: not_producing,
        });
        let catch_up = builder.catch_up(end);
        let entry = builder.push(Node::Branch {
            name: "CatchUpSwitch",
            predicate: Predicate::CatchUp,
            then: catch_up,
            otherwise: production_switch,
        });
        Self {
            nodes: builder.nodes,
            entry,
        }
    }

    /// First node of every iteration.
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Take the edge of a frequency node at `now`, recording it when rare.
    pub fn take_frequency(&mut self, id: NodeId, now: Instant) -> Option<NodeId> {
        match self.nodes.get_mut(id) {
            Some(Node::Frequency {
                period,
                last_taken,
                rare,
                otherwise,
                ..
            }) => {
                let due = last_taken.map_or(true, |at| now.duration_since(at) >= *period);
                if due {
                    *last_taken = Some(now);
                    Some(*rare)
                } else {
                    Some(*otherwise)
                }
            }
            _ => None,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no node.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Step sequence of a path where every branch answers `answer` and
    /// frequency nodes take their common edge.
    fn walk(graph: &AnalysisGraph, answer: impl Fn(Predicate) -> bool) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut id = graph.entry();
        while let Some(node) = graph.node(id) {
            id = match node {
                Node::Step { step, on_success, .. } => {
                    names.push(step.name());
                    *on_success
                }
                Node::Branch {
                    predicate,
                    then,
                    otherwise,
                    ..
                } => {
                    if answer(*predicate) {
                        *then
                    } else {
                        *otherwise
                    }
                }
                Node::Frequency { otherwise, .. } => *otherwise,
                Node::Multi { next, .. } => {
                    names.push("Extensions");
                    *next
                }
                Node::DeleteMarker { next } => {
                    names.push("DeleteCatchUpMarker");
                    *next
                }
                Node::End => break,
            };
        }
        names
    }

    #[test]
    fn test_producing_order() {
        let graph = AnalysisGraph::build(&AnalysisSettings::default());
        let names = walk(&graph, |p| p == Predicate::Producing);
        assert_eq!(
            names,
            vec![
                "MachineStateTemplate",
                "OperationSlotSplit",
                "Production",
                "Activity",
                "ProcessingReasonSlotsRecent",
                "Detection",
                "AutoSequence",
                "Extensions",
                "PendingModificationsNormal",
                "ProcessingReasonSlots",
            ]
        );
    }

    #[test]
    fn test_not_producing_order_with_cleanup() {
        let graph = AnalysisGraph::build(&AnalysisSettings::default());
        let names = walk(&graph, |p| p == Predicate::CleanFlaggedModificationsRequired);
        assert_eq!(
            names,
            vec![
                "Activity",
                "Detection",
                "AutoSequence",
                "Extensions",
                "PendingModificationsNormal",
                "ProcessingReasonSlots",
                "CleanFlaggedModifications",
            ]
        );
    }

    #[test]
    fn test_catch_up_order() {
        let graph = AnalysisGraph::build(&AnalysisSettings::default());
        let names = walk(&graph, |p| p == Predicate::CatchUp);
        assert_eq!(
            names,
            vec![
                "CleanFlaggedModifications",
                "AutoSequence",
                "Detection",
                "ProcessingReasonSlots",
                "Activity",
                "Extensions",
                "PendingModificationsAll",
                "Production",
                "OperationSlotSplit",
                "MachineStateTemplate",
                "DeleteCatchUpMarker",
            ]
        );
    }

    #[test]
    fn test_frequency_takes_rare_edge_once_per_period() {
        let settings = AnalysisSettings {
            very_low_frequency: Duration::from_secs(600),
            ..Default::default()
        };
        let mut graph = AnalysisGraph::build(&settings);
        let id = (0..graph.len())
            .find(|id| {
                matches!(
                    graph.node(*id),
                    Some(Node::Frequency { name: "PendingModificationsAllSwitch", .. })
                )
            })
            .unwrap();
        let (rare, otherwise) = match graph.node(id) {
            Some(Node::Frequency { rare, otherwise, .. }) => (*rare, *otherwise),
            _ => unreachable!(),
        };

        let t0 = Instant::now();
        assert_eq!(graph.take_frequency(id, t0), Some(rare));
        assert_eq!(graph.take_frequency(id, t0 + Duration::from_secs(1)), Some(otherwise));
        assert_eq!(graph.take_frequency(id, t0 + Duration::from_secs(600)), Some(rare));
    }
}
