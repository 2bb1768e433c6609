use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use crate::brain::StepDecider;
use crate::dom;
use crate::error::Result;
use crate::events::ProgressSink;
use crate::page::{self, LoadState, PageDriver};
use crate::types::{
    AgentAction, AgentDecision, DEFAULT_MAX_STEPS, HISTORY_WINDOW, HistoryEntry, MAX_INTERACTIVE_NODES,
    NavigationGoal, SemanticNode,
};

/// Knobs for one navigation loop.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub max_nodes: usize,
    pub click_settle: Duration,
    pub type_settle: Duration,
    pub wait_settle: Duration,
    pub load_timeout: Duration,
    pub keystroke_delay: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_nodes: MAX_INTERACTIVE_NODES,
            click_settle: Duration::from_secs(2),
            type_settle: Duration::from_millis(1500),
            wait_settle: Duration::from_secs(3),
            load_timeout: Duration::from_secs(5),
            keystroke_delay: Duration::from_millis(100),
        }
    }
}

impl AgentSettings {
    /// No settle delays; for tests and dry runs.
    pub fn instant() -> Self {
        Self {
            click_settle: Duration::ZERO,
            type_settle: Duration::ZERO,
            wait_settle: Duration::ZERO,
            load_timeout: Duration::ZERO,
            keystroke_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    /// The backend reported the objective as reached.
    pub verified: bool,
    pub steps: usize,
}

/// Snapshot, decide, execute, repeat, until the backend is satisfied or the
/// step budget runs out.
pub struct NavigationAgent<'a> {
    decider: &'a dyn StepDecider,
    settings: &'a AgentSettings,
}

impl<'a> NavigationAgent<'a> {
    pub fn new(decider: &'a dyn StepDecider, settings: &'a AgentSettings) -> Self {
        Self { decider, settings }
    }

    pub async fn run(&self, page: &dyn PageDriver, objective: &str, sink: &ProgressSink) -> LoopOutcome {
        let max = self.settings.max_steps;
        let mut history: VecDeque<HistoryEntry> = VecDeque::with_capacity(HISTORY_WINDOW);

        for step in 1..=max {
            sink.info(format!(
                "Agent ({}) analysing step {step}/{max}...",
                self.decider.label()
            ));

            let nodes = match self.snapshot(page).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    sink.error(format!("Could not read page state: {e}"));
                    continue;
                }
            };

            let goal = NavigationGoal {
                objective: objective.to_string(),
                history_tail: history.iter().cloned().collect(),
                current_url: page.current_url().await.unwrap_or_else(|e| {
                    debug!(error = %e, "current url unavailable");
                    String::new()
                }),
            };
            let decision = self.decider.decide(&goal, &nodes).await;

            if !decision.thought.is_empty() {
                sink.info(format!("Agent: {}", decision.thought));
            }

            if decision.is_terminal() {
                sink.info(format!("Objective verified by agent: {objective}"));
                return LoopOutcome {
                    verified: true,
                    steps: step,
                };
            }

            let Some(action) = decision.action else {
                sink.warning("No usable decision from the agent, re-evaluating.");
                continue;
            };

            let target = target_text(&decision, &nodes);
            if history.len() == HISTORY_WINDOW {
                history.pop_front();
            }
            history.push_back(HistoryEntry {
                step,
                action,
                target: target.clone(),
            });

            if let Err(e) = self.execute(page, action, target.as_deref(), &decision, sink).await {
                sink.error(format!("Action {action} failed: {e}"));
            }
        }

        sink.warning(format!("Step budget of {max} exhausted without verifying: {objective}"));
        LoopOutcome {
            verified: false,
            steps: max,
        }
    }

    async fn snapshot(&self, page: &dyn PageDriver) -> Result<Vec<SemanticNode>> {
        let tree = page.accessibility_tree().await?;
        let nodes: Vec<SemanticNode> = dom::normalize(&tree).collect();
        let interactive = dom::interactive_subset(&nodes, self.settings.max_nodes);
        debug!(total = nodes.len(), interactive = interactive.len(), "page snapshot");
        Ok(interactive)
    }

    async fn execute(
        &self,
        page: &dyn PageDriver,
        action: AgentAction,
        target: Option<&str>,
        decision: &AgentDecision,
        sink: &ProgressSink,
    ) -> Result<()> {
        match action {
            AgentAction::Click => self.click(page, target, sink).await,
            AgentAction::Type => {
                let value = decision.value.as_deref().unwrap_or_default();
                self.type_value(page, target, value, sink).await
            }
            AgentAction::Wait => {
                sink.info("Agent asked to wait...");
                tokio::time::sleep(self.settings.wait_settle).await;
                Ok(())
            }
            AgentAction::Finalize => Ok(()),
        }
    }

    async fn click(&self, page: &dyn PageDriver, target: Option<&str>, sink: &ProgressSink) -> Result<()> {
        let Some(target) = target else {
            sink.warning("No element text given for click.");
            return Ok(());
        };
        let clean = page::strip_tags(target);
        if clean.is_empty() {
            sink.warning(format!("Could not find '{}': no element text", target.trim()));
            return Ok(());
        }
        sink.info(format!("Agent clicks '{clean}'"));

        let Some((locator, element)) = page::resolve(page, &page::click_chain(&clean)).await? else {
            sink.warning(format!("Could not find '{clean}'"));
            return Ok(());
        };
        debug!(strategy = locator.kind(), element = %element.0, "click target resolved");

        page.click(&element).await?;
        tokio::time::sleep(self.settings.click_settle).await;
        if let Err(e) = page
            .wait_for_load(LoadState::DomContentLoaded, self.settings.load_timeout)
            .await
        {
            debug!(error = %e, "page did not report DOM content loaded");
        }
        Ok(())
    }

    async fn type_value(
        &self,
        page: &dyn PageDriver,
        target: Option<&str>,
        value: &str,
        sink: &ProgressSink,
    ) -> Result<()> {
        let Some(target) = target else {
            sink.warning("No field given to type into.");
            return Ok(());
        };
        let clean = page::strip_tags(target);
        if clean.is_empty() {
            sink.warning(format!("Could not find field '{}': no element text", target.trim()));
            return Ok(());
        }
        sink.info(format!("Agent types '{value}' into '{clean}'"));

        let Some((_, mut element)) = page::resolve(page, &page::type_chain(&clean)).await? else {
            sink.warning(format!("Could not find field '{clean}'"));
            return Ok(());
        };

        if !page.is_editable(&element).await? {
            sink.info("Activating read-only field...");
            page.activate(&element).await?;
            tokio::time::sleep(self.settings.type_settle).await;
            element = match page::resolve(page, &page::editable_chain(&clean)).await? {
                Some((_, editable)) => editable,
                None => {
                    sink.warning(format!("No editable field appeared for '{clean}'"));
                    return Ok(());
                }
            };
        }

        page.type_into(&element, value, self.settings.keystroke_delay).await?;
        tokio::time::sleep(self.settings.type_settle).await;
        Ok(())
    }
}

/// Target text from the decision, falling back to the node it pointed at.
fn target_text(decision: &AgentDecision, nodes: &[SemanticNode]) -> Option<String> {
    decision
        .target_text
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| {
            let id = decision.target_node_id?;
            nodes.iter().find(|n| n.id == id).map(|n| n.text.clone())
        })
}
