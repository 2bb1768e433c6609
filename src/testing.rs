//! In-memory browser and backend doubles shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::brain::StepDecider;
use crate::error::{Result, ScoutError};
use crate::page::{BrowserLauncher, ElementRef, LoadState, Locator, PageDriver};
use crate::types::{AgentAction, AgentDecision, NavigationGoal, SemanticNode};

#[derive(Default)]
pub struct FakePage {
    elements: Mutex<HashMap<String, (Locator, ElementRef)>>,
    editable: Mutex<HashSet<ElementRef>>,
    failing: Mutex<HashSet<ElementRef>>,
    tree: Mutex<Value>,
    content: Mutex<String>,
    url: Mutex<String>,
    pub navigate_fails: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl FakePage {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(json!({ "nodes": [] })),
            url: Mutex::new("https://example.com/".into()),
            ..Default::default()
        }
    }

    fn key(locator: &Locator) -> String {
        format!("{}:{}", locator.kind(), locator.needle())
    }

    pub fn add_element(&self, locator: Locator, id: &str, editable: bool) {
        let element = ElementRef(id.to_string());
        if editable {
            self.editable.lock().unwrap().insert(element.clone());
        }
        self.elements
            .lock()
            .unwrap()
            .insert(Self::key(&locator), (locator, element));
    }

    pub fn fail_clicks_on(&self, id: &str) {
        self.failing.lock().unwrap().insert(ElementRef(id.to_string()));
    }

    pub fn set_tree(&self, tree: Value) {
        *self.tree.lock().unwrap() = tree;
    }

    pub fn set_content(&self, content: &str) {
        *self.content.lock().unwrap() = content.to_string();
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        self.record(format!("navigate:{url}"));
        if *self.navigate_fails.lock().unwrap() {
            return Err(ScoutError::timeout(format!("navigation to {url}"), timeout));
        }
        self.set_url(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn accessibility_tree(&self) -> Result<Value> {
        self.record("snapshot".into());
        Ok(self.tree.lock().unwrap().clone())
    }

    async fn locate(&self, locator: &Locator) -> Result<Option<ElementRef>> {
        Ok(self
            .elements
            .lock()
            .unwrap()
            .get(&Self::key(locator))
            .map(|(_, e)| e.clone()))
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        self.record(format!("click:{}", element.0));
        if self.failing.lock().unwrap().contains(element) {
            return Err(ScoutError::Browser(format!("{} detached", element.0)));
        }
        Ok(())
    }

    async fn activate(&self, element: &ElementRef) -> Result<()> {
        self.record(format!("activate:{}", element.0));
        Ok(())
    }

    async fn is_editable(&self, element: &ElementRef) -> Result<bool> {
        Ok(self.editable.lock().unwrap().contains(element))
    }

    async fn type_into(&self, element: &ElementRef, text: &str, _delay: Duration) -> Result<()> {
        self.record(format!("type:{}:{text}", element.0));
        Ok(())
    }

    async fn scroll_by(&self, dy: i64) -> Result<()> {
        self.record(format!("scroll:{dy}"));
        Ok(())
    }

    async fn wait_for_load(&self, state: LoadState, _timeout: Duration) -> Result<()> {
        self.record(format!("wait:{state:?}"));
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        Ok(self.content.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<()> {
        self.record("close".into());
        Ok(())
    }
}

pub struct FakeLauncher {
    pub page: Arc<FakePage>,
    pub launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(page: Arc<FakePage>) -> Self {
        Self {
            page,
            launches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn PageDriver>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(self.page.clone())
    }
}

/// Replays queued decisions, then keeps answering with `fallback`.
pub struct ScriptedDecider {
    script: Mutex<VecDeque<AgentDecision>>,
    fallback: AgentDecision,
    objectives: Mutex<Vec<String>>,
    node_counts: Mutex<Vec<usize>>,
}

impl ScriptedDecider {
    pub fn new(script: Vec<AgentDecision>, fallback: AgentDecision) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            objectives: Mutex::new(Vec::new()),
            node_counts: Mutex::new(Vec::new()),
        }
    }

    /// Verifies every objective on the first step.
    pub fn always_finalize() -> Self {
        Self::new(vec![], finalize())
    }

    pub fn objectives(&self) -> Vec<String> {
        self.objectives.lock().unwrap().clone()
    }

    pub fn node_counts(&self) -> Vec<usize> {
        self.node_counts.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepDecider for ScriptedDecider {
    fn label(&self) -> String {
        "scripted".into()
    }

    async fn decide(&self, goal: &NavigationGoal, nodes: &[SemanticNode]) -> AgentDecision {
        self.objectives.lock().unwrap().push(goal.objective.clone());
        self.node_counts.lock().unwrap().push(nodes.len());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn decision(action: AgentAction, target: Option<&str>, value: Option<&str>) -> AgentDecision {
    AgentDecision {
        thought: format!("{action} next"),
        action: Some(action),
        target_node_id: None,
        target_text: target.map(String::from),
        value: value.map(String::from),
        objective_verified: false,
    }
}

pub fn finalize() -> AgentDecision {
    AgentDecision {
        thought: "done".into(),
        action: Some(AgentAction::Finalize),
        objective_verified: true,
        ..Default::default()
    }
}
