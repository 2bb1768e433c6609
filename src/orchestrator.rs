use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

use crate::agent::{AgentSettings, NavigationAgent};
use crate::brain::StepDecider;
use crate::dom;
use crate::error::{Result, ScoutError};
use crate::events::{ProgressEvent, ProgressSink};
use crate::extract::ListingExtractor;
use crate::page::{BrowserLauncher, LoadState, PageDriver};
use crate::types::{FilterRule, ListingCandidate, SemanticNode, TargetVehicle};

static LOCALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.com/([a-z]{2})/|\.com\.([a-z]{2})(?:/|$)").expect("static regex"));

static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\s?[\d.]+").expect("static regex"));

/// Country code embedded in a source URL, e.g. `kavak.com/ar/` or `autos.com.mx/`.
pub fn detect_locale(url: &str) -> Option<String> {
    let caps = LOCALE_RE.captures(url)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

pub fn country_name(code: &str) -> String {
    match code {
        "ar" => "Argentina".to_string(),
        "mx" => "México".to_string(),
        "cl" => "Chile".to_string(),
        other => other.to_uppercase(),
    }
}

/// Deterministic check that we really landed on a listings page.
#[derive(Debug, Clone)]
pub struct SafetyNet {
    pub min_price_matches: usize,
    pub catalog_markers: Vec<String>,
}

impl Default for SafetyNet {
    fn default() -> Self {
        Self {
            min_price_matches: 3,
            catalog_markers: vec!["usados".to_string()],
        }
    }
}

impl SafetyNet {
    pub fn count_prices(content: &str) -> usize {
        PRICE_RE.find_iter(content).count()
    }

    pub fn passes(&self, content: &str, url: &str) -> bool {
        let url = url.to_lowercase();
        Self::count_prices(content) >= self.min_price_matches
            || self.catalog_markers.iter().any(|m| url.contains(m.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct VisitSettings {
    pub navigation_timeout: Duration,
    pub initial_settle: Duration,
    pub phase_idle_timeout: Duration,
    pub final_idle_timeout: Duration,
    pub final_settle: Duration,
    pub final_scroll: i64,
    pub safety_net: SafetyNet,
    /// Where to write the final raw and normalized snapshots, if anywhere.
    pub dump_dir: Option<PathBuf>,
}

impl Default for VisitSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(60),
            initial_settle: Duration::from_secs(2),
            phase_idle_timeout: Duration::from_secs(10),
            final_idle_timeout: Duration::from_secs(15),
            final_settle: Duration::from_secs(2),
            final_scroll: 1000,
            safety_net: SafetyNet::default(),
            dump_dir: None,
        }
    }
}

/// Drives one site visit from the home page to the filtered listing links.
pub struct SiteOrchestrator {
    launcher: Arc<dyn BrowserLauncher>,
    decider: Arc<dyn StepDecider>,
    vehicle: TargetVehicle,
    rules: Vec<FilterRule>,
    agent: AgentSettings,
    visit: VisitSettings,
    extractor: ListingExtractor,
}

impl SiteOrchestrator {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        decider: Arc<dyn StepDecider>,
        vehicle: TargetVehicle,
        rules: Vec<FilterRule>,
    ) -> Self {
        Self {
            launcher,
            decider,
            vehicle,
            rules,
            agent: AgentSettings::default(),
            visit: VisitSettings::default(),
            extractor: ListingExtractor::default(),
        }
    }

    pub fn with_agent_settings(mut self, settings: AgentSettings) -> Self {
        self.agent = settings;
        self
    }

    pub fn with_visit_settings(mut self, settings: VisitSettings) -> Self {
        self.visit = settings;
        self
    }

    pub fn with_extractor(mut self, extractor: ListingExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Run a visit in the background and stream its progress.
    ///
    /// The stream ends once the visit is over and the browser is released.
    pub fn stream_visit(self: &Arc<Self>, base_url: String) -> UnboundedReceiverStream<ProgressEvent> {
        let (sink, stream) = ProgressSink::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.visit(&base_url, &sink).await;
        });
        stream
    }

    /// Run a full visit. Returns the candidates on success; every failure is
    /// reported as a terminal error event instead.
    pub async fn visit(&self, base_url: &str, sink: &ProgressSink) -> Option<Vec<ListingCandidate>> {
        sink.info(format!("Starting browser for {base_url}..."));
        let page = match self.launcher.launch().await {
            Ok(page) => page,
            Err(e) => {
                sink.error(format!("Could not start browser: {e}"));
                return None;
            }
        };

        let result = self.drive(page.as_ref(), base_url, sink).await;

        if let Err(e) = page.close().await {
            warn!(error = %e, "browser teardown failed");
        }

        match result {
            Ok(candidates) => {
                info!(count = candidates.len(), %base_url, "visit finished");
                sink.success(
                    format!("Success! Found {} listings.", candidates.len()),
                    candidates.clone(),
                );
                Some(candidates)
            }
            Err(e) => {
                sink.error(format!("Navigation error: {e}"));
                None
            }
        }
    }

    async fn drive(
        &self,
        page: &dyn PageDriver,
        base_url: &str,
        sink: &ProgressSink,
    ) -> Result<Vec<ListingCandidate>> {
        let agent = NavigationAgent::new(self.decider.as_ref(), &self.agent);

        sink.info("Navigating to the source home page...");
        page.navigate(base_url, self.visit.navigation_timeout).await?;
        tokio::time::sleep(self.visit.initial_settle).await;

        if let Some(code) = detect_locale(base_url) {
            let country = country_name(&code);
            sink.info(format!(
                "Detected country code '{code}'. Making sure the site shows '{country}'..."
            ));
            agent
                .run(
                    page,
                    &format!(
                        "Make sure the site is showing its '{country}' version (click the country selector if it appears)"
                    ),
                    sink,
                )
                .await;
            self.settle(page, self.visit.phase_idle_timeout).await;
        }

        sink.info(format!(
            "Agent ({}) looking for the used-vehicle marketplace...",
            self.decider.label()
        ));
        let marketplace = agent
            .run(
                page,
                "Navigate to the used car catalog, marketplace or 'Buy' section",
                sink,
            )
            .await;
        self.settle(page, self.visit.phase_idle_timeout).await;

        if !marketplace.verified {
            sink.info("Agent did not confirm the marketplace. Running safety check...");
            let content = page.content().await?;
            let url = page.current_url().await?;
            if !self.visit.safety_net.passes(&content, &url) {
                return Err(ScoutError::VisitFailed(
                    "no vehicle listing detected on the page".to_string(),
                ));
            }
            sink.info("Listing indicators detected. Continuing...");
        }

        sink.info("Planning filters from rules...");
        for rule in &self.rules {
            let Some(field) = rule.vehicle_field() else {
                continue;
            };
            let value = self
                .vehicle
                .value_for(field)
                .unwrap_or_else(|| rule.value_text());
            if value.is_empty() {
                sink.warning(format!("No value to filter '{}' with, skipping.", rule.field));
                continue;
            }
            agent
                .run(
                    page,
                    &format!("Filter the field '{}' with the value '{value}'", rule.field),
                    sink,
                )
                .await;
        }

        sink.info("Waiting for the result list to update...");
        self.settle(page, self.visit.final_idle_timeout).await;
        tokio::time::sleep(self.visit.final_settle).await;
        page.scroll_by(self.visit.final_scroll).await?;

        sink.info("Extracting listings from the accessibility tree...");
        let tree = page.accessibility_tree().await?;
        let nodes: Vec<SemanticNode> = dom::normalize(&tree).collect();
        if let Some(dir) = &self.visit.dump_dir {
            if let Err(e) = dump_snapshot(dir, base_url, &tree, &nodes).await {
                sink.warning(format!("Could not write snapshot dump: {e}"));
            }
        }

        Ok(self.extractor.extract(&nodes, &self.vehicle, base_url))
    }

    /// Soft network-idle wait; a timeout is not a failure.
    async fn settle(&self, page: &dyn PageDriver, timeout: Duration) {
        if let Err(e) = page.wait_for_load(LoadState::NetworkIdle, timeout).await {
            tracing::debug!(error = %e, "network did not go idle");
        }
    }
}

async fn dump_snapshot(
    dir: &std::path::Path,
    base_url: &str,
    tree: &Value,
    nodes: &[SemanticNode],
) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let stem: String = base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let stem = stem.trim_matches('_');

    tokio::fs::write(dir.join(format!("{stem}.raw.json")), serde_json::to_vec_pretty(tree)?).await?;
    tokio::fs::write(dir.join(format!("{stem}.nodes.json")), serde_json::to_vec_pretty(nodes)?).await?;
    Ok(())
}
