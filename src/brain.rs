use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Result, ScoutError};
use crate::types::{AgentAction, AgentDecision, MAX_INTERACTIVE_NODES, NavigationGoal, SemanticNode};

pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(20);

/// The decision backends we know how to talk to.
///
/// Each variant owns its request and response shape; everything upstream only
/// sees the text blob the model produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    /// Local inference server speaking the Ollama generate API.
    #[default]
    Ollama,
    Gemini,
    /// OpenAI-compatible chat completions hosted by Groq.
    Groq,
}

impl FromStr for Provider {
    type Err = ScoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" | "local" => Ok(Self::Ollama),
            "gemini" | "google" => Ok(Self::Gemini),
            "groq" => Ok(Self::Groq),
            other => Err(ScoutError::Config(format!("unknown provider '{other}'"))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
            Self::Groq => "groq",
        };
        f.write_str(s)
    }
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Ollama => "llama3.2",
            Self::Gemini => "gemini-2.0-flash",
            Self::Groq => "llama-3.3-70b-versatile",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Groq => "https://api.groq.com",
        }
    }

    pub fn needs_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }

    fn endpoint(&self, base: &str, model: &str) -> String {
        let base = base.trim_end_matches('/');
        match self {
            Self::Ollama => format!("{base}/api/generate"),
            Self::Gemini => format!("{base}/v1beta/models/{model}:generateContent"),
            Self::Groq => format!("{base}/openai/v1/chat/completions"),
        }
    }

    fn request_body(&self, model: &str, prompt: &str) -> Value {
        match self {
            Self::Ollama => json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
                "format": "json",
                "options": { "temperature": 0.1 },
            }),
            Self::Gemini => json!({
                "contents": [{ "parts": [{ "text": prompt }] }],
                "generationConfig": {
                    "temperature": 0.1,
                    "response_mime_type": "application/json",
                },
            }),
            Self::Groq => json!({
                "model": model,
                "messages": [{ "role": "user", "content": prompt }],
                "temperature": 0.1,
                "response_format": { "type": "json_object" },
            }),
        }
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        let text = match self {
            Self::Ollama => body.get("response"),
            Self::Gemini => body.pointer("/candidates/0/content/parts/0/text"),
            Self::Groq => body.pointer("/choices/0/message/content"),
        };
        text.and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub provider: Provider,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub max_nodes: usize,
}

impl BackendConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model: None,
            api_key: None,
            base_url: None,
            timeout: DEFAULT_DECISION_TIMEOUT,
            max_nodes: MAX_INTERACTIVE_NODES,
        }
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(self.provider.default_model())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(self.provider.default_base_url())
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Anything that can turn the current page state into the next action.
#[async_trait]
pub trait StepDecider: Send + Sync {
    fn label(&self) -> String;

    /// Never fails: backend trouble comes back as [`AgentDecision::empty`].
    async fn decide(&self, goal: &NavigationGoal, nodes: &[SemanticNode]) -> AgentDecision;
}

pub struct Brain {
    client: Client,
    config: BackendConfig,
}

impl Brain {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn build_prompt(&self, goal: &NavigationGoal, nodes: &[SemanticNode]) -> String {
        let visible = &nodes[..nodes.len().min(self.config.max_nodes)];
        let history = serde_json::to_string(&goal.history_tail).unwrap_or_else(|_| "[]".into());
        let state = serde_json::to_string(visible).unwrap_or_else(|_| "[]".into());

        format!(
            r#"You are an expert web navigation agent. Reach the OBJECTIVE by analysing the current state of the site.

CURRENT URL: {url}
OBJECTIVE: {objective}
PREVIOUS ACTIONS: {history}

CURRENT STATE (elements with id):
{state}

RULES:
1. Look at the elements and their state tags ([selected], [expanded]).
2. Pick ONE atomic action: click, type, wait or finalize.
3. If the objective is already achieved in the current state, answer with action "finalize".
4. Close pop-ups and cookie banners before anything else.
5. To apply a filter, open its menu first (click) and pick the option in the NEXT step.

Answer ONLY with a JSON object:
{{"thought": "what you see and why you pick the action", "action": "click" | "type" | "wait" | "finalize", "target_node_id": <numeric id>, "target_text": "text of the element", "value": "text to type (type only)", "objective_verified": true | false}}"#,
            url = goal.current_url,
            objective = goal.objective,
        )
    }

    /// `Ok(None)` when the backend answered but gave nothing usable.
    async fn request_text(&self, prompt: &str) -> Result<Option<String>> {
        let provider = self.config.provider;
        let model = self.config.model();
        let url = provider.endpoint(self.config.base_url(), model);
        let api_key = self.config.api_key().unwrap_or_default();

        let mut request = self.client.post(url).json(&provider.request_body(model, prompt));
        request = match provider {
            Provider::Ollama => request,
            Provider::Gemini => request.header("x-goog-api-key", api_key),
            Provider::Groq => request.bearer_auth(api_key),
        };

        // Errors are logged; keep request URLs out of them.
        let response = request.send().await.map_err(reqwest::Error::without_url)?;
        let status = response.status();
        if !status.is_success() {
            warn!(%provider, %status, "decision backend returned an error status");
            return Ok(None);
        }

        let body: Value = response.json().await.map_err(reqwest::Error::without_url)?;
        Ok(provider.extract_text(&body))
    }

    /// Cheap availability check for the configured backend.
    pub async fn probe(&self) -> bool {
        match self.config.provider {
            Provider::Ollama => {
                let url = format!("{}/api/tags", self.config.base_url().trim_end_matches('/'));
                match self.client.get(url).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        debug!(error = %e.without_url(), "ollama probe failed");
                        false
                    }
                }
            }
            Provider::Gemini | Provider::Groq => self.config.api_key().is_some(),
        }
    }
}

#[async_trait]
impl StepDecider for Brain {
    fn label(&self) -> String {
        format!("{} - {}", self.config.provider, self.config.model())
    }

    async fn decide(&self, goal: &NavigationGoal, nodes: &[SemanticNode]) -> AgentDecision {
        let prompt = self.build_prompt(goal, nodes);
        match tokio::time::timeout(self.config.timeout, self.request_text(&prompt)).await {
            Ok(Ok(Some(text))) => {
                debug!(%text, "decision backend replied");
                parse_decision(&text)
            }
            Ok(Ok(None)) => AgentDecision::empty(),
            Ok(Err(e)) => {
                warn!(error = %e, "decision request failed");
                AgentDecision::empty()
            }
            Err(_) => {
                warn!(timeout = ?self.config.timeout, "decision request timed out");
                AgentDecision::empty()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDecision {
    #[serde(alias = "pensamiento")]
    thought: Option<Value>,
    #[serde(alias = "accion", alias = "acción")]
    action: Option<Value>,
    #[serde(alias = "elemento_id", alias = "targetNodeId", alias = "element_id")]
    target_node_id: Option<Value>,
    #[serde(alias = "elemento_texto", alias = "targetText", alias = "element_text")]
    target_text: Option<Value>,
    #[serde(alias = "valor")]
    value: Option<Value>,
    #[serde(alias = "objetivo_verificado", alias = "objectiveVerified")]
    objective_verified: Option<Value>,
}

impl RawDecision {
    fn into_decision(self) -> AgentDecision {
        AgentDecision {
            thought: self.thought.as_ref().and_then(scalar_text).unwrap_or_default(),
            action: self
                .action
                .as_ref()
                .and_then(scalar_text)
                .and_then(|a| AgentAction::from_keyword(&a)),
            target_node_id: self.target_node_id.as_ref().and_then(|v| match v {
                Value::Number(n) => n.as_u64().map(|n| n as usize),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }),
            target_text: self.target_text.as_ref().and_then(scalar_text),
            value: self.value.as_ref().and_then(scalar_text),
            objective_verified: match self.objective_verified {
                Some(Value::Bool(b)) => b,
                Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
                _ => false,
            },
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Decode backend text into a decision.
///
/// Tries strict JSON, then the body of a markdown code fence, then the first
/// balanced `{...}` span. Anything else is the empty decision.
pub fn parse_decision(text: &str) -> AgentDecision {
    let text = text.trim();
    if text.is_empty() {
        return AgentDecision::empty();
    }

    let raw = decode_object(text)
        .or_else(|| decode_object(strip_code_fences(text)))
        .or_else(|| extract_braced(text).and_then(decode_object));

    match raw {
        Some(raw) => raw.into_decision(),
        None => {
            debug!(%text, "could not decode decision text");
            AgentDecision::empty()
        }
    }
}

// Only objects count; derived struct deserialization would also take a
// positional array.
fn decode_object(text: &str) -> Option<RawDecision> {
    match serde_json::from_str::<Value>(text).ok()? {
        object @ Value::Object(_) => RawDecision::deserialize(object).ok(),
        _ => None,
    }
}

fn strip_code_fences(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    let body = match after.find('\n') {
        Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => &after[nl + 1..],
        _ => after,
    };
    body.find("```").map_or(body, |end| &body[..end]).trim()
}

fn extract_braced(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    fn goal() -> NavigationGoal {
        NavigationGoal {
            objective: "Open the used cars catalog".into(),
            history_tail: vec![],
            current_url: "https://example.com/".into(),
        }
    }

    fn node(id: usize, text: &str) -> SemanticNode {
        SemanticNode {
            id,
            role: "link".into(),
            text: text.into(),
            states: Default::default(),
            url: None,
        }
    }

    fn brain_for(provider: Provider, server: &MockServer) -> Brain {
        let mut config = BackendConfig::new(provider);
        config.base_url = Some(server.uri());
        config.api_key = Some("test-key".into());
        config.timeout = Duration::from_millis(300);
        Brain::new(config).unwrap()
    }

    #[test]
    fn parses_strict_json() {
        let d = parse_decision(
            r#"{"thought":"menu is closed","action":"click","target_node_id":12,"target_text":"[button] Marca","objective_verified":false}"#,
        );
        assert_eq!(d.action, Some(AgentAction::Click));
        assert_eq!(d.target_node_id, Some(12));
        assert_eq!(d.target_text.as_deref(), Some("[button] Marca"));
        assert_eq!(d.thought, "menu is closed");
        assert!(!d.objective_verified);
    }

    #[test]
    fn parses_fenced_spanish_decision() {
        let d = parse_decision("```json\n{\"accion\":\"finalizar\",\"objetivo_verificado\":true}\n```");
        assert_eq!(d.action, Some(AgentAction::Finalize));
        assert!(d.objective_verified);
        assert!(d.is_terminal());
    }

    #[test]
    fn extracts_braced_object_from_prose() {
        let d = parse_decision(
            "Sure! Here is my answer: {\"accion\": \"escribir\", \"elemento_texto\": \"Buscar {marca}\", \"valor\": \"Toyota\"} hope it helps",
        );
        assert_eq!(d.action, Some(AgentAction::Type));
        assert_eq!(d.target_text.as_deref(), Some("Buscar {marca}"));
        assert_eq!(d.value.as_deref(), Some("Toyota"));
    }

    #[test]
    fn coerces_string_ids_and_flags() {
        let d = parse_decision(r#"{"action":"wait","target_node_id":"7","objective_verified":"true"}"#);
        assert_eq!(d.target_node_id, Some(7));
        assert!(d.objective_verified);
    }

    #[test]
    fn malformed_text_is_empty_decision() {
        for text in ["", "not json at all", "{\"action\": ", "```\nnope\n```", "[1, 2]", "\"click\""] {
            let d = parse_decision(text);
            assert!(d.is_empty(), "expected empty decision for {text:?}");
        }
    }

    #[test]
    fn positional_array_is_not_a_decision() {
        for text in [
            r#"["x", "finalizar", null, null, null, true]"#,
            "```json\n[\"x\", \"click\", 3, \"Comprar\"]\n```",
        ] {
            let d = parse_decision(text);
            assert!(d.is_empty(), "expected empty decision for {text:?}");
            assert!(!d.is_terminal());
        }
    }

    #[test]
    fn unknown_action_is_dropped() {
        let d = parse_decision(r#"{"action":"dance","thought":"?"}"#);
        assert_eq!(d.action, None);
        assert!(d.is_empty());
    }

    #[test]
    fn provider_round_trips_names() {
        for p in [Provider::Ollama, Provider::Gemini, Provider::Groq] {
            assert_eq!(p.to_string().parse::<Provider>().unwrap(), p);
        }
        assert!("openai".parse::<Provider>().is_err());
    }

    #[test]
    fn provider_text_extraction() {
        let ollama = json!({ "response": "{\"action\":\"wait\"}" });
        let gemini = json!({ "candidates": [{ "content": { "parts": [{ "text": "{}" }] } }] });
        let groq = json!({ "choices": [{ "message": { "content": " {} " } }] });

        assert_eq!(Provider::Ollama.extract_text(&ollama).as_deref(), Some("{\"action\":\"wait\"}"));
        assert_eq!(Provider::Gemini.extract_text(&gemini).as_deref(), Some("{}"));
        assert_eq!(Provider::Groq.extract_text(&groq).as_deref(), Some("{}"));
        assert_eq!(Provider::Groq.extract_text(&ollama), None);
    }

    #[test]
    fn prompt_caps_node_list() {
        let mut config = BackendConfig::new(Provider::Ollama);
        config.max_nodes = 2;
        let brain = Brain::new(config).unwrap();
        let nodes: Vec<_> = (0..5).map(|i| node(i, &format!("[link] entry-{i}"))).collect();

        let prompt = brain.build_prompt(&goal(), &nodes);
        assert!(prompt.contains("entry-1"));
        assert!(!prompt.contains("entry-2"));
        assert!(prompt.contains("Open the used cars catalog"));
    }

    #[tokio::test]
    async fn ollama_decision() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "{\"thought\":\"catalog link visible\",\"action\":\"click\",\"target_text\":\"Comprar\"}"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let brain = brain_for(Provider::Ollama, &server);
        let d = brain.decide(&goal(), &[node(0, "[link] Comprar")]).await;
        assert_eq!(d.action, Some(AgentAction::Click));
        assert_eq!(d.target_text.as_deref(), Some("Comprar"));
    }

    #[tokio::test]
    async fn groq_sends_bearer_and_parses() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/openai/v1/chat/completions"))
            .and(matchers::header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "{\"action\":\"finalize\",\"objective_verified\":true}" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let brain = brain_for(Provider::Groq, &server);
        let d = brain.decide(&goal(), &[]).await;
        assert!(d.is_terminal());
    }

    #[tokio::test]
    async fn gemini_decision() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(matchers::header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "```json\n{\"action\":\"wait\"}\n```" }] } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let brain = brain_for(Provider::Gemini, &server);
        let d = brain.decide(&goal(), &[]).await;
        assert_eq!(d.action, Some(AgentAction::Wait));
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_api_key() {
        let mut config = BackendConfig::new(Provider::Gemini);
        config.base_url = Some("http://127.0.0.1:1".into());
        config.api_key = Some("SECRET-KEY-123".into());
        config.timeout = Duration::from_millis(300);
        let brain = Brain::new(config).unwrap();

        let err = brain.request_text("prompt").await.unwrap_err();
        let debug = format!("{err:?}");
        assert!(!debug.contains("SECRET-KEY-123"), "key leaked: {debug}");
        assert!(!err.to_string().contains("generateContent"));
    }

    #[test]
    fn ollama_body_sets_low_temperature() {
        let body = Provider::Ollama.request_body("llama3.2", "p");
        assert_eq!(body.pointer("/options/temperature"), Some(&json!(0.1)));
        assert_eq!(body["format"], "json");
    }

    #[tokio::test]
    async fn error_status_yields_empty_decision() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let brain = brain_for(Provider::Groq, &server);
        assert!(brain.decide(&goal(), &[]).await.is_empty());
    }

    #[tokio::test]
    async fn non_json_body_yields_empty_decision() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let brain = brain_for(Provider::Ollama, &server);
        assert!(brain.decide(&goal(), &[]).await.is_empty());
    }

    #[tokio::test]
    async fn slow_backend_times_out_to_empty_decision() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "{\"action\":\"click\"}" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let brain = brain_for(Provider::Ollama, &server);
        assert!(brain.decide(&goal(), &[]).await.is_empty());
    }

    #[tokio::test]
    async fn probe_checks_ollama_tags() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
            .mount(&server)
            .await;

        assert!(brain_for(Provider::Ollama, &server).probe().await);

        let mut keyless = BackendConfig::new(Provider::Groq);
        keyless.api_key = None;
        assert!(!Brain::new(keyless).unwrap().probe().await);
    }
}
