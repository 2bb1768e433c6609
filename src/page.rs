use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    NetworkIdle,
}

/// Handle to an element a locator matched, valid until the next navigation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(pub String);

/// One way of finding an element on the page.
///
/// Name and text matches are case-insensitive substring matches against
/// visible elements; the first match in document order is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    RoleName { role: &'static str, name: String },
    Text(String),
    Placeholder(String),
    Label(String),
    /// Editable, non read-only input or textarea whose name or text matches.
    EditableNamed(String),
    /// First editable, non read-only input or textarea on the page.
    FirstEditable,
}

impl Locator {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoleName { role, .. } => role,
            Self::Text(_) => "text",
            Self::Placeholder(_) => "placeholder",
            Self::Label(_) => "label",
            Self::EditableNamed(_) => "editable",
            Self::FirstEditable => "first-editable",
        }
    }

    pub fn needle(&self) -> &str {
        match self {
            Self::RoleName { name, .. } => name,
            Self::Text(s) | Self::Placeholder(s) | Self::Label(s) | Self::EditableNamed(s) => s,
            Self::FirstEditable => "",
        }
    }
}

/// Button by name, then link by name, then any text.
pub fn click_chain(target: &str) -> Vec<Locator> {
    vec![
        Locator::RoleName {
            role: "button",
            name: target.to_string(),
        },
        Locator::RoleName {
            role: "link",
            name: target.to_string(),
        },
        Locator::Text(target.to_string()),
    ]
}

/// Textbox by name, then placeholder, then label.
pub fn type_chain(target: &str) -> Vec<Locator> {
    vec![
        Locator::RoleName {
            role: "textbox",
            name: target.to_string(),
        },
        Locator::Placeholder(target.to_string()),
        Locator::Label(target.to_string()),
    ]
}

/// Re-resolution after a read-only field was activated.
pub fn editable_chain(target: &str) -> Vec<Locator> {
    vec![Locator::EditableNamed(target.to_string()), Locator::FirstEditable]
}

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[.*?\]").expect("static regex"));

/// Drop `[role]` / `[state]` tags the backend copied from node text.
pub fn strip_tags(target: &str) -> String {
    crate::dom::collapse_whitespace(&TAG_RE.replace_all(target, " "))
}

/// The browser capabilities a site visit needs.
///
/// Any engine that can do these things can drive the agent.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Raw `Accessibility.getFullAXTree` result.
    async fn accessibility_tree(&self) -> Result<Value>;

    async fn locate(&self, locator: &Locator) -> Result<Option<ElementRef>>;

    /// Scroll the element into view and click its nearest clickable ancestor.
    async fn click(&self, element: &ElementRef) -> Result<()>;

    /// Dispatch a synthetic click event without moving the mouse.
    async fn activate(&self, element: &ElementRef) -> Result<()>;

    async fn is_editable(&self, element: &ElementRef) -> Result<bool>;

    /// Clear the field, then type `text` one key at a time.
    async fn type_into(&self, element: &ElementRef, text: &str, keystroke_delay: Duration) -> Result<()>;

    async fn scroll_by(&self, dy: i64) -> Result<()>;

    async fn wait_for_load(&self, state: LoadState, timeout: Duration) -> Result<()>;

    /// Full page markup.
    async fn content(&self) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

/// Acquires a fresh browser session per visit.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn PageDriver>>;
}

/// Try each locator in order; the first one that matches wins.
pub async fn resolve(
    page: &dyn PageDriver,
    chain: &[Locator],
) -> Result<Option<(Locator, ElementRef)>> {
    for locator in chain {
        if let Some(element) = page.locate(locator).await? {
            return Ok(Some((locator.clone(), element)));
        }
    }
    Ok(None)
}
