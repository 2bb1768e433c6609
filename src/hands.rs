use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::types::Method;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, ScoutError};
use crate::page::{BrowserLauncher, ElementRef, LoadState, Locator, PageDriver};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// `Accessibility.getFullAXTree`, returned untyped so the normalizer sees the
/// wire shape whatever protocol revision the browser speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GetFullAxTree {}

impl Method for GetFullAxTree {
    const NAME: &'static str = "Accessibility.getFullAXTree";
    type ReturnObject = Value;
}

/// Finds an element for a [`Locator`], tags it with `data-scout-ref` and
/// returns the tag. `__KIND__` and `__NEEDLE__` are JSON string literals.
const LOCATE_JS: &str = r#"
(() => {
  const kind = __KIND__;
  const needle = (__NEEDLE__).replace(/\s+/g, ' ').trim().toLowerCase();
  const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const visible = el => {
    if (!el.getClientRects().length) return false;
    const s = getComputedStyle(el);
    return s.visibility !== 'hidden' && s.display !== 'none';
  };
  const all = sel => Array.from(document.querySelectorAll(sel)).filter(visible);
  const name = el => norm(
    el.getAttribute('aria-label') || el.innerText || el.value ||
    el.getAttribute('title') || el.getAttribute('placeholder') || ''
  );
  const editable = el => (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA') && !el.readOnly && !el.disabled;
  const ROLES = {
    button: 'button, [role="button"], input[type="button"], input[type="submit"]',
    link: 'a[href], [role="link"]',
    textbox: 'input:not([type="hidden"]):not([type="checkbox"]):not([type="radio"]):not([type="button"]):not([type="submit"]), textarea, [role="textbox"], [role="searchbox"], [role="combobox"], [contenteditable="true"]',
  };
  const EDITABLE = 'input:not([type="hidden"]):not([readonly]), textarea:not([readonly])';

  let found = null;
  switch (kind) {
    case 'text':
      found = all('body *').find(el =>
        norm(el.innerText).includes(needle) &&
        !Array.from(el.children).some(c => norm(c.innerText).includes(needle)));
      break;
    case 'placeholder':
      found = all('[placeholder]').find(el => norm(el.getAttribute('placeholder')).includes(needle));
      break;
    case 'label': {
      const label = all('label').find(l => norm(l.innerText).includes(needle));
      if (label) {
        found = label.control ||
          (label.htmlFor && document.getElementById(label.htmlFor)) ||
          label.querySelector('input, textarea, select');
      }
      if (!found) found = all('[aria-label]').find(el => norm(el.getAttribute('aria-label')).includes(needle) && el.matches('input, textarea, select, [role="combobox"]'));
      break;
    }
    case 'editable':
      found = all(EDITABLE).filter(editable).find(el => name(el).includes(needle));
      break;
    case 'first-editable':
      found = all(EDITABLE).find(editable);
      break;
    default:
      found = all(ROLES[kind] || `[role="${kind}"]`).find(el => name(el).includes(needle));
  }
  if (!found) return null;
  window.__scoutRef = (window.__scoutRef || 0) + 1;
  const ref = 's' + window.__scoutRef;
  found.setAttribute('data-scout-ref', ref);
  return ref;
})()
"#;

const CLICK_JS: &str = r#"
(() => {
  const el = document.querySelector(__SEL__);
  if (!el) return false;
  el.scrollIntoView({ block: 'center', inline: 'center' });
  const target = el.closest('button, a, [role="button"], [role="link"], [role="combobox"]') || el;
  target.click();
  return true;
})()
"#;

const ACTIVATE_JS: &str = r#"
(() => {
  const el = document.querySelector(__SEL__);
  if (!el) return false;
  el.scrollIntoView({ block: 'center' });
  el.dispatchEvent(new MouseEvent('click', { bubbles: true, cancelable: true }));
  return true;
})()
"#;

const EDITABLE_JS: &str = r#"
(() => {
  const el = document.querySelector(__SEL__);
  if (!el) return false;
  if (el.isContentEditable) return true;
  const typed = el.tagName === 'INPUT' || el.tagName === 'TEXTAREA';
  return typed && !el.readOnly && !el.disabled && !el.hasAttribute('readonly');
})()
"#;

const FOCUS_AND_CLEAR_JS: &str = r#"
(() => {
  const el = document.querySelector(__SEL__);
  if (!el) return false;
  el.scrollIntoView({ block: 'center' });
  el.focus();
  if (el.isContentEditable) { el.textContent = ''; } else { el.value = ''; }
  el.dispatchEvent(new Event('input', { bubbles: true }));
  return true;
})()
"#;

const DOM_READY_JS: &str = "document.readyState !== 'loading'";

// Idle once the document is complete and no resource finished since the last poll.
const NETWORK_IDLE_JS: &str = r#"
(() => {
  if (document.readyState !== 'complete') return false;
  const n = performance.getEntriesByType('resource').length;
  const prev = window.__scoutResources;
  window.__scoutResources = n;
  return prev === n;
})()
"#;

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn selector_for(element: &ElementRef) -> String {
    js_string(&format!("[data-scout-ref=\"{}\"]", element.0))
}

fn eval(tab: &Tab, js: &str) -> anyhow::Result<Value> {
    Ok(tab.evaluate(js, false)?.value.unwrap_or(Value::Null))
}

#[derive(Debug, Clone)]
pub struct ChromeSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// DevTools websocket of an already running Chrome to attach to.
    pub attach_ws_url: Option<String>,
    /// Local remote-debugging port probed for a running Chrome when no
    /// websocket is given.
    pub debug_port: Option<u16>,
    pub window_size: (u32, u32),
    pub idle_timeout: Duration,
}

impl Default for ChromeSettings {
    fn default() -> Self {
        Self {
            headless: false,
            chrome_path: None,
            attach_ws_url: None,
            debug_port: Some(9222),
            window_size: (1280, 800),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// One Chrome tab owned by one site visit.
pub struct BrowserSession {
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
    attached: bool,
}

impl BrowserSession {
    /// Blocking; call from `spawn_blocking`.
    pub fn launch(settings: &ChromeSettings) -> anyhow::Result<Self> {
        if let Some(ws_url) = &settings.attach_ws_url {
            info!(%ws_url, "attaching to running Chrome");
            match Browser::connect(ws_url.clone()) {
                Ok(browser) => {
                    let tab = browser.new_tab()?;
                    tab.set_user_agent(USER_AGENT, None, None)?;
                    return Ok(Self {
                        browser: Mutex::new(Some(browser)),
                        tab,
                        attached: true,
                    });
                }
                Err(e) => warn!(error = %e, "could not attach, launching a new Chrome"),
            }
        }

        let options = LaunchOptions {
            headless: settings.headless,
            path: settings.chrome_path.clone(),
            window_size: Some(settings.window_size),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: settings.idle_timeout,
            ..Default::default()
        };

        debug!(headless = settings.headless, "starting Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow::anyhow!("browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.set_user_agent(USER_AGENT, None, None)?;
        info!("Chrome ready");

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            tab,
            attached: false,
        })
    }

    /// Run blocking tab work off the async runtime.
    async fn with_tab<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| ScoutError::Browser(format!("browser task panicked: {e}")))?
            .map_err(|e| ScoutError::Browser(format!("{e:#}")))
    }

    async fn run_on(&self, script: &'static str, element: &ElementRef) -> Result<bool> {
        let js = script.replace("__SEL__", &selector_for(element));
        let value = self.with_tab(move |tab| eval(tab, &js)).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl PageDriver for BrowserSession {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let target = url.to_string();
        let work = self.with_tab(move |tab| {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&target)?;
            tab.wait_until_navigated()?;
            Ok(())
        });

        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ScoutError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ScoutError::timeout(format!("navigation to {url}"), timeout)),
        }
    }

    async fn current_url(&self) -> Result<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn accessibility_tree(&self) -> Result<Value> {
        self.with_tab(|tab| tab.call_method(GetFullAxTree {})).await
    }

    async fn locate(&self, locator: &Locator) -> Result<Option<ElementRef>> {
        let js = LOCATE_JS
            .replace("__KIND__", &js_string(locator.kind()))
            .replace("__NEEDLE__", &js_string(locator.needle()));
        let value = self.with_tab(move |tab| eval(tab, &js)).await?;
        Ok(value.as_str().map(|r| ElementRef(r.to_string())))
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        if self.run_on(CLICK_JS, element).await? {
            Ok(())
        } else {
            Err(ScoutError::Browser(format!("element {} is gone", element.0)))
        }
    }

    async fn activate(&self, element: &ElementRef) -> Result<()> {
        if self.run_on(ACTIVATE_JS, element).await? {
            Ok(())
        } else {
            Err(ScoutError::Browser(format!("element {} is gone", element.0)))
        }
    }

    async fn is_editable(&self, element: &ElementRef) -> Result<bool> {
        self.run_on(EDITABLE_JS, element).await
    }

    async fn type_into(&self, element: &ElementRef, text: &str, keystroke_delay: Duration) -> Result<()> {
        if !self.run_on(FOCUS_AND_CLEAR_JS, element).await? {
            return Err(ScoutError::Browser(format!("element {} is gone", element.0)));
        }
        let text = text.to_string();
        self.with_tab(move |tab| {
            for ch in text.chars() {
                tab.type_str(&ch.to_string())?;
                // Human-ish pacing: 50% to 150% of the nominal delay.
                let jitter = 0.5 + rand::random::<f64>();
                std::thread::sleep(keystroke_delay.mul_f64(jitter));
            }
            Ok(())
        })
        .await
    }

    async fn scroll_by(&self, dy: i64) -> Result<()> {
        let js = format!("window.scrollBy(0, {dy}); true");
        self.with_tab(move |tab| eval(tab, &js).map(|_| ())).await
    }

    async fn wait_for_load(&self, state: LoadState, timeout: Duration) -> Result<()> {
        let (script, poll) = match state {
            LoadState::DomContentLoaded => (DOM_READY_JS, Duration::from_millis(100)),
            LoadState::NetworkIdle => (NETWORK_IDLE_JS, Duration::from_millis(500)),
        };
        poll_until(format!("{state:?}"), timeout, poll, || async move {
            let ready = self.with_tab(move |tab| eval(tab, script)).await?;
            Ok(ready.as_bool() == Some(true))
        })
        .await
    }

    async fn content(&self) -> Result<String> {
        let value = self
            .with_tab(|tab| eval(tab, "document.documentElement.outerHTML"))
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> Result<()> {
        let browser = self
            .browser
            .lock()
            .map_err(|_| ScoutError::Browser("browser handle poisoned".into()))?
            .take();
        let tab = Arc::clone(&self.tab);
        let attached = self.attached;

        tokio::task::spawn_blocking(move || {
            if attached {
                if let Err(e) = tab.close(false) {
                    debug!(error = %e, "closing tab failed");
                }
            }
            // Dropping a launched Browser kills the Chrome process.
            drop(browser);
        })
        .await
        .map_err(|e| ScoutError::Browser(format!("browser teardown panicked: {e}")))
    }
}

/// Polls `check` until it reports ready or `timeout` runs out.
///
/// A failing check counts as not ready: evaluating while a navigation tears
/// down the old document errors until the new one exists.
async fn poll_until<F, Fut>(what: String, timeout: Duration, every: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!(error = %e, %what, "readiness check failed, retrying"),
        }
        if Instant::now() >= deadline {
            return Err(ScoutError::timeout(what, timeout));
        }
        tokio::time::sleep(every).await;
    }
}

/// Asks a Chrome DevTools endpoint for its browser websocket URL.
async fn discover_ws_url(client: &reqwest::Client, http_base: &str) -> Option<String> {
    let url = format!("{}/json/version", http_base.trim_end_matches('/'));
    let response = match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            debug!(status = %resp.status(), "devtools endpoint refused");
            return None;
        }
        Err(e) => {
            debug!(error = %e, "no devtools endpoint");
            return None;
        }
    };
    let body: Value = response.json().await.ok()?;
    body.get("webSocketDebuggerUrl")?.as_str().map(String::from)
}

/// Launches a fresh Chrome (or attaches to one) for every visit.
pub struct ChromeLauncher {
    settings: ChromeSettings,
}

impl ChromeLauncher {
    pub fn new(settings: ChromeSettings) -> Self {
        Self { settings }
    }

    async fn attach_target(&self) -> Option<String> {
        if let Some(ws_url) = &self.settings.attach_ws_url {
            return Some(ws_url.clone());
        }
        let port = self.settings.debug_port?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .ok()?;
        discover_ws_url(&client, &format!("http://127.0.0.1:{port}")).await
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn PageDriver>> {
        let mut settings = self.settings.clone();
        settings.attach_ws_url = self.attach_target().await;
        let session = tokio::task::spawn_blocking(move || BrowserSession::launch(&settings))
            .await
            .map_err(|e| ScoutError::Browser(format!("browser launch panicked: {e}")))?
            .map_err(|e| ScoutError::Browser(format!("{e:#}")))?;
        Ok(Arc::new(session))
    }
}
