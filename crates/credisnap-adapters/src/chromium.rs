//! Chromium backend over the DevTools protocol.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{DispatchMouseEventParams, DispatchMouseEventType};
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie, CookieParam, CookieSameSite, EnableParams, EventResponseReceived,
    GetResponseBodyParams, RequestId, SetUserAgentOverrideParams, TimeSinceEpoch,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::HandlerConfig;
use chromiumoxide::layout::Point;
use chromiumoxide::{Browser, BrowserConfig, Page};
use credisnap_storage::BrowserCookie;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    truncate_for_log, Control, ControlState, LaunchOptions, ObservedResponse, RenderSurface,
    SurfaceError, SurfaceLauncher, Viewport, LOG_URL_CHARS,
};

#[derive(Debug, Clone)]
pub struct ChromiumSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// DevTools endpoint of an already running browser, e.g. `http://127.0.0.1:9222`.
    pub remote_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ChromiumSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            remote_url: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    settings: ChromiumSettings,
}

impl ChromiumLauncher {
    pub fn new(settings: ChromiumSettings) -> Self {
        Self { settings }
    }

    async fn start_browser(&self) -> Result<(Browser, JoinHandle<()>, bool), SurfaceError> {
        let (browser, mut handler, remote) = match &self.settings.remote_url {
            Some(url) => {
                let ws_url = resolve_websocket_url(url).await?;
                info!("connecting to remote browser at {ws_url}");
                let config = HandlerConfig {
                    request_timeout: self.settings.request_timeout,
                    ..Default::default()
                };
                let (browser, handler) = Browser::connect_with_config(ws_url, config)
                    .await
                    .map_err(|e| SurfaceError::Launch(format!("connect to remote browser: {e}")))?;
                (browser, handler, true)
            }
            None => {
                info!(headless = self.settings.headless, "launching browser");
                let mut builder = BrowserConfig::builder().request_timeout(self.settings.request_timeout);
                if let Some(path) = &self.settings.chrome_path {
                    builder = builder.chrome_executable(path);
                }
                if !self.settings.headless {
                    builder = builder.with_head();
                }
                builder = builder
                    .arg("--disable-blink-features=AutomationControlled")
                    .arg("--disable-infobars")
                    .arg("--disable-dev-shm-usage")
                    .arg("--no-first-run")
                    .arg("--no-default-browser-check")
                    .arg("--no-sandbox")
                    .arg("--disable-gpu");
                let config = builder
                    .build()
                    .map_err(|e| SurfaceError::Launch(format!("browser config: {e}")))?;
                let (browser, handler) = Browser::launch(config)
                    .await
                    .map_err(|e| SurfaceError::Launch(e.to_string()))?;
                (browser, handler, false)
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        Ok((browser, handler_task, remote))
    }
}

async fn resolve_websocket_url(url: &str) -> Result<String, SurfaceError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return Ok(url.to_string());
    }
    let version_url = format!("{}/json/version", url.trim_end_matches('/'));
    let info: serde_json::Value = reqwest::Client::new()
        .get(&version_url)
        .send()
        .await
        .map_err(|e| SurfaceError::Launch(format!("query {version_url}: {e}")))?
        .json()
        .await
        .map_err(|e| SurfaceError::Launch(format!("parse browser version info: {e}")))?;
    info.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| SurfaceError::Launch("no webSocketDebuggerUrl in version info".to_string()))
}

#[async_trait]
impl SurfaceLauncher for ChromiumLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn RenderSurface>, SurfaceError> {
        let (mut browser, handler_task, remote) = self.start_browser().await?;
        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                if !remote {
                    let _ = browser.close().await;
                }
                handler_task.abort();
                return Err(SurfaceError::Launch(format!("open page: {err}")));
            }
        };

        let mut surface = ChromiumSurface {
            browser: Mutex::new(Some(browser)),
            page,
            remote,
            handler_task,
            listener_task: None,
            pending: Arc::new(StdMutex::new(Vec::new())),
            pointer: StdMutex::new((0.0, 0.0)),
        };
        if let Err(err) = surface.prepare(options).await {
            if let Err(close_err) = surface.close().await {
                warn!("failed to close browser after setup error: {close_err}");
            }
            return Err(err);
        }
        Ok(Box::new(surface))
    }
}

#[derive(Debug, Clone)]
struct PendingResponse {
    request_id: RequestId,
    url: String,
    status: u16,
}

async fn spawn_response_listener(
    page: &Page,
    substring: String,
    pending: Arc<StdMutex<Vec<PendingResponse>>>,
) -> Result<JoinHandle<()>, SurfaceError> {
    page.execute(EnableParams::default()).await.map_err(protocol)?;
    let mut events = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(protocol)?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if !event.response.url.contains(&substring) {
                continue;
            }
            debug!(url = truncate_for_log(&event.response.url, LOG_URL_CHARS), "matched response");
            let entry = PendingResponse {
                request_id: event.request_id.clone(),
                url: event.response.url.clone(),
                status: u16::try_from(event.response.status).unwrap_or(0),
            };
            pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(entry);
        }
    }))
}

fn protocol(err: CdpError) -> SurfaceError {
    SurfaceError::Protocol(err.to_string())
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// JS expression yielding the elements matching `control`.
fn control_query(control: &Control) -> String {
    let selector = js_string(&control.selector);
    match &control.text {
        Some(text) => format!(
            "Array.from(document.querySelectorAll({selector})).filter(el => (el.textContent || '').includes({}))",
            js_string(text)
        ),
        None => format!("Array.from(document.querySelectorAll({selector}))"),
    }
}

pub struct ChromiumSurface {
    browser: Mutex<Option<Browser>>,
    page: Page,
    remote: bool,
    handler_task: JoinHandle<()>,
    listener_task: Option<JoinHandle<()>>,
    pending: Arc<StdMutex<Vec<PendingResponse>>>,
    pointer: StdMutex<(f64, f64)>,
}

impl ChromiumSurface {
    /// Apply the launch options to the fresh page.
    async fn prepare(&mut self, options: &LaunchOptions) -> Result<(), SurfaceError> {
        if let Some(user_agent) = &options.user_agent {
            self.page
                .execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
                .map_err(protocol)?;
        }
        if let Some(substring) = &options.capture_url_substring {
            let task = spawn_response_listener(&self.page, substring.clone(), self.pending.clone()).await?;
            self.listener_task = Some(task);
        }
        Ok(())
    }

    async fn eval<T: DeserializeOwned>(&self, expression: String) -> Result<T, SurfaceError> {
        self.page
            .evaluate(expression)
            .await
            .map_err(|e| SurfaceError::Script(e.to_string()))?
            .into_value::<T>()
            .map_err(|e| SurfaceError::Script(e.to_string()))
    }
}

fn to_browser_cookie(cookie: Cookie) -> BrowserCookie {
    BrowserCookie {
        name: cookie.name,
        value: cookie.value,
        domain: cookie.domain,
        path: cookie.path,
        expires: (cookie.expires > 0.0).then_some(cookie.expires),
        http_only: cookie.http_only,
        secure: cookie.secure,
        same_site: cookie.same_site.map(|s| s.as_ref().to_string()),
    }
}

fn to_cookie_param(cookie: &BrowserCookie) -> Result<CookieParam, String> {
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .http_only(cookie.http_only)
        .secure(cookie.secure);
    if let Some(expires) = cookie.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }
    if let Some(same_site) = cookie.same_site.as_deref().and_then(|s| s.parse::<CookieSameSite>().ok()) {
        builder = builder.same_site(same_site);
    }
    builder.build()
}

#[async_trait]
impl RenderSurface for ChromiumSurface {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), SurfaceError> {
        let navigation = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, CdpError>(())
        };
        match tokio::time::timeout(timeout, navigation).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(CdpError::Timeout)) | Err(_) => Err(SurfaceError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            }),
            Ok(Err(err)) => Err(protocol(err)),
        }
    }

    async fn viewport(&self) -> Result<Viewport, SurfaceError> {
        self.eval("({ width: window.innerWidth, height: window.innerHeight })".to_string())
            .await
    }

    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> Result<(), SurfaceError> {
        let (start_x, start_y) = *self.pointer.lock().unwrap_or_else(|p| p.into_inner());
        let steps = steps.max(1);
        for step in 1..=steps {
            let t = f64::from(step) / f64::from(steps);
            let params = DispatchMouseEventParams::new(
                DispatchMouseEventType::MouseMoved,
                start_x + (x - start_x) * t,
                start_y + (y - start_y) * t,
            );
            self.page.execute(params).await.map_err(protocol)?;
        }
        *self.pointer.lock().unwrap_or_else(|p| p.into_inner()) = (x, y);
        Ok(())
    }

    async fn scroll_y(&self) -> Result<f64, SurfaceError> {
        self.eval("window.scrollY".to_string()).await
    }

    async fn scroll_by(&self, dy: f64) -> Result<(), SurfaceError> {
        // The expression yields a number so the result deserializes cleanly.
        let _: f64 = self
            .eval(format!("(window.scrollBy(0, {dy}), window.scrollY)"))
            .await?;
        Ok(())
    }

    async fn scroll_height(&self, selector: &str) -> Result<Option<f64>, SurfaceError> {
        let height: f64 = self
            .eval(format!(
                "(() => {{ const el = document.querySelector({}); return el ? el.scrollHeight : -1; }})()",
                js_string(selector)
            ))
            .await?;
        Ok((height >= 0.0).then_some(height))
    }

    async fn control_state(&self, control: &Control) -> Result<ControlState, SurfaceError> {
        let state: String = self
            .eval(format!(
                "(() => {{ const el = {}[0]; if (!el) return 'absent'; \
                 return (el.disabled || el.getAttribute('aria-disabled') === 'true') ? 'disabled' : 'enabled'; }})()",
                control_query(control)
            ))
            .await?;
        Ok(match state.as_str() {
            "enabled" => ControlState::Enabled,
            "disabled" => ControlState::Disabled,
            _ => ControlState::Absent,
        })
    }

    async fn click(&self, control: &Control) -> Result<bool, SurfaceError> {
        let center: Vec<f64> = self
            .eval(format!(
                "(() => {{ const el = {}[0]; if (!el) return []; el.scrollIntoView({{block: 'center'}}); \
                 const r = el.getBoundingClientRect(); return [r.left + r.width / 2, r.top + r.height / 2]; }})()",
                control_query(control)
            ))
            .await?;
        let &[x, y] = center.as_slice() else {
            return Ok(false);
        };
        self.page.click(Point { x, y }).await.map_err(protocol)?;
        *self.pointer.lock().unwrap_or_else(|p| p.into_inner()) = (x, y);
        Ok(true)
    }

    async fn click_all(&self, control: &Control) -> Result<usize, SurfaceError> {
        let clicked: f64 = self
            .eval(format!(
                "(() => {{ const els = {}; els.forEach(el => el.click()); return els.length; }})()",
                control_query(control)
            ))
            .await?;
        Ok(clicked.max(0.0) as usize)
    }

    async fn content(&self) -> Result<String, SurfaceError> {
        self.page.content().await.map_err(protocol)
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>, SurfaceError> {
        let cookies = self.page.get_cookies().await.map_err(protocol)?;
        Ok(cookies.into_iter().map(to_browser_cookie).collect())
    }

    async fn set_cookies(&self, cookies: &[BrowserCookie]) -> Result<(), SurfaceError> {
        let params = cookies
            .iter()
            .filter_map(|cookie| match to_cookie_param(cookie) {
                Ok(param) => Some(param),
                Err(err) => {
                    warn!(cookie = %cookie.name, "failed to build cookie: {err}");
                    None
                }
            })
            .collect::<Vec<_>>();
        if params.is_empty() {
            return Ok(());
        }
        self.page.set_cookies(params).await.map_err(protocol)?;
        Ok(())
    }

    async fn take_responses(&self) -> Vec<ObservedResponse> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()));
        let mut responses = Vec::with_capacity(pending.len());
        for entry in pending {
            let short_url = truncate_for_log(&entry.url, LOG_URL_CHARS);
            match self
                .page
                .execute(GetResponseBodyParams::new(entry.request_id.clone()))
                .await
            {
                Ok(body) if body.base64_encoded => {
                    warn!("skipping binary response body from {short_url}");
                }
                Ok(body) => responses.push(ObservedResponse {
                    url: entry.url.clone(),
                    status: entry.status,
                    body: body.result.body.clone().into_bytes(),
                }),
                Err(err) => warn!("failed to read response body from {short_url}: {err}"),
            }
        }
        responses
    }

    async fn close(&self) -> Result<(), SurfaceError> {
        if let Some(task) = &self.listener_task {
            task.abort();
        }
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        let outcome = if self.remote {
            self.page.clone().close().await.map_err(protocol)
        } else {
            match browser.close().await {
                Ok(_) => {
                    let _ = browser.wait().await;
                    Ok(())
                }
                Err(err) => Err(protocol(err)),
            }
        };
        self.handler_task.abort();
        outcome
    }
}
