//! Scripted rendering surface for exercising the drivers without a browser.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use credisnap_storage::BrowserCookie;

use crate::{
    Control, ControlState, LaunchOptions, ObservedResponse, RenderSurface, SurfaceError,
    SurfaceLauncher, Viewport,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum NavigationOutcome {
    #[default]
    Loaded,
    Timeout,
    Failure,
}

#[derive(Debug)]
struct ScriptState {
    navigation: NavigationOutcome,
    viewport: Viewport,
    scroll_y: f64,
    max_scroll: f64,
    scroll_script: VecDeque<f64>,
    scroll_heights: HashMap<String, f64>,
    control_states: HashMap<Control, VecDeque<ControlState>>,
    expandable: HashMap<Control, usize>,
    content: String,
    cookies: Vec<BrowserCookie>,
    responses: Vec<ObservedResponse>,

    visited: Vec<String>,
    mouse_moves: Vec<(f64, f64, u32)>,
    scroll_positions: Vec<f64>,
    clicks: Vec<Control>,
    expanded: usize,
    installed_cookies: Vec<BrowserCookie>,
    closed: bool,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            navigation: NavigationOutcome::Loaded,
            viewport: Viewport {
                width: 1280.0,
                height: 720.0,
            },
            scroll_y: 0.0,
            max_scroll: 0.0,
            scroll_script: VecDeque::new(),
            scroll_heights: HashMap::new(),
            control_states: HashMap::new(),
            expandable: HashMap::new(),
            content: "<html><body></body></html>".to_string(),
            cookies: Vec::new(),
            responses: Vec::new(),
            visited: Vec::new(),
            mouse_moves: Vec::new(),
            scroll_positions: Vec::new(),
            clicks: Vec::new(),
            expanded: 0,
            installed_cookies: Vec::new(),
            closed: false,
        }
    }
}

/// In-memory [`RenderSurface`] driven by a script set up through the `with_*` builders.
///
/// Clones share state, so a test can keep a handle while a launcher hands out another.
/// Control states are consumed one per probe; an exhausted script reports `Absent`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSurface {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with(self, edit: impl FnOnce(&mut ScriptState)) -> Self {
        edit(&mut self.state());
        self
    }

    pub fn with_viewport(self, width: f64, height: f64) -> Self {
        self.with(|s| s.viewport = Viewport { width, height })
    }

    /// Furthest the window can scroll.
    pub fn with_max_scroll(self, max_scroll: f64) -> Self {
        self.with(|s| s.max_scroll = max_scroll)
    }

    /// Positions reported by successive `scroll_y` polls, overriding the scroll model
    /// until the script runs out.
    pub fn with_scroll_script(self, positions: impl IntoIterator<Item = f64>) -> Self {
        self.with(|s| s.scroll_script.extend(positions))
    }

    pub fn with_scroll_height(self, selector: &str, height: f64) -> Self {
        self.with(|s| {
            s.scroll_heights.insert(selector.to_string(), height);
        })
    }

    pub fn with_control_states(
        self,
        control: &Control,
        states: impl IntoIterator<Item = ControlState>,
    ) -> Self {
        self.with(|s| {
            s.control_states
                .entry(control.clone())
                .or_default()
                .extend(states);
        })
    }

    /// Number of elements `click_all` finds for `control`.
    pub fn with_expandable(self, control: &Control, count: usize) -> Self {
        self.with(|s| {
            s.expandable.insert(control.clone(), count);
        })
    }

    pub fn with_content(self, html: impl Into<String>) -> Self {
        let html = html.into();
        self.with(|s| s.content = html)
    }

    pub fn with_cookies(self, cookies: Vec<BrowserCookie>) -> Self {
        self.with(|s| s.cookies = cookies)
    }

    pub fn with_response(self, response: ObservedResponse) -> Self {
        self.with(|s| s.responses.push(response))
    }

    pub fn with_navigation_timeout(self) -> Self {
        self.with(|s| s.navigation = NavigationOutcome::Timeout)
    }

    pub fn with_navigation_failure(self) -> Self {
        self.with(|s| s.navigation = NavigationOutcome::Failure)
    }

    pub fn visited(&self) -> Vec<String> {
        self.state().visited.clone()
    }

    pub fn mouse_moves(&self) -> Vec<(f64, f64, u32)> {
        self.state().mouse_moves.clone()
    }

    /// Every value returned by `scroll_y`, in order.
    pub fn scroll_positions(&self) -> Vec<f64> {
        self.state().scroll_positions.clone()
    }

    pub fn clicks(&self) -> Vec<Control> {
        self.state().clicks.clone()
    }

    pub fn expanded(&self) -> usize {
        self.state().expanded
    }

    pub fn installed_cookies(&self) -> Vec<BrowserCookie> {
        self.state().installed_cookies.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl RenderSurface for ScriptedSurface {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), SurfaceError> {
        let mut state = self.state();
        state.visited.push(url.to_string());
        match state.navigation {
            NavigationOutcome::Loaded => Ok(()),
            NavigationOutcome::Timeout => Err(SurfaceError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            }),
            NavigationOutcome::Failure => {
                Err(SurfaceError::Protocol(format!("net::ERR_CONNECTION_REFUSED at {url}")))
            }
        }
    }

    async fn viewport(&self) -> Result<Viewport, SurfaceError> {
        Ok(self.state().viewport)
    }

    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> Result<(), SurfaceError> {
        self.state().mouse_moves.push((x, y, steps));
        Ok(())
    }

    async fn scroll_y(&self) -> Result<f64, SurfaceError> {
        let mut state = self.state();
        if let Some(scripted) = state.scroll_script.pop_front() {
            state.scroll_y = scripted;
        }
        let y = state.scroll_y;
        state.scroll_positions.push(y);
        Ok(y)
    }

    async fn scroll_by(&self, dy: f64) -> Result<(), SurfaceError> {
        let mut state = self.state();
        state.scroll_y = (state.scroll_y + dy).clamp(0.0, state.max_scroll);
        Ok(())
    }

    async fn scroll_height(&self, selector: &str) -> Result<Option<f64>, SurfaceError> {
        Ok(self.state().scroll_heights.get(selector).copied())
    }

    async fn control_state(&self, control: &Control) -> Result<ControlState, SurfaceError> {
        Ok(self
            .state()
            .control_states
            .get_mut(control)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ControlState::Absent))
    }

    async fn click(&self, control: &Control) -> Result<bool, SurfaceError> {
        self.state().clicks.push(control.clone());
        Ok(true)
    }

    async fn click_all(&self, control: &Control) -> Result<usize, SurfaceError> {
        let mut state = self.state();
        let count = state.expandable.remove(control).unwrap_or(0);
        state.expanded += count;
        Ok(count)
    }

    async fn content(&self) -> Result<String, SurfaceError> {
        Ok(self.state().content.clone())
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>, SurfaceError> {
        Ok(self.state().cookies.clone())
    }

    async fn set_cookies(&self, cookies: &[BrowserCookie]) -> Result<(), SurfaceError> {
        self.state().installed_cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn take_responses(&self) -> Vec<ObservedResponse> {
        std::mem::take(&mut self.state().responses)
    }

    async fn close(&self) -> Result<(), SurfaceError> {
        self.state().closed = true;
        Ok(())
    }
}

/// Hands out clones of one [`ScriptedSurface`] and records the options it was asked for.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    surface: ScriptedSurface,
    launches: Arc<Mutex<Vec<LaunchOptions>>>,
}

impl ScriptedLauncher {
    pub fn new(surface: ScriptedSurface) -> Self {
        Self {
            surface,
            launches: Arc::default(),
        }
    }

    pub fn surface(&self) -> &ScriptedSurface {
        &self.surface
    }

    pub fn launches(&self) -> Vec<LaunchOptions> {
        self.launches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl SurfaceLauncher for ScriptedLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn RenderSurface>, SurfaceError> {
        self.launches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(options.clone());
        Ok(Box::new(self.surface.clone()))
    }
}
