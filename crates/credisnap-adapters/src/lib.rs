//! Source adapters: page interaction drivers and record extractors for the
//! finrating reviews feed and the microloans marketplace.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use credisnap_core::{parse_rating, parse_review_date, OfferRecord, ParseError, RawOffer, RawReview, ReviewRecord};
use credisnap_storage::{BrowserCookie, CookieStore};
use rand::Rng;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[cfg(feature = "browser")]
mod chromium;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(feature = "browser")]
pub use chromium::{ChromiumLauncher, ChromiumSettings};

pub const CRATE_NAME: &str = "credisnap-adapters";

/// Log lines carry at most this many characters of a URL.
pub const LOG_URL_CHARS: usize = 120;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/141.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("navigation to {url} timed out after {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// A clickable element located by CSS selector and, optionally, contained text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Control {
    pub selector: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl Control {
    pub fn new(selector: impl Into<String>, text: Option<&str>) -> Self {
        Self {
            selector: selector.into(),
            text: text.map(ToString::to_string),
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} ({text:?})", self.selector),
            None => f.write_str(&self.selector),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Absent,
    Disabled,
    Enabled,
}

/// A network response seen by the page while it was open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedPayload {
    pub url: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub user_agent: Option<String>,
    /// Record responses whose URL contains this substring.
    pub capture_url_substring: Option<String>,
}

/// The rendering engine as seen by the drivers: navigate, query, simulate input,
/// read the DOM and the responses captured on the side.
#[async_trait]
pub trait RenderSurface: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), SurfaceError>;

    async fn viewport(&self) -> Result<Viewport, SurfaceError>;

    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> Result<(), SurfaceError>;

    async fn scroll_y(&self) -> Result<f64, SurfaceError>;

    async fn scroll_by(&self, dy: f64) -> Result<(), SurfaceError>;

    /// `scrollHeight` of the first element matching `selector`, if any.
    async fn scroll_height(&self, selector: &str) -> Result<Option<f64>, SurfaceError>;

    async fn control_state(&self, control: &Control) -> Result<ControlState, SurfaceError>;

    /// Click the first matching control; `false` when nothing matched.
    async fn click(&self, control: &Control) -> Result<bool, SurfaceError>;

    /// Click every matching control, returning how many were clicked.
    async fn click_all(&self, control: &Control) -> Result<usize, SurfaceError>;

    async fn content(&self) -> Result<String, SurfaceError>;

    async fn cookies(&self) -> Result<Vec<BrowserCookie>, SurfaceError>;

    async fn set_cookies(&self, cookies: &[BrowserCookie]) -> Result<(), SurfaceError>;

    /// Drain the responses recorded since launch (or since the previous call).
    async fn take_responses(&self) -> Vec<ObservedResponse>;

    async fn close(&self) -> Result<(), SurfaceError>;
}

#[async_trait]
pub trait SurfaceLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn RenderSurface>, SurfaceError>;
}

/// Receives validated offers during capture. Returns whether the offer was kept.
pub trait OfferSink {
    fn accept(&mut self, offer: RawOffer) -> bool;
}

impl OfferSink for Vec<RawOffer> {
    fn accept(&mut self, offer: RawOffer) -> bool {
        self.push(offer);
        true
    }
}

pub fn truncate_for_log(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Run `action`, logging entry, success and failure under `description`.
pub async fn instrument_action<T, E, F>(description: &str, action: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    info!("[ACTION] {description}...");
    match action.await {
        Ok(value) => {
            info!("[OK] {description} completed successfully.");
            Ok(value)
        }
        Err(err) => {
            warn!("[ERROR] {description} failed: {err}");
            Err(err)
        }
    }
}

async fn pause_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Inclusive integer range sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: u64,
    pub max: u64,
}

impl Bounds {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub const fn fixed(value: u64) -> Self {
        Self::new(value, value)
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        if self.max <= self.min {
            self.min
        } else {
            rng.random_range(self.min..=self.max)
        }
    }
}

/// Randomized pointer and scroll behavior for the infinite-scroll surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanizeSettings {
    pub mouse_moves: Bounds,
    pub mouse_steps: Bounds,
    pub move_pause_ms: Bounds,
    pub scroll_step_px: Bounds,
    pub scroll_pause_ms: Bounds,
    pub max_idle_rounds: u32,
    pub max_scroll_rounds: u32,
}

impl Default for HumanizeSettings {
    fn default() -> Self {
        Self {
            mouse_moves: Bounds::new(2, 5),
            mouse_steps: Bounds::new(10, 30),
            move_pause_ms: Bounds::new(200, 600),
            scroll_step_px: Bounds::new(100, 150),
            scroll_pause_ms: Bounds::new(500, 700),
            max_idle_rounds: 3,
            max_scroll_rounds: 2_000,
        }
    }
}

impl HumanizeSettings {
    pub fn without_delays(mut self) -> Self {
        self.move_pause_ms = Bounds::fixed(0);
        self.scroll_pause_ms = Bounds::fixed(0);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationReport {
    pub clicked: u32,
    pub skipped: u32,
}

/// Press a "load more" control up to `rounds` times.
///
/// A round whose control is absent, disabled or fails to click is skipped and the
/// remaining rounds are still attempted; content sometimes re-enables the control.
pub async fn paginate_load_more(
    surface: &dyn RenderSurface,
    control: &Control,
    rounds: u32,
    settle: Duration,
) -> PaginationReport {
    let mut report = PaginationReport::default();
    for round in 1..=rounds {
        let state = match surface.control_state(control).await {
            Ok(state) => state,
            Err(err) => {
                warn!(round, %control, "failed to probe control: {err}");
                report.skipped += 1;
                continue;
            }
        };
        if state != ControlState::Enabled {
            debug!(round, %control, ?state, "control unavailable, skipping round");
            report.skipped += 1;
            continue;
        }
        match surface.click(control).await {
            Ok(true) => {
                report.clicked += 1;
                if !settle.is_zero() {
                    tokio::time::sleep(settle).await;
                }
            }
            Ok(false) => {
                debug!(round, %control, "control vanished before click");
                report.skipped += 1;
            }
            Err(err) => {
                warn!(round, %control, "click failed: {err}");
                report.skipped += 1;
            }
        }
    }
    report
}

/// Move the pointer to a few random points inside the central 80% of the viewport.
pub async fn move_mouse_humanized<R>(
    surface: &dyn RenderSurface,
    settings: &HumanizeSettings,
    rng: &mut R,
) -> Result<u64, SurfaceError>
where
    R: Rng + Send,
{
    let viewport = surface.viewport().await?;
    let moves = settings.mouse_moves.sample(rng);
    for _ in 0..moves {
        let x = rng.random_range(viewport.width * 0.1..=viewport.width * 0.9);
        let y = rng.random_range(viewport.height * 0.1..=viewport.height * 0.9);
        let steps = settings.mouse_steps.sample(rng).max(1) as u32;
        surface.mouse_move(x, y, steps).await?;
        pause_ms(settings.move_pause_ms.sample(rng)).await;
    }
    Ok(moves)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollReport {
    pub rounds: u32,
    pub ceiling: Option<f64>,
    pub final_scroll_y: f64,
    pub reached_end: bool,
}

/// Scroll in random increments until the window has sat at or past the content
/// ceiling (or stopped moving) for `max_idle_rounds` consecutive polls.
pub async fn scroll_until_idle<R>(
    surface: &dyn RenderSurface,
    container_selector: &str,
    settings: &HumanizeSettings,
    rng: &mut R,
) -> Result<ScrollReport, SurfaceError>
where
    R: Rng + Send,
{
    let Some(ceiling) = surface.scroll_height(container_selector).await? else {
        warn!(container_selector, "scroll container not found, skipping scroll");
        return Ok(ScrollReport {
            rounds: 0,
            ceiling: None,
            final_scroll_y: surface.scroll_y().await?,
            reached_end: false,
        });
    };

    let mut rounds = 0u32;
    let mut idle_rounds = 0u32;
    let mut previous_y: Option<f64> = None;
    loop {
        let scroll_y = surface.scroll_y().await?;
        let stalled = previous_y.is_some_and(|prev| scroll_y <= prev);
        if scroll_y >= ceiling || stalled {
            idle_rounds += 1;
        } else {
            idle_rounds = 0;
        }

        if idle_rounds >= settings.max_idle_rounds {
            info!(rounds, scroll_y, ceiling, "reached end of section, stop scrolling");
            return Ok(ScrollReport {
                rounds,
                ceiling: Some(ceiling),
                final_scroll_y: scroll_y,
                reached_end: true,
            });
        }
        if rounds >= settings.max_scroll_rounds {
            warn!(rounds, scroll_y, ceiling, "scroll round limit hit before reaching the end");
            return Ok(ScrollReport {
                rounds,
                ceiling: Some(ceiling),
                final_scroll_y: scroll_y,
                reached_end: false,
            });
        }

        let step = settings.scroll_step_px.sample(rng);
        surface.scroll_by(step as f64).await?;
        rounds += 1;
        previous_y = Some(scroll_y);
        pause_ms(settings.scroll_pause_ms.sample(rng)).await;
    }
}

/// Accumulates parsed JSON bodies of responses matching a URL substring.
#[derive(Debug, Clone)]
pub struct ResponseCapture {
    url_substring: String,
    payloads: Vec<CapturedPayload>,
    discarded: usize,
}

impl ResponseCapture {
    pub fn new(url_substring: impl Into<String>) -> Self {
        Self {
            url_substring: url_substring.into(),
            payloads: Vec::new(),
            discarded: 0,
        }
    }

    pub fn matches(&self, response: &ObservedResponse) -> bool {
        response.url.contains(&self.url_substring) && (200..300).contains(&response.status)
    }

    /// Keep the response if it matches and parses as JSON. Parse failures are logged
    /// and dropped.
    pub fn ingest(&mut self, response: ObservedResponse) -> bool {
        if !self.matches(&response) {
            return false;
        }
        let short_url = truncate_for_log(&response.url, LOG_URL_CHARS);
        match serde_json::from_slice::<JsonValue>(&response.body) {
            Ok(payload) => {
                info!("loaded JSON from {short_url} ...");
                self.payloads.push(CapturedPayload {
                    url: response.url,
                    payload,
                });
                true
            }
            Err(err) => {
                warn!("response is not JSON: {short_url} ({err})");
                self.discarded += 1;
                false
            }
        }
    }

    pub fn ingest_all(&mut self, responses: impl IntoIterator<Item = ObservedResponse>) -> usize {
        responses
            .into_iter()
            .map(|response| self.ingest(response))
            .filter(|kept| *kept)
            .count()
    }

    pub fn payloads(&self) -> &[CapturedPayload] {
        &self.payloads
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn into_payloads(self) -> Vec<CapturedPayload> {
        self.payloads
    }
}

/// Enumerate the `offers` list of a captured payload, skipping items of the wrong shape.
pub fn offers_from_payload(payload: &CapturedPayload) -> Vec<RawOffer> {
    let Some(items) = payload.payload.get("offers").and_then(JsonValue::as_array) else {
        debug!(
            url = truncate_for_log(&payload.url, LOG_URL_CHARS),
            "payload has no offers list"
        );
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| match RawOffer::from_value(item) {
            Ok(offer) => Some(offer),
            Err(err) => {
                warn!(index = idx, "skipping offer with unexpected shape: {err}");
                None
            }
        })
        .collect()
}

/// Assign 1-based positions and parse the cost range of every offer.
pub fn normalize_offers(offers: &[RawOffer]) -> Result<Vec<OfferRecord>, ParseError> {
    offers
        .iter()
        .enumerate()
        .map(|(idx, offer)| {
            let card_index = i32::try_from(idx + 1).unwrap_or(i32::MAX);
            OfferRecord::from_raw(card_index, offer).inspect_err(|err| {
                error!(offer_id = %offer.offer_id, "cannot normalize offer: {err}");
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSelectors {
    pub card: String,
    pub title: String,
    pub body: String,
    /// The last match inside a card holds the numeric rating.
    pub rating: String,
    pub date: String,
    pub collapse_text: String,
}

impl Default for ReviewSelectors {
    fn default() -> Self {
        Self {
            card: "mt-ugc-review-card".to_string(),
            title: ".p2-bold".to_string(),
            body: "div.review-description".to_string(),
            rating: "div.d-flex.justify-content-between > div".to_string(),
            date: ".p3.color-gray-strong-text".to_string(),
            collapse_text: "скрыть".to_string(),
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read every review card out of rendered markup. A missing title, body or date
/// yields an empty string; a missing rating leaves `rating_text` empty.
pub fn extract_reviews_from_html(
    html: &str,
    selectors: &ReviewSelectors,
) -> Result<Vec<RawReview>, ExtractError> {
    let card_sel = parse_selector(&selectors.card)?;
    let title_sel = parse_selector(&selectors.title)?;
    let body_sel = parse_selector(&selectors.body)?;
    let rating_sel = parse_selector(&selectors.rating)?;
    let date_sel = parse_selector(&selectors.date)?;

    let document = Html::parse_document(html);
    let reviews = document
        .select(&card_sel)
        .map(|card| {
            let title = card.select(&title_sel).next().map(element_text).unwrap_or_default();
            let body = card
                .select(&body_sel)
                .next()
                .map(|el| {
                    let text = element_text(el);
                    if selectors.collapse_text.is_empty() {
                        text
                    } else {
                        text.replace(&selectors.collapse_text, "")
                            .split_whitespace()
                            .collect::<Vec<_>>()
                            .join(" ")
                    }
                })
                .unwrap_or_default();
            let rating_text = card
                .select(&rating_sel)
                .last()
                .map(element_text)
                .filter(|text| !text.is_empty());
            let date_text = card.select(&date_sel).next().map(element_text).unwrap_or_default();
            RawReview {
                title,
                body,
                rating_text,
                date_text,
            }
        })
        .collect();
    Ok(reviews)
}

/// Type raw reviews. Reviews without a usable integer rating are skipped.
pub fn normalize_reviews(raw: Vec<RawReview>, today: NaiveDate) -> Vec<ReviewRecord> {
    raw.into_iter()
        .filter_map(|review| {
            let Some(rating_text) = review.rating_text.as_deref() else {
                warn!(title = truncate_for_log(&review.title, 60), "review has no rating, skipping");
                return None;
            };
            let rating = match parse_rating(rating_text) {
                Ok(rating) => rating,
                Err(err) => {
                    warn!(title = truncate_for_log(&review.title, 60), "skipping review: {err}");
                    return None;
                }
            };
            let published_at = parse_review_date(&review.date_text, today);
            if published_at.is_none() && !review.date_text.is_empty() {
                debug!(date_text = %review.date_text, "unrecognized review date");
            }
            Some(ReviewRecord {
                fingerprint: review.fingerprint(),
                title: review.title,
                body: review.body,
                rating,
                published_at,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSourceSettings {
    pub url: String,
    /// Pages to show; the first is rendered on load, the rest via "load more".
    pub max_pages: u32,
    pub load_more: Control,
    pub read_more: Control,
    pub selectors: ReviewSelectors,
    pub navigation_timeout_secs: u64,
    pub initial_settle_ms: u64,
    pub click_settle_ms: u64,
    pub expand_settle_ms: u64,
}

impl Default for ReviewSourceSettings {
    fn default() -> Self {
        Self {
            url: "https://credistory.ru/finrating".to_string(),
            max_pages: 10,
            load_more: Control::new("button", Some("Показать ещё отзывы")),
            read_more: Control::new("div.review-description span.color-accent-strong", Some("читать")),
            selectors: ReviewSelectors::default(),
            navigation_timeout_secs: 60,
            initial_settle_ms: 3_000,
            click_settle_ms: 2_000,
            expand_settle_ms: 300,
        }
    }
}

impl ReviewSourceSettings {
    pub fn without_delays(mut self) -> Self {
        self.initial_settle_ms = 0;
        self.click_settle_ms = 0;
        self.expand_settle_ms = 0;
        self
    }
}

async fn close_surface(surface: &dyn RenderSurface) {
    if let Err(err) = surface.close().await {
        warn!("failed to close rendering surface: {err}");
    }
}

/// Reviews feed rendered client-side with a "load more" button.
#[derive(Debug, Clone, Default)]
pub struct FinratingReviewsAdapter {
    settings: ReviewSourceSettings,
}

impl FinratingReviewsAdapter {
    pub const SOURCE: &'static str = "finrating";

    pub fn new(settings: ReviewSourceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ReviewSourceSettings {
        &self.settings
    }

    pub fn launch_options(&self, user_agent: Option<String>) -> LaunchOptions {
        LaunchOptions {
            user_agent,
            capture_url_substring: None,
        }
    }

    pub async fn scrape(&self, surface: &dyn RenderSurface) -> Result<Vec<RawReview>, ExtractError> {
        let settings = &self.settings;
        instrument_action(
            "Open reviews page",
            surface.goto(&settings.url, Duration::from_secs(settings.navigation_timeout_secs)),
        )
        .await?;
        pause_ms(settings.initial_settle_ms).await;

        let rounds = settings.max_pages.saturating_sub(1);
        info!(rounds, "start opening more reviews");
        let pagination = paginate_load_more(
            surface,
            &settings.load_more,
            rounds,
            Duration::from_millis(settings.click_settle_ms),
        )
        .await;
        info!(clicked = pagination.clicked, skipped = pagination.skipped, "end opening reviews");

        let expanded = match surface.click_all(&settings.read_more).await {
            Ok(count) => count,
            Err(err) => {
                warn!("failed to expand truncated reviews: {err}");
                0
            }
        };
        if expanded > 0 {
            debug!(expanded, "expanded truncated reviews");
            pause_ms(settings.expand_settle_ms).await;
        }

        let html = surface.content().await?;
        let reviews = extract_reviews_from_html(&html, &settings.selectors)?;
        info!(reviews = reviews.len(), "collected reviews on page");
        Ok(reviews)
    }

    /// Launch a surface, scrape, and release the surface whatever the outcome.
    pub async fn collect(
        &self,
        launcher: &dyn SurfaceLauncher,
        options: &LaunchOptions,
    ) -> Result<Vec<RawReview>, ExtractError> {
        let surface = launcher.launch(options).await?;
        let outcome = self.scrape(surface.as_ref()).await;
        close_surface(surface.as_ref()).await;
        outcome
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferSourceSettings {
    pub url: String,
    pub capture_url_substring: String,
    pub scroll_container: String,
    pub navigation_timeout_secs: u64,
    pub settle_after_navigation_ms: u64,
    pub humanize: HumanizeSettings,
}

impl Default for OfferSourceSettings {
    fn default() -> Self {
        Self {
            url: "https://credistory.ru/market/microloans".to_string(),
            capture_url_substring: "mpl_offers_light".to_string(),
            scroll_container: "mp-four-column-grid section > div".to_string(),
            navigation_timeout_secs: 60,
            settle_after_navigation_ms: 3_000,
            humanize: HumanizeSettings::default(),
        }
    }
}

impl OfferSourceSettings {
    pub fn without_delays(mut self) -> Self {
        self.settle_after_navigation_ms = 0;
        self.humanize = self.humanize.without_delays();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferCaptureReport {
    pub navigation_timed_out: bool,
    pub cookies_saved: bool,
    pub payloads: usize,
    pub discarded_responses: usize,
    pub offers_seen: usize,
    pub offers_accepted: usize,
    pub scroll: ScrollReport,
}

/// Microloans marketplace: offers arrive through XHR while the page is scrolled.
#[derive(Debug, Clone, Default)]
pub struct MicroloansOffersAdapter {
    settings: OfferSourceSettings,
}

impl MicroloansOffersAdapter {
    pub const SOURCE: &'static str = "microloans";

    pub fn new(settings: OfferSourceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &OfferSourceSettings {
        &self.settings
    }

    pub fn launch_options(&self, user_agent: Option<String>) -> LaunchOptions {
        LaunchOptions {
            user_agent,
            capture_url_substring: Some(self.settings.capture_url_substring.clone()),
        }
    }

    /// Drive the page and feed every captured offer into `sink`, which is handed back.
    pub async fn scrape<S, R>(
        &self,
        surface: &dyn RenderSurface,
        cookies: &CookieStore,
        mut sink: S,
        rng: &mut R,
    ) -> Result<(S, OfferCaptureReport), ExtractError>
    where
        S: OfferSink + Send,
        R: Rng + Send,
    {
        let settings = &self.settings;
        let saved = cookies.load(Self::SOURCE).await;
        if !saved.is_empty() {
            if let Err(err) = surface.set_cookies(&saved).await {
                warn!("failed to install saved cookies: {err}");
            }
        }

        info!(url = %settings.url, "open page with microloans in browser");
        let timeout = Duration::from_secs(settings.navigation_timeout_secs);
        let mut navigation_timed_out = false;
        let current_cookies = match surface.goto(&settings.url, timeout).await {
            Ok(()) => {
                pause_ms(settings.settle_after_navigation_ms).await;
                surface.cookies().await.unwrap_or_else(|err| {
                    warn!("failed to read browser cookies: {err}");
                    Vec::new()
                })
            }
            Err(SurfaceError::NavigationTimeout { url, .. }) => {
                error!("loading page {url} time exceeded");
                navigation_timed_out = true;
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        let cookies_saved = cookies.save(Self::SOURCE, &current_cookies).await;

        info!("start performing browser actions that simulate a human");
        instrument_action(
            "Move mouse in browser",
            move_mouse_humanized(surface, &settings.humanize, rng),
        )
        .await?;
        let scroll = instrument_action(
            "Scroll page in browser",
            scroll_until_idle(surface, &settings.scroll_container, &settings.humanize, rng),
        )
        .await?;

        let mut capture = ResponseCapture::new(settings.capture_url_substring.clone());
        capture.ingest_all(surface.take_responses().await);

        let mut offers_seen = 0;
        let mut offers_accepted = 0;
        for payload in capture.payloads() {
            for offer in offers_from_payload(payload) {
                offers_seen += 1;
                if sink.accept(offer) {
                    offers_accepted += 1;
                }
            }
        }

        let report = OfferCaptureReport {
            navigation_timed_out,
            cookies_saved,
            payloads: capture.payloads().len(),
            discarded_responses: capture.discarded(),
            offers_seen,
            offers_accepted,
            scroll,
        };
        info!(
            payloads = report.payloads,
            offers_seen,
            offers_accepted,
            "offer capture finished"
        );
        Ok((sink, report))
    }

    /// Launch a surface, scrape, and release the surface whatever the outcome.
    pub async fn collect<S, R>(
        &self,
        launcher: &dyn SurfaceLauncher,
        options: &LaunchOptions,
        cookies: &CookieStore,
        sink: S,
        rng: &mut R,
    ) -> Result<(S, OfferCaptureReport), ExtractError>
    where
        S: OfferSink + Send,
        R: Rng + Send,
    {
        let surface = launcher.launch(options).await?;
        let outcome = self.scrape(surface.as_ref(), cookies, sink, rng).await;
        close_surface(surface.as_ref()).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedLauncher, ScriptedSurface};
    use credisnap_storage::MemoryBlobStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn fixture(name: &str) -> String {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn offers_response(url: &str, ids: &[&str]) -> ObservedResponse {
        let offers = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "offer_id": id,
                    "ad_label": format!("Offer {id}"),
                    "ad_sum_value": "до 30 000 ₽",
                    "ad_sum_description": "от 5 до 30 дней",
                    "law_psk_rate": "10,0 - 20,0%",
                    "short": {"min_sum": 1000, "max_sum": 30000, "min_term": 5, "max_term": 30}
                })
            })
            .collect::<Vec<_>>();
        ObservedResponse {
            url: url.to_string(),
            status: 200,
            body: serde_json::to_vec(&serde_json::json!({ "offers": offers })).unwrap(),
        }
    }

    #[test]
    fn extracts_review_cards_from_fixture() {
        let html = fixture("finrating/reviews.html");
        let reviews = extract_reviews_from_html(&html, &ReviewSelectors::default()).unwrap();
        assert_eq!(reviews.len(), 3);

        assert_eq!(reviews[0].title, "Хорошо");
        assert_eq!(reviews[0].body, "Все супер, рекомендую");
        assert_eq!(reviews[0].rating_text.as_deref(), Some("5"));
        assert_eq!(reviews[0].date_text, "1 января 2024");

        assert_eq!(reviews[1].title, "");
        assert_eq!(
            reviews[1].body,
            "Долго рассматривали заявку, но в итоге одобрили без лишних вопросов."
        );
        assert_eq!(reviews[1].rating_text.as_deref(), Some("3"));

        assert_eq!(reviews[2].title, "Без оценки");
        assert_eq!(reviews[2].rating_text, None);
        assert_eq!(reviews[2].date_text, "");
    }

    #[test]
    fn normalization_skips_reviews_without_rating() {
        let html = fixture("finrating/reviews.html");
        let raw = extract_reviews_from_html(&html, &ReviewSelectors::default()).unwrap();
        let records = normalize_reviews(raw, ymd(2024, 6, 1));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rating, 5);
        assert_eq!(records[0].published_at, Some(ymd(2024, 1, 1)));
        assert_eq!(
            records[0].fingerprint,
            credisnap_core::review_fingerprint("Хорошо", "1 января 2024", "Все супер, рекомендую")
        );
        assert_eq!(records[1].published_at, Some(ymd(2024, 5, 31)));
    }

    #[test]
    fn non_integer_rating_is_skipped() {
        let raw = vec![RawReview {
            title: "t".into(),
            body: "b".into(),
            rating_text: Some("★★★".into()),
            date_text: "непонятно".into(),
        }];
        assert!(normalize_reviews(raw, ymd(2024, 1, 1)).is_empty());
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = ReviewSelectors {
            card: "div[".to_string(),
            ..ReviewSelectors::default()
        };
        let err = extract_reviews_from_html("<html></html>", &selectors).unwrap_err();
        assert!(matches!(err, ExtractError::Selector { .. }));
    }

    #[test]
    fn capture_keeps_matching_json_and_drops_the_rest() {
        let mut capture = ResponseCapture::new("mpl_offers_light");
        let kept = capture.ingest_all(vec![
            offers_response("https://api.test/mpl_offers_light?page=1", &["a"]),
            ObservedResponse {
                url: "https://api.test/mpl_offers_light?page=2".into(),
                status: 200,
                body: b"<html>blocked</html>".to_vec(),
            },
            ObservedResponse {
                url: "https://api.test/mpl_offers_light?page=3".into(),
                status: 503,
                body: b"{}".to_vec(),
            },
            offers_response("https://api.test/other", &["b"]),
        ]);
        assert_eq!(kept, 1);
        assert_eq!(capture.discarded(), 1);
        assert_eq!(capture.payloads()[0].url, "https://api.test/mpl_offers_light?page=1");
    }

    #[test]
    fn payload_items_with_wrong_shape_are_skipped() {
        let payload = CapturedPayload {
            url: "u".into(),
            payload: serde_json::json!({"offers": [
                {"offer_id": 1, "ad_label": "ok", "law_psk_rate": "1,0 - 2,0%", "short": {}},
                {"offer_id": 2, "ad_label": "no short", "law_psk_rate": "1,0 - 2,0%"},
                "garbage",
                {"ad_label": "no id", "law_psk_rate": "1,0 - 2,0%", "short": {}}
            ]}),
        };
        let offers = offers_from_payload(&payload);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].ad_label, "ok");

        let float_bounds = CapturedPayload {
            url: "u".into(),
            payload: serde_json::json!({"offers": [
                {"offer_id": 3, "ad_label": "float", "law_psk_rate": "1,0%",
                 "short": {"min_sum": 1000, "currency": "RUB", "max_sum": 1500.0}}
            ]}),
        };
        let offers = offers_from_payload(&float_bounds);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].short.max_sum, Some(1500));
        assert_eq!(offers[0].source()["short"]["currency"], "RUB");

        let not_object = CapturedPayload {
            url: "u".into(),
            payload: serde_json::json!([1, 2, 3]),
        };
        assert!(offers_from_payload(&not_object).is_empty());
    }

    #[test]
    fn offers_normalize_with_positions_and_rate_bounds() {
        let payload = CapturedPayload {
            url: "u".into(),
            payload: serde_json::from_slice(&offers_response("u", &["x", "y"]).body).unwrap(),
        };
        let records = normalize_offers(&offers_from_payload(&payload)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].card_index, 1);
        assert_eq!(records[1].card_index, 2);
        assert_eq!(records[1].offer_name, "Offer y");
        assert_eq!(records[0].total_cost_min, 10.0);
        assert_eq!(records[0].total_cost_max, 20.0);
        assert_eq!(records[0].repayment_period.as_deref(), Some("от 5 до 30 дней"));
    }

    #[test]
    fn malformed_rate_aborts_normalization() {
        let offer = RawOffer::from_value(&serde_json::json!({
            "offer_id": 1, "ad_label": "bad", "law_psk_rate": "n/a", "short": {}
        }))
        .unwrap();
        assert!(normalize_offers(&[offer]).is_err());
    }

    #[tokio::test]
    async fn load_more_keeps_probing_after_control_disappears() {
        let control = Control::new("button", Some("Показать ещё отзывы"));
        let surface = ScriptedSurface::new().with_control_states(
            &control,
            [
                ControlState::Enabled,
                ControlState::Absent,
                ControlState::Disabled,
                ControlState::Enabled,
            ],
        );
        let report = paginate_load_more(&surface, &control, 5, Duration::ZERO).await;
        assert_eq!(report, PaginationReport { clicked: 2, skipped: 3 });
        assert_eq!(surface.clicks().len(), 2);
    }

    #[tokio::test]
    async fn mouse_moves_stay_inside_central_viewport() {
        let surface = ScriptedSurface::new().with_viewport(1000.0, 500.0);
        let settings = HumanizeSettings::default().without_delays();
        let mut rng = StdRng::seed_from_u64(7);
        let moves = move_mouse_humanized(&surface, &settings, &mut rng).await.unwrap();

        let recorded = surface.mouse_moves();
        assert!((2..=5).contains(&moves));
        assert_eq!(recorded.len() as u64, moves);
        for (x, y, steps) in recorded {
            assert!((100.0..=900.0).contains(&x), "x={x}");
            assert!((50.0..=450.0).contains(&y), "y={y}");
            assert!((10..=30).contains(&steps));
        }
    }

    #[tokio::test]
    async fn scrolling_stops_after_idle_rounds_at_ceiling() {
        let surface = ScriptedSurface::new()
            .with_scroll_height("section", 1_000.0)
            .with_max_scroll(5_000.0);
        let settings = HumanizeSettings::default().without_delays();
        let mut rng = StdRng::seed_from_u64(1);
        let report = scroll_until_idle(&surface, "section", &settings, &mut rng).await.unwrap();

        assert!(report.reached_end);
        assert!(report.final_scroll_y >= 1_000.0);
        let positions = surface.scroll_positions();
        let past_ceiling = positions.iter().filter(|y| **y >= 1_000.0).count();
        assert_eq!(past_ceiling, 3, "{positions:?}");
    }

    #[tokio::test]
    async fn progress_after_stalled_polls_resets_idle_count() {
        let script = [0.0, 200.0, 200.0, 200.0, 400.0, 400.0, 400.0, 400.0];
        let surface = ScriptedSurface::new()
            .with_scroll_height("section", 10_000.0)
            .with_max_scroll(10_000.0)
            .with_scroll_script(script);
        let settings = HumanizeSettings::default().without_delays();
        let mut rng = StdRng::seed_from_u64(5);
        let report = scroll_until_idle(&surface, "section", &settings, &mut rng).await.unwrap();

        assert!(report.reached_end);
        assert_eq!(report.rounds, 7);
        assert_eq!(report.final_scroll_y, 400.0);
        assert_eq!(surface.scroll_positions(), script.to_vec());
    }

    #[tokio::test]
    async fn scrolling_stops_when_page_bottom_is_below_ceiling() {
        let surface = ScriptedSurface::new()
            .with_scroll_height("section", 10_000.0)
            .with_max_scroll(600.0);
        let settings = HumanizeSettings::default().without_delays();
        let mut rng = StdRng::seed_from_u64(3);
        let report = scroll_until_idle(&surface, "section", &settings, &mut rng).await.unwrap();
        assert!(report.reached_end);
        assert_eq!(report.final_scroll_y, 600.0);
    }

    #[tokio::test]
    async fn missing_scroll_container_skips_scrolling() {
        let surface = ScriptedSurface::new();
        let settings = HumanizeSettings::default().without_delays();
        let mut rng = StdRng::seed_from_u64(3);
        let report = scroll_until_idle(&surface, "section", &settings, &mut rng).await.unwrap();
        assert_eq!(report.rounds, 0);
        assert_eq!(report.ceiling, None);
    }

    #[tokio::test]
    async fn reviews_adapter_paginates_expands_and_extracts() {
        let settings = ReviewSourceSettings::default().without_delays();
        let surface = ScriptedSurface::new()
            .with_content(fixture("finrating/reviews.html"))
            .with_control_states(&settings.load_more, [ControlState::Enabled, ControlState::Absent])
            .with_expandable(&settings.read_more, 2);
        let launcher = ScriptedLauncher::new(surface.clone());
        let adapter = FinratingReviewsAdapter::new(settings);

        let reviews = adapter
            .collect(&launcher, &adapter.launch_options(None))
            .await
            .unwrap();
        assert_eq!(reviews.len(), 3);
        assert_eq!(surface.visited(), vec!["https://credistory.ru/finrating".to_string()]);
        assert_eq!(surface.clicks().len(), 1);
        assert_eq!(surface.expanded(), 2);
        assert!(surface.is_closed());
    }

    #[tokio::test]
    async fn surface_is_closed_when_scrape_fails() {
        let settings = ReviewSourceSettings::default().without_delays();
        let surface = ScriptedSurface::new().with_navigation_failure();
        let launcher = ScriptedLauncher::new(surface.clone());
        let adapter = FinratingReviewsAdapter::new(settings);

        let err = adapter.collect(&launcher, &LaunchOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Surface(SurfaceError::Protocol(_))));
        assert!(surface.is_closed());
    }

    #[tokio::test]
    async fn offers_adapter_captures_and_saves_cookies() {
        let settings = OfferSourceSettings::default().without_delays();
        let cookie = BrowserCookie {
            name: "sid".into(),
            value: "1".into(),
            domain: "credistory.ru".into(),
            path: "/".into(),
            expires: None,
            http_only: false,
            secure: true,
            same_site: None,
        };
        let surface = ScriptedSurface::new()
            .with_scroll_height(&settings.scroll_container, 300.0)
            .with_max_scroll(2_000.0)
            .with_cookies(vec![cookie.clone()])
            .with_response(offers_response("https://x.test/mpl_offers_light/1", &["a", "b"]))
            .with_response(offers_response("https://x.test/mpl_offers_light/2", &["b", "c"]));
        let launcher = ScriptedLauncher::new(surface.clone());
        let blobs = Arc::new(MemoryBlobStore::new());
        let cookies = CookieStore::new(blobs.clone());
        let adapter = MicroloansOffersAdapter::new(settings);
        let mut rng = StdRng::seed_from_u64(11);

        let options = adapter.launch_options(Some(DEFAULT_USER_AGENT.to_string()));
        let (offers, report) = adapter
            .collect(&launcher, &options, &cookies, Vec::new(), &mut rng)
            .await
            .unwrap();

        assert_eq!(offers.len(), 4);
        assert_eq!(report.payloads, 2);
        assert_eq!(report.offers_seen, 4);
        assert!(report.cookies_saved);
        assert!(!report.navigation_timed_out);
        assert!(report.scroll.reached_end);
        assert_eq!(cookies.load(MicroloansOffersAdapter::SOURCE).await, vec![cookie]);
        assert_eq!(launcher.launches()[0].capture_url_substring.as_deref(), Some("mpl_offers_light"));
        assert!(surface.is_closed());
    }

    #[tokio::test]
    async fn offers_navigation_timeout_continues_without_cookies() {
        let settings = OfferSourceSettings::default().without_delays();
        let surface = ScriptedSurface::new()
            .with_navigation_timeout()
            .with_cookies(vec![BrowserCookie {
                name: "late".into(),
                value: "1".into(),
                domain: "credistory.ru".into(),
                path: "/".into(),
                expires: None,
                http_only: false,
                secure: false,
                same_site: None,
            }])
            .with_response(offers_response("https://x.test/mpl_offers_light", &["a"]));
        let blobs = Arc::new(MemoryBlobStore::new());
        let cookies = CookieStore::new(blobs.clone());
        let adapter = MicroloansOffersAdapter::new(settings);
        let mut rng = StdRng::seed_from_u64(5);

        let (offers, report) = adapter
            .scrape(&surface, &cookies, Vec::new(), &mut rng)
            .await
            .unwrap();
        assert!(report.navigation_timed_out);
        assert!(!report.cookies_saved);
        assert_eq!(offers.len(), 1);
        assert!(blobs.get(&CookieStore::blob_name("microloans")).await.is_none());
    }

    #[tokio::test]
    async fn saved_cookies_are_installed_before_navigation() {
        let settings = OfferSourceSettings::default().without_delays();
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .insert(
                &CookieStore::blob_name("microloans"),
                r#"[{"name":"sid","value":"old","domain":"credistory.ru"}]"#,
            )
            .await;
        let cookies = CookieStore::new(blobs);
        let surface = ScriptedSurface::new();
        let adapter = MicroloansOffersAdapter::new(settings);
        let mut rng = StdRng::seed_from_u64(5);

        adapter
            .scrape(&surface, &cookies, Vec::new(), &mut rng)
            .await
            .unwrap();
        let installed = surface.installed_cookies();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].value, "old");
    }

    #[tokio::test]
    async fn instrumented_action_passes_result_through() {
        let ok: Result<u8, SurfaceError> = instrument_action("ok", async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);
        let err: Result<u8, SurfaceError> =
            instrument_action("fail", async { Err(SurfaceError::Script("boom".into())) }).await;
        assert!(matches!(err, Err(SurfaceError::Script(_))));
    }

    #[test]
    fn log_truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("абвгд", 3), "абв");
        assert_eq!(truncate_for_log("ab", 10), "ab");
    }
}
