//! Core domain model, content fingerprints and locale parsers for credisnap.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "credisnap-core";

/// Separator placed between fingerprint fields. Occurrences inside a field are escaped.
pub const FINGERPRINT_DELIMITER: char = '|';

/// Number of body characters that take part in a review fingerprint.
pub const REVIEW_BODY_PREFIX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Microloans,
    Reviews,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Microloans => "microloans",
            PipelineKind::Reviews => "reviews",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited extraction-and-persist cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub pipeline: PipelineKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub rows_count: Option<i32>,
}

impl PipelineRun {
    /// Fresh run in `running` status with a newly generated id.
    pub fn start(pipeline: PipelineKind) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            rows_count: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, rows_count: i32) {
        self.status = status;
        self.rows_count = Some(rows_count);
        self.finished_at = Some(Utc::now());
    }
}

/// Hex-encoded SHA-256 digest identifying scraped content without an upstream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash an ordered list of fields. `None` fields hash like empty strings.
///
/// Fields are joined with [`FINGERPRINT_DELIMITER`]; a backslash or delimiter inside a
/// field is backslash-escaped first, so different field splits never produce the same
/// input. Fields without either character hash exactly like a plain `a|b|c` join.
pub fn fingerprint<'a, I>(fields: I) -> Fingerprint
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut joined = String::new();
    for (idx, field) in fields.into_iter().enumerate() {
        if idx > 0 {
            joined.push(FINGERPRINT_DELIMITER);
        }
        for ch in field.unwrap_or_default().chars() {
            if ch == '\\' || ch == FINGERPRINT_DELIMITER {
                joined.push('\\');
            }
            joined.push(ch);
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Review identity: title, raw date text and the first 50 characters of the body.
pub fn review_fingerprint(title: &str, date_text: &str, body: &str) -> Fingerprint {
    let prefix_end = body
        .char_indices()
        .nth(REVIEW_BODY_PREFIX_CHARS)
        .map(|(idx, _)| idx)
        .unwrap_or(body.len());
    fingerprint([Some(title), Some(date_text), Some(&body[..prefix_end])])
}

/// Review as read off the rendered page, before any typing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReview {
    pub title: String,
    pub body: String,
    pub rating_text: Option<String>,
    pub date_text: String,
}

impl RawReview {
    pub fn fingerprint(&self) -> Fingerprint {
        review_fingerprint(&self.title, &self.date_text, &self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub body: String,
    pub rating: i16,
    pub published_at: Option<NaiveDate>,
}

/// Offer identifier as assigned by the marketplace API (number or string on the wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OfferId {
    Number(i64),
    Text(String),
}

impl OfferId {
    fn key(&self) -> String {
        match self {
            OfferId::Number(n) => n.to_string(),
            OfferId::Text(s) => s.clone(),
        }
    }
}

// `17` and `"17"` name the same offer.
impl PartialEq for OfferId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for OfferId {}

impl Hash for OfferId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Amount and term bounds nested under `short` in the offers payload.
///
/// Whole-number floats (`1500.0`) are accepted; other keys land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferBounds {
    #[serde(default, deserialize_with = "whole_number")]
    pub min_sum: Option<i32>,
    #[serde(default, deserialize_with = "whole_number")]
    pub max_sum: Option<i32>,
    #[serde(default, deserialize_with = "whole_number")]
    pub min_term: Option<i32>,
    #[serde(default, deserialize_with = "whole_number")]
    pub max_term: Option<i32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

fn whole_number<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(value) = Option::<f64>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if value.fract() == 0.0 && value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX) {
        Ok(Some(value as i32))
    } else {
        Err(serde::de::Error::custom(format!(
            "expected a whole number within i32 range, got {value}"
        )))
    }
}

/// One validated item from a captured `mpl_offers_light` payload.
///
/// The item is kept verbatim next to its typed view so the raw capture file holds
/// exactly what the site sent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawOffer {
    pub offer_id: OfferId,
    pub ad_label: String,
    #[serde(default)]
    pub ad_sum_value: Option<String>,
    #[serde(default)]
    pub ad_sum_description: Option<String>,
    pub law_psk_rate: String,
    pub short: OfferBounds,
    #[serde(skip)]
    source: JsonValue,
}

impl RawOffer {
    /// Validate the shape of an untyped payload item.
    pub fn from_value(value: &JsonValue) -> Result<Self, serde_json::Error> {
        let mut offer = Self::deserialize(value)?;
        offer.source = value.clone();
        Ok(offer)
    }

    /// The payload item as received.
    pub fn source(&self) -> &JsonValue {
        &self.source
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecord {
    pub card_index: i32,
    pub offer_name: String,
    pub available_amount: Option<String>,
    pub repayment_period: Option<String>,
    pub total_cost: String,
    pub avail_amount_min: Option<i32>,
    pub avail_amount_max: Option<i32>,
    pub repayment_period_min: Option<i32>,
    pub repayment_period_max: Option<i32>,
    pub total_cost_min: f64,
    pub total_cost_max: f64,
}

impl OfferRecord {
    /// Normalize a validated offer at its 1-based page position.
    pub fn from_raw(card_index: i32, raw: &RawOffer) -> Result<Self, ParseError> {
        let range = parse_rate_range(&raw.law_psk_rate)?;
        Ok(Self {
            card_index,
            offer_name: raw.ad_label.trim().to_string(),
            available_amount: raw.ad_sum_value.clone(),
            repayment_period: raw.ad_sum_description.clone(),
            total_cost: raw.law_psk_rate.clone(),
            avail_amount_min: raw.short.min_sum,
            avail_amount_max: raw.short.max_sum,
            repayment_period_min: raw.short.min_term,
            repayment_period_max: raw.short.max_term,
            total_cost_min: range.min,
            total_cost_max: range.max,
        })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("rate range is empty")]
    EmptyRate,
    #[error("invalid rate bound {bound:?} in {input:?}")]
    RateBound { input: String, bound: String },
    #[error("rate range {input:?} has min {min} above max {max}")]
    InvertedRange { input: String, min: f64, max: f64 },
    #[error("rating {0:?} is not an integer")]
    Rating(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRange {
    pub min: f64,
    pub max: f64,
}

/// Parse a locale-formatted percent range such as `"12,5 - 25,0%"`.
///
/// A single value (`"15,0%"`) yields equal bounds.
pub fn parse_rate_range(input: &str) -> Result<RateRange, ParseError> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyRate);
    }
    let normalized = trimmed.replace(',', ".");
    let (min_text, max_text) = normalized
        .split_once(" - ")
        .unwrap_or((normalized.as_str(), normalized.as_str()));
    let min = parse_rate_bound(input, min_text)?;
    let max = parse_rate_bound(input, max_text)?;
    if min > max {
        return Err(ParseError::InvertedRange {
            input: input.to_string(),
            min,
            max,
        });
    }
    Ok(RateRange { min, max })
}

fn parse_rate_bound(input: &str, bound: &str) -> Result<f64, ParseError> {
    let bound = bound.trim();
    let err = || ParseError::RateBound {
        input: input.to_string(),
        bound: bound.to_string(),
    };
    let value: f64 = bound.parse().map_err(|_| err())?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(err())
    }
}

pub fn parse_rating(text: &str) -> Result<i16, ParseError> {
    text.trim()
        .parse::<i16>()
        .map_err(|_| ParseError::Rating(text.to_string()))
}

static DAY_MONTH_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})\s+([а-яё]+)\.?(?:\s+(\d{4}))?").expect("valid day-month regex")
});
static NUMERIC_DMY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{4})").expect("valid dmy regex"));
static ISO_YMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})").expect("valid ymd regex"));
static UNITS_AGO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(\d+)\s+)?(минут[уы]?|час(?:а|ов)?|день|дня|дней|недел[юиь]|месяц(?:а|ев)?|год(?:а)?|лет)\s+назад",
    )
    .expect("valid units-ago regex")
});

fn russian_month(word: &str) -> Option<u32> {
    let stem: String = word.chars().take(3).collect();
    let month = match stem.as_str() {
        "янв" => 1,
        "фев" => 2,
        "мар" => 3,
        "апр" => 4,
        "мая" | "май" => 5,
        "июн" => 6,
        "июл" => 7,
        "авг" => 8,
        "сен" => 9,
        "окт" => 10,
        "ноя" => 11,
        "дек" => 12,
        _ => return None,
    };
    Some(month)
}

/// Step back `count` units named by a Russian noun form. Minutes and hours stay on `today`.
fn units_before(today: NaiveDate, unit: &str, count: u32) -> Option<NaiveDate> {
    if unit.starts_with("минут") || unit.starts_with("час") {
        Some(today)
    } else if unit.starts_with("д") {
        today.checked_sub_signed(Duration::days(i64::from(count)))
    } else if unit.starts_with("недел") {
        today.checked_sub_signed(Duration::weeks(i64::from(count)))
    } else if unit.starts_with("месяц") {
        today.checked_sub_months(Months::new(count))
    } else {
        today.checked_sub_months(Months::new(count.checked_mul(12)?))
    }
}

/// Parse the date label of a review card (`"1 января 2024"`, `"вчера"`, `"3 дня назад"`,
/// `"2 недели назад"`, `"01.02.2024"`). Relative forms resolve against `today`; a day and
/// month without a year take the latest such date not after `today`.
pub fn parse_review_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    match lower.as_str() {
        "сегодня" | "только что" => return Some(today),
        "вчера" => return today.checked_sub_signed(Duration::days(1)),
        "позавчера" => return today.checked_sub_signed(Duration::days(2)),
        _ => {}
    }
    if let Some(caps) = UNITS_AGO.captures(&lower) {
        let count: u32 = match caps.get(1) {
            Some(n) => n.as_str().parse().ok()?,
            None => 1,
        };
        return units_before(today, &caps[2], count);
    }
    if let Some(caps) = ISO_YMD.captures(&lower) {
        return NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?);
    }
    if let Some(caps) = NUMERIC_DMY.captures(&lower) {
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?);
    }
    let caps = DAY_MONTH_YEAR.captures(&lower)?;
    let day: u32 = caps[1].parse().ok()?;
    let month = russian_month(&caps[2])?;
    match caps.get(3) {
        Some(year) => NaiveDate::from_ymd_opt(year.as_str().parse().ok()?, month, day),
        None => {
            let this_year = NaiveDate::from_ymd_opt(today.year(), month, day);
            match this_year {
                Some(date) if date <= today => Some(date),
                _ => NaiveDate::from_ymd_opt(today.year() - 1, month, day),
            }
        }
    }
}
