use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When a scheduled entry fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Date {
        run_at: DateTime<Utc>,
    },
    Interval {
        seconds: u64,
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        #[serde(default)]
        end: Option<DateTime<Utc>>,
        /// Upper bound, in seconds, of the random delay added to each fire time.
        #[serde(default)]
        jitter: Option<u64>,
    },
    Cron(CronFields),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronFields {
    #[serde(default = "any")]
    pub minute: String,
    #[serde(default = "any")]
    pub hour: String,
    #[serde(default = "any")]
    pub day: String,
    #[serde(default = "any")]
    pub month: String,
    /// Weekdays are kept as names (`mon`, `sat-sun`); crontab strings carry numbers.
    #[serde(default = "any")]
    pub weekday: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

fn any() -> String { "*".to_string() }

const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Longest accepted interval. Keeps interval arithmetic inside chrono's range.
pub const MAX_INTERVAL_SECONDS: u64 = (i64::MAX / 1000) as u64;

impl Default for CronFields {
    fn default() -> Self {
        Self {
            minute: any(),
            hour: any(),
            day: any(),
            month: any(),
            weekday: any(),
            start: None,
            end: None,
        }
    }
}

impl CronFields {
    /// Parse a five-field crontab expression (`min hour day month weekday`).
    pub fn from_crontab(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            bail!(
                "Invalid crontab '{}': expected 5 fields, found {}",
                expression,
                parts.len()
            );
        }
        let fields = Self {
            minute: parts[0].to_string(),
            hour: parts[1].to_string(),
            day: parts[2].to_string(),
            month: parts[3].to_string(),
            weekday: map_weekday_field(parts[4], WeekdayStyle::Name)?,
            start: None,
            end: None,
        };
        fields.schedule()?;
        Ok(fields)
    }

    pub fn to_crontab(&self) -> String {
        // Fields are validated on the way in; fall back to the raw text otherwise.
        let weekday = map_weekday_field(&self.weekday, WeekdayStyle::Number)
            .unwrap_or_else(|_| self.weekday.clone());
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day, self.month, weekday
        )
    }

    fn schedule(&self) -> Result<Schedule> {
        let weekday = map_weekday_field(&self.weekday, WeekdayStyle::Cron)?;
        // The cron crate wants a leading seconds field.
        let expression = format!(
            "0 {} {} {} {} {}",
            self.minute, self.hour, self.day, self.month, weekday
        );
        Schedule::from_str(&expression)
            .map_err(|e| anyhow!("Invalid cron fields '{}': {}", self.to_crontab(), e))
    }
}

/// How weekdays are written out.
#[derive(Clone, Copy)]
enum WeekdayStyle {
    /// Structured fields: `sat-sun`.
    Name,
    /// Crontab: `6-7`.
    Number,
    /// The cron crate: `Sat,Sun`. Its ordinals run Sun=1..Sat=7, so a range
    /// ending on Sunday is written as a list.
    Cron,
}

impl WeekdayStyle {
    /// `index` is 0..=7; 7 is Sunday as the upper end of a range.
    fn render(self, index: usize) -> String {
        let name = WEEKDAYS[index % 7];
        match self {
            WeekdayStyle::Name => name.to_string(),
            WeekdayStyle::Number => index.to_string(),
            WeekdayStyle::Cron => {
                let mut chars = name.chars();
                chars
                    .next()
                    .map(|c| c.to_ascii_uppercase().to_string() + chars.as_str())
                    .unwrap_or_default()
            }
        }
    }
}

/// Rewrite every name/number in a weekday field, keeping `*`, ranges and steps.
fn map_weekday_field(field: &str, style: WeekdayStyle) -> Result<String> {
    let mut out = Vec::new();
    for element in field.split(',') {
        let element = element.trim();
        let (range, step) = match element.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(n) if n > 0 => (range, Some(n)),
                _ => bail!("Invalid weekday step: {}", element),
            },
            None => (element, None),
        };

        if range == "*" {
            out.push(with_step(range.to_string(), step));
        } else if let Some((low, high)) = range.split_once('-') {
            let low = weekday_index(low)?;
            // Sunday closes a range as 7.
            let high = match weekday_index(high)? {
                0 => 7,
                n => n,
            };
            if low > high {
                bail!("Invalid weekday range: {}", range);
            }
            match style {
                WeekdayStyle::Cron if high == 7 => {
                    let mut days: Vec<String> = Vec::new();
                    for index in (low..=high).step_by(step.unwrap_or(1)) {
                        let day = style.render(index);
                        if !days.contains(&day) {
                            days.push(day);
                        }
                    }
                    out.push(days.join(","));
                }
                _ => out.push(with_step(format!("{}-{}", style.render(low), style.render(high)), step)),
            }
        } else {
            out.push(with_step(style.render(weekday_index(range)?), step));
        }
    }
    Ok(out.join(","))
}

fn with_step(range: String, step: Option<usize>) -> String {
    match step {
        Some(step) => format!("{}/{}", range, step),
        None => range,
    }
}

fn weekday_index(token: &str) -> Result<usize> {
    let token = token.trim().to_lowercase();
    if let Ok(n) = token.parse::<usize>() {
        return match n {
            0..=6 => Ok(n),
            7 => Ok(0),
            _ => Err(anyhow!("Invalid weekday: {}", token)),
        };
    }
    let index = match token.as_str() {
        "sun" | "sunday" => 0,
        "mon" | "monday" => 1,
        "tue" | "tuesday" => 2,
        "wed" | "wednesday" => 3,
        "thu" | "thursday" => 4,
        "fri" | "friday" => 5,
        "sat" | "saturday" => 6,
        _ => return Err(anyhow!("Invalid weekday: {}", token)),
    };
    Ok(index)
}

/// Parse the operator shorthand: `every 30s`, `at <rfc3339>`, or a crontab string.
pub fn parse_trigger(s: &str) -> Result<Trigger> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("every ") {
        let seconds = parse_duration(rest.trim())?;
        Ok(Trigger::Interval { seconds, start: None, end: None, jitter: None })
    } else if let Some(rest) = s.strip_prefix("at ") {
        let run_at = DateTime::parse_from_rfc3339(rest.trim())
            .map_err(|e| anyhow!("Invalid date '{}': {}", rest.trim(), e))?
            .with_timezone(&Utc);
        Ok(Trigger::Date { run_at })
    } else {
        Ok(Trigger::Cron(CronFields::from_crontab(s)?))
    }
}

pub fn parse_duration(s: &str) -> Result<u64> {
    let Some((split, unit)) = s.char_indices().last() else {
        bail!("Empty duration");
    };
    let n: u64 = s[..split].parse().map_err(|_| anyhow!("Invalid duration: {}", s))?;
    let factor = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => bail!("Unknown unit: {}", unit),
    };
    n.checked_mul(factor)
        .filter(|seconds| *seconds <= MAX_INTERVAL_SECONDS)
        .ok_or_else(|| anyhow!("Duration too long: {}", s))
}

impl Trigger {
    pub fn validate(&self) -> Result<()> {
        match self {
            Trigger::Date { .. } => Ok(()),
            Trigger::Interval { seconds, start, end, jitter } => {
                if *seconds == 0 {
                    bail!("Interval must be at least one second");
                }
                if *seconds > MAX_INTERVAL_SECONDS {
                    bail!("Interval of {}s exceeds the maximum of {}s", seconds, MAX_INTERVAL_SECONDS);
                }
                if let Some(jitter) = jitter {
                    if *jitter > MAX_INTERVAL_SECONDS {
                        bail!("Jitter of {}s exceeds the maximum of {}s", jitter, MAX_INTERVAL_SECONDS);
                    }
                }
                check_bounds(*start, *end)
            }
            Trigger::Cron(fields) => {
                fields.schedule()?;
                check_bounds(fields.start, fields.end)
            }
        }
    }

    /// Fold task-level dates into the trigger's bounds. Date triggers are unaffected.
    pub fn bounded(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        match &mut self {
            Trigger::Date { .. } => {}
            Trigger::Interval { start: s, end: e, .. } => {
                if start.is_some() {
                    *s = start;
                }
                if end.is_some() {
                    *e = end;
                }
            }
            Trigger::Cron(fields) => {
                if start.is_some() {
                    fields.start = start;
                }
                if end.is_some() {
                    fields.end = end;
                }
            }
        }
        self
    }

    pub fn jitter(&self) -> u64 {
        match self {
            Trigger::Interval { jitter: Some(j), .. } => *j,
            _ => 0,
        }
    }

    /// First fire time for a freshly registered entry. Past dates are kept so the
    /// scheduler's misfire policy decides whether they still run.
    pub fn first_fire_time(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date { run_at } => Some(*run_at),
            _ => self.next_fire_time(now, tz),
        }
    }

    /// Earliest fire time strictly after `after`, without jitter. `None` also
    /// when the next fire would fall outside chrono's range.
    pub fn next_fire_time(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date { run_at } => (*run_at > after).then_some(*run_at),
            Trigger::Interval { seconds, start, end, .. } => {
                let period = i64::try_from(*seconds).ok().filter(|p| *p > 0)?;
                let anchor = start.unwrap_or(after);
                let next = if anchor > after {
                    anchor
                } else {
                    let periods = ((after - anchor).num_seconds() / period).checked_add(1)?;
                    let offset = Duration::try_seconds(period.checked_mul(periods)?)?;
                    anchor.checked_add_signed(offset)?
                };
                within(next, *end)
            }
            Trigger::Cron(fields) => {
                let schedule = fields.schedule().ok()?;
                let from = match fields.start {
                    Some(start) if start > after => start - Duration::seconds(1),
                    _ => after,
                };
                let next = schedule
                    .after(&from.with_timezone(&tz))
                    .next()?
                    .with_timezone(&Utc);
                within(next, fields.end)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Date { run_at } => format!("at {}", run_at.to_rfc3339()),
            Trigger::Interval { seconds, jitter, .. } => match jitter {
                Some(j) if *j > 0 => format!("every {}s (jitter up to {}s)", seconds, j),
                _ => format!("every {}s", seconds),
            },
            Trigger::Cron(fields) => format!("cron {}", fields.to_crontab()),
        }
    }
}

fn check_bounds(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<()> {
    match (start, end) {
        (Some(s), Some(e)) if e <= s => Err(anyhow!("End date {} is not after start date {}", e, s)),
        _ => Ok(()),
    }
}

fn within(next: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match end {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}
