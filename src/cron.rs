use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::constants::{CRON_JOBS_KEY, CRON_NEXT_RUN_PREFIX, CRON_SCHEDULE_KEY};
use crate::job::now_secs;

const SEARCH_LIMIT: usize = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    Exact(u32),
}

impl Field {
    fn matches(self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(step) => value % step == 0,
            Field::Exact(expected) => value == expected,
        }
    }
}

fn parse_field(token: &str) -> Result<Field> {
    if token == "*" {
        return Ok(Field::Any);
    }
    if let Some(step) = token.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .with_context(|| format!("invalid step in cron field '{token}'"))?;
        if step == 0 {
            bail!("cron step must be positive in '{token}'");
        }
        return Ok(Field::Step(step));
    }
    let value: u32 = token
        .parse()
        .with_context(|| format!("invalid cron field '{token}'"))?;
    Ok(Field::Exact(value))
}

/// A restricted cron expression: 5 fields (`minute hour day month weekday`)
/// or 6 with a leading `second` field. Each field is `*`, `*/N` (matches
/// when `value % N == 0`), or a literal integer. Weekday 0 is Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    second: Field,
    minute: Field,
    hour: Field,
    day: Field,
    month: Field,
    weekday: Field,
    has_seconds: bool,
}

impl FromStr for CronExpression {
    type Err = anyhow::Error;

    fn from_str(expr: &str) -> Result<Self> {
        let tokens: Vec<&str> = expr.split_whitespace().collect();
        let (has_seconds, rest) = match tokens.len() {
            5 => (false, &tokens[..]),
            6 => (true, &tokens[1..]),
            count => bail!("cron expression '{expr}' has {count} fields, expected 5 or 6"),
        };
        let second = if has_seconds {
            parse_field(tokens[0])?
        } else {
            Field::Any
        };
        Ok(Self {
            source: expr.to_string(),
            second,
            minute: parse_field(rest[0])?,
            hour: parse_field(rest[1])?,
            day: parse_field(rest[2])?,
            month: parse_field(rest[3])?,
            weekday: parse_field(rest[4])?,
            has_seconds,
        })
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpression {
    fn matches(&self, t: DateTime<Utc>) -> bool {
        (!self.has_seconds || self.second.matches(t.second()))
            && self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day.matches(t.day())
            && self.month.matches(t.month())
            && self.weekday.matches(t.weekday().num_days_from_sunday())
    }
}

/// The first matching instant strictly after `from`, searching one unit at
/// a time (seconds for 6-field expressions, minutes for 5-field) up to
/// 86 400 steps.
pub fn next_run(expr: &CronExpression, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let step = if expr.has_seconds {
        Duration::seconds(1)
    } else {
        Duration::minutes(1)
    };
    let from = from.with_nanosecond(0).unwrap_or(from);
    let base = if expr.has_seconds {
        from
    } else {
        from.with_second(0).unwrap_or(from)
    };
    let mut candidate = base + step;
    for _ in 0..SEARCH_LIMIT {
        if expr.matches(candidate) {
            return Ok(candidate);
        }
        candidate = candidate + step;
    }
    bail!("cron expression '{expr}' matches nothing within {SEARCH_LIMIT} steps")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronEntry {
    pub class: String,
    pub cron: String,
    pub queue: String,
    pub registered_at: f64,
}

impl CronEntry {
    pub fn new(
        class: impl Into<String>,
        cron: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            cron: cron.into(),
            queue: queue.into(),
            registered_at: now_secs(),
        }
    }
}

/// Redis-persisted cron definitions plus a sorted next-run index. Shares
/// the default connection with the promoters and the producer client.
#[derive(Clone)]
pub struct CronRegistry {
    conn: redis::aio::MultiplexedConnection,
}

impl CronRegistry {
    pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
        Self { conn }
    }

    fn next_run_key(class: &str) -> String {
        format!("{CRON_NEXT_RUN_PREFIX}{class}")
    }

    /// Idempotent per class: the entry definition is overwritten, but the
    /// next-run schedule is only seeded when no `cron:next_run:<class>` key
    /// exists yet. An invalid expression fails before anything is written.
    pub async fn register(&mut self, entry: &CronEntry) -> Result<()> {
        let expr = CronExpression::from_str(&entry.cron)
            .with_context(|| format!("refusing to register cron class '{}'", entry.class))?;
        let payload = serde_json::to_string(entry).context("failed to serialize cron entry")?;
        self.conn
            .hset::<_, _, _, ()>(CRON_JOBS_KEY, &entry.class, payload)
            .await?;
        let already_scheduled: bool = self
            .conn
            .exists(Self::next_run_key(&entry.class))
            .await?;
        if !already_scheduled {
            let next = next_run(&expr, Utc::now())?;
            self.schedule_job(&entry.class, next.timestamp() as f64)
                .await?;
        }
        Ok(())
    }

    pub async fn schedule_job(&mut self, class: &str, at: f64) -> Result<()> {
        self.conn
            .set::<_, _, ()>(Self::next_run_key(class), at)
            .await?;
        self.conn
            .zadd::<_, _, _, ()>(CRON_SCHEDULE_KEY, class, at)
            .await?;
        Ok(())
    }

    pub async fn next_run_at(&mut self, class: &str) -> Result<Option<f64>> {
        let at: Option<f64> = self.conn.get(Self::next_run_key(class)).await?;
        Ok(at)
    }

    /// Returns the entries due at `now`, removing each from the schedule as
    /// it is claimed.
    pub async fn due_jobs(&mut self, now: f64) -> Result<Vec<CronEntry>> {
        let due: Vec<String> = self
            .conn
            .zrangebyscore(CRON_SCHEDULE_KEY, "-inf", now)
            .await?;
        let mut entries = Vec::with_capacity(due.len());
        for class in due {
            let removed: i64 = self.conn.zrem(CRON_SCHEDULE_KEY, &class).await?;
            if removed == 0 {
                continue;
            }
            let payload: Option<String> = self.conn.hget(CRON_JOBS_KEY, &class).await?;
            let Some(payload) = payload else {
                tracing::warn!(class = %class, "cron schedule entry without a stored definition");
                continue;
            };
            match serde_json::from_str(&payload) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::error!(class = %class, "dropping undecodable cron entry: {err}");
                }
            }
        }
        Ok(entries)
    }

    pub async fn entries(&mut self) -> Result<Vec<CronEntry>> {
        let raw: std::collections::HashMap<String, String> =
            self.conn.hgetall(CRON_JOBS_KEY).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for (class, payload) in raw {
            match serde_json::from_str(&payload) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::error!(class = %class, "skipping undecodable cron entry: {err}");
                }
            }
        }
        Ok(entries)
    }

    pub async fn clear_all(&mut self) -> Result<()> {
        self.conn
            .del::<_, ()>(vec![CRON_JOBS_KEY, CRON_SCHEDULE_KEY])
            .await?;
        let pattern = format!("{CRON_NEXT_RUN_PREFIX}*");
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut self.conn)
                .await?;
            if !keys.is_empty() {
                self.conn.del::<_, ()>(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }
}
