//! 触发时间计算
//!
//! 所有时间均为UTC毫秒。`next_fire_time`返回严格晚于参考时间的下一次触发，
//! FIXED_RATE以上次触发时间为参考，FIXED_DELAY以上次执行完成时间为参考，二者不可混用。

use std::str::FromStr;

use chrono::{DateTime, Months, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use scheduler_core::{
    models::{parse_job_ids, Job, MisfireStrategy, TriggerType},
    SchedulerError, SchedulerResult,
};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// LAST补偿时向后查找错过触发点的上限
const MAX_MISFIRE_STEPS: usize = 10_000;

/// 日历周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatePeriod {
    PerMillisecond,
    PerSecond,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Semiannual,
    Annual,
    Decennial,
    Centennial,
}

enum PeriodUnit {
    Millis(i64),
    Months(u32),
}

impl DatePeriod {
    fn unit(self) -> PeriodUnit {
        match self {
            DatePeriod::PerMillisecond => PeriodUnit::Millis(1),
            DatePeriod::PerSecond => PeriodUnit::Millis(1_000),
            DatePeriod::Minutely => PeriodUnit::Millis(60_000),
            DatePeriod::Hourly => PeriodUnit::Millis(3_600_000),
            DatePeriod::Daily => PeriodUnit::Millis(86_400_000),
            DatePeriod::Weekly => PeriodUnit::Millis(7 * 86_400_000),
            DatePeriod::Monthly => PeriodUnit::Months(1),
            DatePeriod::Quarterly => PeriodUnit::Months(3),
            DatePeriod::Semiannual => PeriodUnit::Months(6),
            DatePeriod::Annual => PeriodUnit::Months(12),
            DatePeriod::Decennial => PeriodUnit::Months(120),
            DatePeriod::Centennial => PeriodUnit::Months(1_200),
        }
    }
}

/// FIXED_PERIOD的触发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatePeriodValue {
    pub period: DatePeriod,
    pub start: String,
    #[serde(default = "default_step")]
    pub step: u32,
}

fn default_step() -> u32 {
    1
}

impl DatePeriodValue {
    fn parse(value: &str) -> SchedulerResult<(DatePeriod, i64, u32)> {
        let conf: DatePeriodValue =
            serde_json::from_str(value).map_err(|e| invalid(TriggerType::FixedPeriod, value, e))?;
        if conf.step == 0 {
            return Err(invalid(TriggerType::FixedPeriod, value, "step必须大于0"));
        }
        let start = parse_datetime(&conf.start)
            .ok_or_else(|| invalid(TriggerType::FixedPeriod, value, "start格式错误"))?;
        Ok((conf.period, start, conf.step))
    }

    /// 第一个严格晚于`target`的周期起点
    fn next_after(period: DatePeriod, start: i64, step: u32, target: i64) -> Option<i64> {
        if start > target {
            return Some(start);
        }
        match period.unit() {
            PeriodUnit::Millis(unit) => {
                let span = unit.checked_mul(step as i64)?;
                let k = (target - start) / span + 1;
                start.checked_add(k.checked_mul(span)?)
            }
            PeriodUnit::Months(unit) => {
                let span = unit.checked_mul(step)?;
                let start_dt = Utc.timestamp_millis_opt(start).single()?;
                let target_dt = Utc.timestamp_millis_opt(target).single()?;
                let months = months_between(&start_dt, &target_dt);
                let mut k = (months / span).saturating_sub(1);
                loop {
                    let next = start_dt
                        .checked_add_months(Months::new(k.checked_mul(span)?))?
                        .timestamp_millis();
                    if next > target {
                        return Some(next);
                    }
                    k += 1;
                }
            }
        }
    }
}

fn months_between(from: &DateTime<Utc>, to: &DateTime<Utc>) -> u32 {
    use chrono::Datelike;
    let diff = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
    diff.max(0) as u32
}

fn invalid(trigger_type: TriggerType, value: &str, message: impl ToString) -> SchedulerError {
    SchedulerError::InvalidTrigger {
        trigger_type,
        value: value.to_string(),
        message: message.to_string(),
    }
}

pub fn parse_datetime(text: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

pub fn format_datetime(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format(DATETIME_FORMAT).to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// 支持Quartz风格的`?`
fn parse_cron(expr: &str) -> SchedulerResult<Schedule> {
    let normalized = expr.trim().replace('?', "*");
    let fields = normalized.split_whitespace().count();
    if !(6..=7).contains(&fields) {
        return Err(SchedulerError::InvalidCron {
            expr: expr.to_string(),
            message: format!("字段数量必须为6或7，实际为{fields}"),
        });
    }
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

fn parse_positive_millis(trigger_type: TriggerType, value: &str) -> SchedulerResult<i64> {
    match value.trim().parse::<i64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(invalid(trigger_type, value, "必须为正整数(毫秒)")),
    }
}

fn unsupported(trigger_type: TriggerType, op: &str) -> SchedulerError {
    SchedulerError::Unsupported(format!("{trigger_type}不支持{op}"))
}

/// 按触发类型计算触发时间
pub trait TriggerCalculator {
    /// 语法校验，不会报错
    fn validate(&self, value: &str) -> bool;

    /// 严格晚于`reference`的下一次触发
    fn next_fire_time(&self, value: &str, reference: i64) -> SchedulerResult<Option<i64>>;

    /// 最多`count`个依次递增的触发时间
    fn next_fire_times(&self, value: &str, reference: i64, count: usize)
        -> SchedulerResult<Vec<i64>>;

    /// 不早于`start`的第一次触发
    fn first_fire_time(&self, value: &str, start: i64) -> SchedulerResult<Option<i64>>;
}

impl TriggerCalculator for TriggerType {
    fn validate(&self, value: &str) -> bool {
        if value.trim().is_empty() {
            return false;
        }
        match self {
            TriggerType::Cron => parse_cron(value).is_ok(),
            TriggerType::Once => parse_datetime(value).is_some(),
            TriggerType::FixedPeriod => DatePeriodValue::parse(value).is_ok(),
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                parse_positive_millis(*self, value).is_ok()
            }
            TriggerType::Depend => parse_job_ids(value).is_ok(),
        }
    }

    fn next_fire_time(&self, value: &str, reference: i64) -> SchedulerResult<Option<i64>> {
        let next = match self {
            TriggerType::Cron => {
                let schedule = parse_cron(value)?;
                let Some(base) = Utc.timestamp_millis_opt(reference).single() else {
                    return Ok(None);
                };
                schedule.after(&base).next().map(|dt| dt.timestamp_millis())
            }
            TriggerType::Once => {
                let at = parse_datetime(value)
                    .ok_or_else(|| invalid(*self, value, "日期格式必须为yyyy-MM-dd HH:mm:ss"))?;
                (at > reference).then_some(at)
            }
            TriggerType::FixedPeriod => {
                let (period, start, step) = DatePeriodValue::parse(value)?;
                DatePeriodValue::next_after(period, start, step, reference)
            }
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                let interval = parse_positive_millis(*self, value)?;
                reference.checked_add(interval)
            }
            TriggerType::Depend => return Err(unsupported(*self, "计算触发时间")),
        };
        match next {
            Some(n) if n <= reference => Err(SchedulerError::Internal(format!(
                "{self}计算的下次触发时间未晚于参考时间: {value}, {}",
                format_datetime(reference)
            ))),
            other => Ok(other),
        }
    }

    fn next_fire_times(
        &self,
        value: &str,
        reference: i64,
        count: usize,
    ) -> SchedulerResult<Vec<i64>> {
        match self {
            TriggerType::Depend => return Err(unsupported(*self, "计算触发时间")),
            TriggerType::Once if count > 1 => return Err(unsupported(*self, "计算多个触发时间")),
            _ => {}
        }
        let mut result = Vec::with_capacity(count);
        let mut base = reference;
        while result.len() < count {
            match self.next_fire_time(value, base)? {
                Some(next) => {
                    result.push(next);
                    base = next;
                }
                None => break,
            }
        }
        Ok(result)
    }

    fn first_fire_time(&self, value: &str, start: i64) -> SchedulerResult<Option<i64>> {
        match self {
            TriggerType::Cron | TriggerType::Once | TriggerType::FixedPeriod => {
                self.next_fire_time(value, start - 1)
            }
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                parse_positive_millis(*self, value)?;
                Ok(Some(start))
            }
            TriggerType::Depend => Err(unsupported(*self, "计算首次触发时间")),
        }
    }
}

/// 结合起止时间、上次触发时间与补偿策略计算任务的下次触发时间
///
/// 超过结束时间或不会再触发时返回None。DEPEND任务由父任务驱动，总是返回None。
pub fn compute_next_trigger_time(job: &Job, now: i64) -> SchedulerResult<Option<i64>> {
    let next = compute_next_unbounded(job, now)?;
    Ok(next.filter(|n| job.end_time.map_or(true, |end| *n <= end)))
}

fn compute_next_unbounded(job: &Job, now: i64) -> SchedulerResult<Option<i64>> {
    let trigger_type = job.trigger_type;
    if trigger_type == TriggerType::Depend {
        return Ok(None);
    }

    let value = job.trigger_value.as_str();
    let strategy = job.misfire_strategy;
    let start = job.start_time;
    let last = job.last_trigger_time;
    let max = [start, last, Some(now)].into_iter().flatten().max().unwrap_or(now);

    if trigger_type == TriggerType::Once {
        let next = trigger_type.next_fire_time(value, -1)?;
        let invalid = match next {
            None => true,
            Some(n) => {
                start.is_some_and(|s| n < s)
                    || last.is_some_and(|l| n <= l)
                    || (strategy == MisfireStrategy::Discard && n < max)
            }
        };
        return Ok(if invalid { None } else { next });
    }

    if let Some(s) = start {
        if max == s && last != Some(s) {
            // last < now <= start
            return trigger_type.first_fire_time(value, s);
        }
    }

    let Some(last) = last else {
        // 从未触发过
        let next = trigger_type.next_fire_time(value, max)?;
        if strategy == MisfireStrategy::Discard || next.is_some() {
            return Ok(next);
        }
        let Some(first) = trigger_type.first_fire_time(value, start.unwrap_or(-1))? else {
            return Ok(None);
        };
        if start.is_some_and(|s| first < s) {
            return Ok(None);
        }
        if strategy == MisfireStrategy::Every {
            return Ok(Some(first));
        }
        return fire_last_missed(trigger_type, value, first, max);
    };

    let next = match start {
        Some(s) if last < s => trigger_type.first_fire_time(value, s)?,
        _ => trigger_type.next_fire_time(value, last)?,
    };
    let Some(next) = next else {
        return Ok(None);
    };
    if next >= max {
        return Ok(Some(next));
    }

    // start < next < now：有错过的触发
    match strategy {
        MisfireStrategy::Every => Ok(Some(next)),
        MisfireStrategy::Last => fire_last_missed(trigger_type, value, next, max),
        MisfireStrategy::Discard => trigger_type.next_fire_time(value, max),
    }
}

/// 错过多次时只补最近一次错过的触发，只错过一次时保留原触发时间
///
/// 向后查找最多[`MAX_MISFIRE_STEPS`]个触发点，超出时取当前时间补一次。
fn fire_last_missed(
    trigger_type: TriggerType,
    value: &str,
    next: i64,
    max: i64,
) -> SchedulerResult<Option<i64>> {
    let mut latest = next;
    for _ in 0..MAX_MISFIRE_STEPS {
        match trigger_type.next_fire_time(value, latest)? {
            Some(after) if after <= max => latest = after,
            _ => return Ok(Some(latest)),
        }
    }
    Ok(Some(max))
}
