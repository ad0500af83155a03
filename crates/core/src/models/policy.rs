use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;

/// 标签附带的说明信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagInfo {
    pub name: &'static str,
    pub example: &'static str,
    pub description: &'static str,
}

macro_rules! tagged_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => ($tag:literal, $example:literal, $desc:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn info(self) -> TagInfo {
                match self {
                    $($name::$variant => TagInfo {
                        name: $tag,
                        example: $example,
                        description: $desc,
                    }),+
                }
            }

            pub fn name(self) -> &'static str {
                self.info().name
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = SchedulerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.name().eq_ignore_ascii_case(s.trim()))
                    .ok_or_else(|| SchedulerError::InvalidJobParam(format!(
                        concat!("未知的", stringify!($name), ": {}"),
                        s
                    )))
            }
        }
    };
}

tagged_enum! {
    /// 触发类型
    pub enum TriggerType {
        Cron => ("CRON", "0/10 * * * * ?", "CRON表达式"),
        Once => ("ONCE", "2000-01-01 00:00:00", "指定时间执行一次"),
        FixedPeriod => (
            "FIXED_PERIOD",
            r#"{"period":"DAILY","start":"2000-01-01 00:00:00","step":1}"#,
            "按日历周期执行"
        ),
        FixedRate => ("FIXED_RATE", "60000", "固定频率(毫秒)，以上次触发时间为基准"),
        FixedDelay => ("FIXED_DELAY", "60000", "固定延时(毫秒)，以上次执行完成时间为基准"),
        Depend => ("DEPEND", "1003164910267351000,1003164910267351001", "依赖的父任务ID列表"),
    }
}

impl TriggerType {
    /// 下次触发时间在实例完成后才计算
    pub fn is_completion_anchored(self) -> bool {
        self == TriggerType::FixedDelay
    }
}

tagged_enum! {
    /// 重叠策略：上一次实例未结束时新的触发如何处理
    pub enum CollidedStrategy {
        Concurrent => ("CONCURRENT", "", "并行执行"),
        Serial => ("SERIAL", "", "串行执行，推迟本次触发"),
        Override => ("OVERRIDE", "", "取消上一次实例"),
        Discard => ("DISCARD", "", "丢弃本次触发"),
    }
}

tagged_enum! {
    /// 错过触发时间的补偿策略
    pub enum MisfireStrategy {
        Last => ("LAST", "", "只补最近一次"),
        Discard => ("DISCARD", "", "全部丢弃"),
        Every => ("EVERY", "", "全部补偿"),
    }
}

tagged_enum! {
    /// 路由策略
    pub enum RouteStrategy {
        RoundRobin => ("ROUND_ROBIN", "", "轮询"),
        Random => ("RANDOM", "", "随机"),
        SimpleHash => ("SIMPLE_HASH", "", "简单哈希"),
        ConsistentHash => ("CONSISTENT_HASH", "", "一致性哈希"),
        LocalPriority => ("LOCAL_PRIORITY", "", "本地优先"),
        Broadcast => ("BROADCAST", "", "广播"),
    }
}

impl RouteStrategy {
    pub fn is_broadcast(self) -> bool {
        self == RouteStrategy::Broadcast
    }
}

tagged_enum! {
    /// 失败重试类型
    pub enum RetryType {
        None => ("NONE", "", "不重试"),
        All => ("ALL", "", "重新拆分全部任务"),
        Failed => ("FAILED", "", "只重试失败的任务"),
    }
}

tagged_enum! {
    /// 实例运行类型
    pub enum RunType {
        Schedule => ("SCHEDULE", "", "调度计划"),
        Depend => ("DEPEND", "", "任务依赖"),
        Retry => ("RETRY", "", "失败重试"),
        Manual => ("MANUAL", "", "手动触发"),
    }
}

tagged_enum! {
    /// 任务状态
    pub enum JobState {
        Disable => ("DISABLE", "", "禁用"),
        Enable => ("ENABLE", "", "启用"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!("cron".parse::<TriggerType>().unwrap(), TriggerType::Cron);
        assert_eq!(
            "FIXED_PERIOD".parse::<TriggerType>().unwrap(),
            TriggerType::FixedPeriod
        );
        assert_eq!(
            " consistent_hash ".parse::<RouteStrategy>().unwrap(),
            RouteStrategy::ConsistentHash
        );
        assert!("unknown".parse::<MisfireStrategy>().is_err());
    }

    #[test]
    fn test_serde_uses_tag_names() {
        let json = serde_json::to_string(&CollidedStrategy::Override).unwrap();
        assert_eq!(json, "\"OVERRIDE\"");
        let parsed: TriggerType = serde_json::from_str("\"FIXED_DELAY\"").unwrap();
        assert_eq!(parsed, TriggerType::FixedDelay);
        assert_eq!(TriggerType::FixedDelay.to_string(), "FIXED_DELAY");
    }
}
