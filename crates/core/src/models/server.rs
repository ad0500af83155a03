use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;

/// 注册中心中的服务器角色
pub trait Server:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + FromStr<Err = SchedulerError> + Send + Sync + 'static
{
    /// 角色名，用作注册中心的命名空间
    fn role() -> &'static str;

    /// 所属分组，Supervisor没有分组
    fn group(&self) -> Option<&str>;

    /// 网络地址
    fn address(&self) -> String;
}

/// Worker身份标识：(group, worker_id, host, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Worker {
    pub group: String,
    pub worker_id: String,
    pub host: String,
    pub port: u16,
}

impl Worker {
    pub fn new(
        group: impl Into<String>,
        worker_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            group: group.into(),
            worker_id: worker_id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn same_group(&self, group: &str) -> bool {
        self.group == group
    }
}

impl Server for Worker {
    fn role() -> &'static str {
        "worker"
    }

    fn group(&self) -> Option<&str> {
        Some(&self.group)
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.group, self.worker_id, self.host, self.port)
    }
}

impl FromStr for Worker {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // host可能是IPv6，所以从两端拆分
        let mut head = s.splitn(3, ':');
        let group = head.next().filter(|v| !v.is_empty());
        let worker_id = head.next().filter(|v| !v.is_empty());
        let rest = head.next();
        let (group, worker_id, rest) = match (group, worker_id, rest) {
            (Some(g), Some(w), Some(r)) => (g, w, r),
            _ => return Err(invalid_server("worker", s)),
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid_server("worker", s))?;
        let port = port.parse().map_err(|_| invalid_server("worker", s))?;
        if host.is_empty() {
            return Err(invalid_server("worker", s));
        }
        Ok(Worker::new(group, worker_id, host, port))
    }
}

/// Supervisor身份标识：(host, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Supervisor {
    pub host: String,
    pub port: u16,
}

impl Supervisor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Server for Supervisor {
    fn role() -> &'static str {
        "supervisor"
    }

    fn group(&self) -> Option<&str> {
        None
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Supervisor {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid_server("supervisor", s))?;
        let port = port.parse().map_err(|_| invalid_server("supervisor", s))?;
        if host.is_empty() {
            return Err(invalid_server("supervisor", s));
        }
        Ok(Supervisor::new(host, port))
    }
}

fn invalid_server(role: &str, text: &str) -> SchedulerError {
    SchedulerError::InvalidJobParam(format!("无效的{role}标识: {text}"))
}

macro_rules! serde_as_string {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_as_string!(Worker);
serde_as_string!(Supervisor);
