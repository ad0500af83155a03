use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use scheduler_core::traits::JobHandler;

use crate::handlers::{HttpHandler, ShellHandler};

pub const SHELL_HANDLER: &str = "shell";
pub const HTTP_HANDLER: &str = "http";

/// 按名称查找任务处理器，启动后只读
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包含内置的shell与http处理器
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(SHELL_HANDLER, Arc::new(ShellHandler::new()))
            .register(HTTP_HANDLER, Arc::new(HttpHandler::new()));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        let name = name.into();
        info!("注册任务处理器: {}", name);
        self.handlers.insert(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
