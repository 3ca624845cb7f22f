use anyhow::Result;
use async_trait::async_trait;
use resources::config::{Method, MethodType};

pub mod http;
pub mod shell;

/// Runs a user method with a string payload and returns whatever the
/// method produced. The only place user logic touches the outside world.
#[async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, method: &Method, payload: &str) -> Result<String>;
}

/// Dispatches to the executor matching the method's type.
#[derive(Debug, Default)]
pub struct Executor {
    shell: shell::ShellExecute,
    http: http::HttpExecute,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Execute for Executor {
    async fn execute(&self, method: &Method, payload: &str) -> Result<String> {
        match method.type_ {
            MethodType::Shell => self.shell.execute(method, payload).await,
            MethodType::Http => self.http.execute(method, payload).await,
        }
    }
}

/// Bound method output quoted in error messages so log lines stay
/// readable.
pub(crate) fn truncate(output: &str) -> String {
    const LIMIT: usize = 256;
    if output.chars().count() <= LIMIT {
        output.to_owned()
    } else {
        let mut truncated: String = output.chars().take(LIMIT).collect();
        truncated.push_str("...");
        truncated
    }
}
