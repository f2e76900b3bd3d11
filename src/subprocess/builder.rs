use std::collections::HashMap;
use std::time::Duration;

use crate::subprocess::ToolRequest;

pub struct ToolRequestBuilder {
    request: ToolRequest,
}

impl ToolRequestBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            request: ToolRequest {
                program: program.to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                working_dir: None,
                timeout: None,
                input: None,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.request.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.request
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.request.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    /// Fill in a timeout only when the request does not carry one already.
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        if self.request.timeout.is_none() {
            self.request.timeout = timeout;
        }
        self
    }

    pub fn input(mut self, input: String) -> Self {
        self.request.input = Some(input);
        self
    }

    pub fn build(self) -> ToolRequest {
        self.request
    }
}

impl From<ToolRequest> for ToolRequestBuilder {
    fn from(request: ToolRequest) -> Self {
        Self { request }
    }
}
