//! Builder-style configuration for [`crate::invoker::Invoker`] and
//! [`crate::executor::Executor`], validated once at `start()`.

use std::time::Duration;

use crate::error::RpcError;
use crate::topic::TopicPattern;

/// How the invoker resolves the topic it expects responses on.
#[derive(Debug, Clone, Default)]
pub enum ResponseTopicStrategy {
    /// Use this exact pattern.
    Explicit(String),
    /// Wrap the request pattern with a prefix and/or suffix segment.
    PrefixSuffix {
        prefix: Option<String>,
        suffix: Option<String>,
    },
    /// `clients/{clientId}/{request}`, applied when nothing else is configured.
    #[default]
    Default,
}

#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub request_topic_pattern: String,
    pub response_topic_strategy: ResponseTopicStrategy,
    pub default_timeout: Duration,
}

impl InvokerConfig {
    pub fn new(request_topic_pattern: impl Into<String>) -> Self {
        Self {
            request_topic_pattern: request_topic_pattern.into(),
            response_topic_strategy: ResponseTopicStrategy::default(),
            default_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_response_topic(mut self, pattern: impl Into<String>) -> Self {
        self.response_topic_strategy = ResponseTopicStrategy::Explicit(pattern.into());
        self
    }

    pub fn with_response_topic_prefix_suffix(
        mut self,
        prefix: Option<String>,
        suffix: Option<String>,
    ) -> Self {
        self.response_topic_strategy = ResponseTopicStrategy::PrefixSuffix { prefix, suffix };
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn resolved_response_pattern(&self, client_id: &str) -> Result<TopicPattern, RpcError> {
        let request = TopicPattern::parse(&self.request_topic_pattern)?;
        let pattern = match &self.response_topic_strategy {
            ResponseTopicStrategy::Explicit(pattern) => pattern.clone(),
            ResponseTopicStrategy::PrefixSuffix { prefix, suffix } => {
                let mut segments = Vec::new();
                if let Some(prefix) = prefix {
                    segments.push(prefix.clone());
                }
                segments.push(request.as_str().to_string());
                if let Some(suffix) = suffix {
                    segments.push(suffix.clone());
                }
                segments.join("/")
            }
            ResponseTopicStrategy::Default => {
                format!("clients/{{clientId}}/{}", request.as_str())
            }
        };
        Ok(TopicPattern::parse(&pattern)?.substitute_token("clientId", client_id)?)
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.default_timeout < Duration::from_secs(1) {
            return Err(RpcError::ConfigurationInvalid {
                message: "default_timeout must be at least 1 second".to_string(),
            });
        }
        TopicPattern::parse(&self.request_topic_pattern)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub request_topic_pattern: String,
    pub execution_timeout: Duration,
    pub cache_ttl: Duration,
    pub idempotent: bool,
    pub concurrency: usize,
    pub shared_subscription_group: Option<String>,
}

impl ExecutorConfig {
    pub fn new(request_topic_pattern: impl Into<String>) -> Self {
        Self {
            request_topic_pattern: request_topic_pattern.into(),
            execution_timeout: Duration::from_secs(10),
            cache_ttl: Duration::ZERO,
            idempotent: false,
            concurrency: 1,
            shared_subscription_group: None,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_idempotent_cache(mut self, idempotent: bool, cache_ttl: Duration) -> Self {
        self.idempotent = idempotent;
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_shared_subscription_group(mut self, group: impl Into<String>) -> Self {
        self.shared_subscription_group = Some(group.into());
        self
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.execution_timeout.is_zero() {
            return Err(RpcError::ConfigurationInvalid {
                message: "execution_timeout must be greater than zero".to_string(),
            });
        }
        if !self.idempotent && !self.cache_ttl.is_zero() {
            return Err(RpcError::ConfigurationInvalid {
                message: "cache_ttl must be zero when the command is not idempotent".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(RpcError::ConfigurationInvalid {
                message: "concurrency must be at least 1".to_string(),
            });
        }
        TopicPattern::parse(&self.request_topic_pattern)?;
        Ok(())
    }
}
