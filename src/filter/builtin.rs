//! Built-in filters.

use serde::Deserialize;
use std::sync::Arc;

use crate::filter::factory::{FilterConfigError, FilterFactory};
use crate::filter::{Filter, FilterContext, FilterError};

pub const REQUEST_LOGGER: &str = "request-logger";
pub const CLIENT_ID_PREFIX: &str = "client-id-prefix";

fn parse_config<T>(filter_type: &str, config: &toml::Value) -> Result<T, FilterConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    config.clone().try_into().map_err(|e: toml::de::Error| FilterConfigError::InvalidConfig {
        filter_type: filter_type.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RequestLoggerConfig {
    log_responses: bool,
}

impl Default for RequestLoggerConfig {
    fn default() -> Self {
        Self { log_responses: true }
    }
}

/// Logs every frame it sees and forwards it unchanged.
#[derive(Debug)]
pub struct RequestLoggerFactory {
    log_responses: bool,
}

impl RequestLoggerFactory {
    pub fn from_config(config: &toml::Value) -> Result<Arc<dyn FilterFactory>, FilterConfigError> {
        let config: RequestLoggerConfig = parse_config(REQUEST_LOGGER, config)?;
        Ok(Arc::new(Self {
            log_responses: config.log_responses,
        }))
    }
}

impl FilterFactory for RequestLoggerFactory {
    fn name(&self) -> &str {
        REQUEST_LOGGER
    }

    fn create_filter(&self) -> Result<Filter, FilterError> {
        let builder = Filter::builder(REQUEST_LOGGER).on_any_request(|header, body, ctx: FilterContext| async move {
            tracing::info!(
                channel = %ctx.channel_descriptor(),
                api_key = %header.api_key,
                api_version = header.api_version,
                correlation_id = header.correlation_id,
                client_id = header.client_id.as_deref().unwrap_or("-"),
                size = body.len(),
                "Request"
            );
            ctx.forward_request(header, body)
        });
        if !self.log_responses {
            return Ok(builder.build());
        }
        Ok(builder
            .on_any_response(|header, body, ctx: FilterContext| async move {
                tracing::info!(
                    channel = %ctx.channel_descriptor(),
                    correlation_id = header.correlation_id,
                    size = body.len(),
                    "Response"
                );
                ctx.forward_response(header, body)
            })
            .build())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ClientIdPrefixConfig {
    prefix: String,
}

/// Prefixes the client id of every request, e.g. to tag a tenant.
#[derive(Debug)]
pub struct ClientIdPrefixFactory {
    prefix: Arc<str>,
}

impl ClientIdPrefixFactory {
    pub fn new(prefix: impl Into<Arc<str>>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn from_config(config: &toml::Value) -> Result<Arc<dyn FilterFactory>, FilterConfigError> {
        let config: ClientIdPrefixConfig = parse_config(CLIENT_ID_PREFIX, config)?;
        if config.prefix.is_empty() {
            return Err(FilterConfigError::InvalidConfig {
                filter_type: CLIENT_ID_PREFIX.to_string(),
                message: "prefix must not be empty".to_string(),
            });
        }
        Ok(Arc::new(Self::new(config.prefix)))
    }
}

impl FilterFactory for ClientIdPrefixFactory {
    fn name(&self) -> &str {
        CLIENT_ID_PREFIX
    }

    fn create_filter(&self) -> Result<Filter, FilterError> {
        let prefix = Arc::clone(&self.prefix);
        Ok(Filter::builder(CLIENT_ID_PREFIX)
            .on_any_request(move |mut header, body, ctx: FilterContext| {
                let client_id = format!("{}{}", prefix, header.client_id.as_deref().unwrap_or(""));
                header.client_id = Some(client_id);
                async move { ctx.forward_request(header, body) }
            })
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_prefix_requires_a_prefix() {
        let config: toml::Value = toml::from_str("prefix = ''").unwrap();
        assert!(ClientIdPrefixFactory::from_config(&config).is_err());

        let missing = toml::Value::Table(Default::default());
        assert!(matches!(
            ClientIdPrefixFactory::from_config(&missing),
            Err(FilterConfigError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn request_logger_defaults_to_logging_responses() {
        let factory = RequestLoggerFactory::from_config(&toml::Value::Table(Default::default())).unwrap();
        let filter = factory.create_filter().unwrap();
        assert!(filter.handles_response(crate::frame::ApiKey::Fetch, 11));
    }
}
