//! Filter results.
//!
//! A request result is exactly one of forward / short-circuit / drop, plus an
//! orthogonal close flag. Response results cannot short-circuit.

use bytes::Bytes;

use crate::filter::FilterError;
use crate::frame::{RequestHeader, ResponseHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Continue to the next filter (or the upstream) with this header and body.
    Forward { header: RequestHeader, body: Bytes },
    /// Answer the client without contacting the upstream.
    ShortCircuit { body: Bytes },
    /// Swallow the request; nothing is written and no response is owed.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFilterResult {
    pub disposition: RequestDisposition,
    pub close_connection: bool,
}

impl RequestFilterResult {
    pub fn forward(header: RequestHeader, body: Bytes) -> Self {
        Self {
            disposition: RequestDisposition::Forward { header, body },
            close_connection: false,
        }
    }

    pub fn short_circuit(body: Bytes) -> Self {
        Self {
            disposition: RequestDisposition::ShortCircuit { body },
            close_connection: false,
        }
    }

    pub fn drop_request() -> Self {
        Self {
            disposition: RequestDisposition::Drop,
            close_connection: false,
        }
    }

    pub fn builder() -> RequestFilterResultBuilder {
        RequestFilterResultBuilder::default()
    }

    pub fn with_close_connection(mut self) -> Self {
        self.close_connection = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseDisposition {
    Forward { header: ResponseHeader, body: Bytes },
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFilterResult {
    pub disposition: ResponseDisposition,
    pub close_connection: bool,
}

impl ResponseFilterResult {
    pub fn forward(header: ResponseHeader, body: Bytes) -> Self {
        Self {
            disposition: ResponseDisposition::Forward { header, body },
            close_connection: false,
        }
    }

    pub fn drop_response() -> Self {
        Self {
            disposition: ResponseDisposition::Drop,
            close_connection: false,
        }
    }

    pub fn builder() -> ResponseFilterResultBuilder {
        ResponseFilterResultBuilder::default()
    }

    pub fn with_close_connection(mut self) -> Self {
        self.close_connection = true;
        self
    }
}

/// Incremental construction of a [`RequestFilterResult`].
///
/// `build` rejects combinations that name more than one outcome, and an empty
/// builder unless a close was requested (which then builds a drop + close).
#[derive(Debug, Default)]
pub struct RequestFilterResultBuilder {
    forward: Option<(RequestHeader, Bytes)>,
    short_circuit: Option<Bytes>,
    drop: bool,
    close_connection: bool,
}

impl RequestFilterResultBuilder {
    pub fn forward(mut self, header: RequestHeader, body: Bytes) -> Self {
        self.forward = Some((header, body));
        self
    }

    pub fn short_circuit_response(mut self, body: Bytes) -> Self {
        self.short_circuit = Some(body);
        self
    }

    pub fn drop(mut self) -> Self {
        self.drop = true;
        self
    }

    pub fn with_close_connection(mut self) -> Self {
        self.close_connection = true;
        self
    }

    pub fn build(self) -> Result<RequestFilterResult, FilterError> {
        let outcomes =
            usize::from(self.forward.is_some()) + usize::from(self.short_circuit.is_some()) + usize::from(self.drop);
        if outcomes > 1 {
            return Err(FilterError::MalformedResult(
                "forward, short-circuit and drop are mutually exclusive",
            ));
        }

        let disposition = match (self.forward, self.short_circuit) {
            (Some((header, body)), None) => RequestDisposition::Forward { header, body },
            (None, Some(body)) => RequestDisposition::ShortCircuit { body },
            _ if self.drop || self.close_connection => RequestDisposition::Drop,
            _ => return Err(FilterError::MalformedResult("no outcome configured")),
        };
        Ok(RequestFilterResult {
            disposition,
            close_connection: self.close_connection,
        })
    }
}

/// Incremental construction of a [`ResponseFilterResult`].
#[derive(Debug, Default)]
pub struct ResponseFilterResultBuilder {
    forward: Option<(ResponseHeader, Bytes)>,
    drop: bool,
    close_connection: bool,
}

impl ResponseFilterResultBuilder {
    pub fn forward(mut self, header: ResponseHeader, body: Bytes) -> Self {
        self.forward = Some((header, body));
        self
    }

    pub fn drop(mut self) -> Self {
        self.drop = true;
        self
    }

    pub fn with_close_connection(mut self) -> Self {
        self.close_connection = true;
        self
    }

    pub fn build(self) -> Result<ResponseFilterResult, FilterError> {
        let disposition = match (self.forward, self.drop) {
            (Some(_), true) => {
                return Err(FilterError::MalformedResult("forward and drop are mutually exclusive"))
            }
            (Some((header, body)), false) => ResponseDisposition::Forward { header, body },
            (None, _) if self.drop || self.close_connection => ResponseDisposition::Drop,
            (None, _) => return Err(FilterError::MalformedResult("no outcome configured")),
        };
        Ok(ResponseFilterResult {
            disposition,
            close_connection: self.close_connection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ApiKey;

    fn header() -> RequestHeader {
        RequestHeader::new(ApiKey::Metadata, 12, 1)
    }

    #[test]
    fn forward_and_short_circuit_together_is_malformed() {
        let err = RequestFilterResult::builder()
            .forward(header(), Bytes::new())
            .short_circuit_response(Bytes::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, FilterError::MalformedResult(_)));
    }

    #[test]
    fn empty_builder_is_malformed_unless_closing() {
        assert!(RequestFilterResult::builder().build().is_err());

        let close = RequestFilterResult::builder().with_close_connection().build().unwrap();
        assert_eq!(close.disposition, RequestDisposition::Drop);
        assert!(close.close_connection);

        assert!(ResponseFilterResult::builder().build().is_err());
    }

    #[test]
    fn short_circuit_can_close() {
        let result = RequestFilterResult::builder()
            .short_circuit_response(Bytes::from_static(b"denied"))
            .with_close_connection()
            .build()
            .unwrap();
        assert_eq!(
            result.disposition,
            RequestDisposition::ShortCircuit {
                body: Bytes::from_static(b"denied")
            }
        );
        assert!(result.close_connection);
    }

    #[test]
    fn response_forward_and_drop_is_malformed() {
        let err = ResponseFilterResult::builder()
            .forward(ResponseHeader { correlation_id: 1 }, Bytes::new())
            .drop()
            .build()
            .unwrap_err();
        assert!(matches!(err, FilterError::MalformedResult(_)));
    }
}
