//! The per-connection filter chain dispatcher.

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesOrdered, FuturesUnordered};
use futures_util::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::correlation::{CorrelationManager, PendingRequest, Recipient};
use crate::dispatch::sequencer::ResponseSequencer;
use crate::filter::context::OutOfBandRequest;
use crate::filter::{ConnectionInfo, Filter, FilterContext, FilterError, RequestDisposition, ResponseDisposition};
use crate::frame::{RawResponse, RequestFrame, ResponseFrame, ResponseHeader};
use crate::observability::metrics;

/// Error type for a dispatcher run; every variant is fatal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("filter '{filter}' failed: {source}")]
    Filter {
        filter: String,
        #[source]
        source: FilterError,
    },

    #[error("upstream response carries unknown correlation id {0}")]
    UnknownCorrelationId(u32),
}

impl DispatchError {
    fn filter(filter: &Filter, source: FilterError) -> Self {
        metrics::record_filter_error(filter.name());
        DispatchError::Filter {
            filter: filter.name().to_string(),
            source,
        }
    }
}

/// Why a dispatcher run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    UpstreamDisconnected,
    /// A filter result asked for the connection to be closed.
    FilterRequested,
}

/// Tuning for one dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Client requests allowed in the pipeline before reading pauses.
    pub max_in_flight_frames: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_in_flight_frames: 256,
        }
    }
}

/// Decoded frame source and sink for both sides of a connection.
pub struct FrameChannels {
    pub from_client: mpsc::Receiver<RequestFrame>,
    pub to_client: mpsc::Sender<ResponseFrame>,
    pub to_upstream: mpsc::Sender<RequestFrame>,
    pub from_upstream: mpsc::Receiver<RawResponse>,
}

/// Filters of one connection together with their contexts.
struct Chain {
    filters: Vec<Filter>,
    contexts: Vec<FilterContext>,
}

impl Chain {
    fn new(filters: Vec<Filter>, connection: &Arc<ConnectionInfo>, out_of_band: mpsc::UnboundedSender<OutOfBandRequest>) -> Self {
        let contexts = filters
            .iter()
            .enumerate()
            .map(|(index, filter)| {
                FilterContext::new(index, filter.shared_name(), Arc::clone(connection), out_of_band.clone())
            })
            .collect();
        Self { filters, contexts }
    }

    fn len(&self) -> usize {
        self.filters.len()
    }
}

enum RequestOutcome {
    Forward { frame: RequestFrame, close: bool },
    Respond { response: Option<ResponseFrame>, close: bool },
    Dropped { close: bool },
}

struct ResponseOutcome {
    response: Option<ResponseFrame>,
    close: bool,
}

/// Walk request handlers from `start` towards the upstream.
///
/// A short-circuit at filter `k` sends the synthesized response back through
/// the response handlers of filters `start..k`, nearest first.
async fn run_request_chain(chain: Arc<Chain>, frame: RequestFrame, start: usize) -> Result<RequestOutcome, DispatchError> {
    let original_correlation_id = frame.header.correlation_id;
    let has_response = frame.has_response;
    let RequestFrame { mut header, mut body, .. } = frame;
    let mut close = false;

    for index in start..chain.len() {
        let filter = &chain.filters[index];
        let Some(handler) = filter.request_handler(header.api_key, header.api_version) else {
            continue;
        };
        let (api_key, api_version) = (header.api_key, header.api_version);
        let result = handler
            .on_request(header, body, chain.contexts[index].clone())
            .await
            .map_err(|source| DispatchError::filter(filter, source))?;
        close |= result.close_connection;

        match result.disposition {
            RequestDisposition::Forward { header: next_header, body: next_body } => {
                header = next_header;
                body = next_body;
            }
            RequestDisposition::Drop => {
                metrics::record_frame("request", "drop");
                return Ok(RequestOutcome::Dropped { close });
            }
            RequestDisposition::ShortCircuit { body } => {
                metrics::record_frame("request", "short_circuit");
                let response = ResponseFrame {
                    api_key,
                    api_version,
                    header: ResponseHeader {
                        correlation_id: original_correlation_id,
                    },
                    body,
                };
                let outcome =
                    run_response_chain(Arc::clone(&chain), response, start, index, ResponseOrigin::ShortCircuit).await?;
                return Ok(RequestOutcome::Respond {
                    response: outcome.response,
                    close: close || outcome.close,
                });
            }
        }
    }

    metrics::record_frame("request", "forward");
    Ok(RequestOutcome::Forward {
        frame: RequestFrame {
            header,
            body,
            has_response,
        },
        close,
    })
}

/// Where a response entering the response chain came from.
#[derive(Clone, Copy)]
enum ResponseOrigin {
    Upstream,
    ShortCircuit,
}

impl ResponseOrigin {
    fn disposition(self) -> &'static str {
        match self {
            ResponseOrigin::Upstream => "forward",
            ResponseOrigin::ShortCircuit => "synthesized",
        }
    }
}

/// Walk response handlers of filters `floor..end`, nearest the upstream first.
async fn run_response_chain(
    chain: Arc<Chain>,
    frame: ResponseFrame,
    floor: usize,
    end: usize,
    origin: ResponseOrigin,
) -> Result<ResponseOutcome, DispatchError> {
    let ResponseFrame {
        api_key,
        api_version,
        mut header,
        mut body,
    } = frame;
    let mut close = false;

    for index in (floor..end).rev() {
        let filter = &chain.filters[index];
        let Some(handler) = filter.response_handler(api_key, api_version) else {
            continue;
        };
        let result = handler
            .on_response(header, body, chain.contexts[index].clone())
            .await
            .map_err(|source| DispatchError::filter(filter, source))?;
        close |= result.close_connection;

        match result.disposition {
            ResponseDisposition::Forward { header: next_header, body: next_body } => {
                header = next_header;
                body = next_body;
            }
            ResponseDisposition::Drop => {
                metrics::record_frame("response", "drop");
                return Ok(ResponseOutcome { response: None, close });
            }
        }
    }

    metrics::record_frame("response", origin.disposition());
    Ok(ResponseOutcome {
        response: Some(ResponseFrame {
            api_key,
            api_version,
            header,
            body,
        }),
        close,
    })
}

/// Outgoing side of a connection: correlation, response ordering, writes.
struct Realizer {
    correlation: CorrelationManager,
    sequencer: ResponseSequencer,
    to_client: mpsc::Sender<ResponseFrame>,
    to_upstream: mpsc::Sender<RequestFrame>,
}

impl Realizer {
    /// Write a request upstream under a fresh upstream correlation id.
    async fn forward_upstream(&mut self, mut frame: RequestFrame, recipient: Option<Recipient>) -> Result<(), CloseReason> {
        let upstream_id = match recipient {
            Some(recipient) => self.correlation.register(PendingRequest {
                downstream_correlation_id: frame.header.correlation_id,
                api_key: frame.header.api_key,
                api_version: frame.header.api_version,
                recipient,
            }),
            None => self.correlation.allocate(),
        };
        frame.header.correlation_id = upstream_id;
        self.to_upstream
            .send(frame)
            .await
            .map_err(|_| CloseReason::UpstreamDisconnected)
    }

    /// Fill a response slot and flush whatever became deliverable.
    async fn respond(&mut self, slot: u64, response: Option<ResponseFrame>) -> Result<(), CloseReason> {
        self.sequencer.fill(slot, response);
        for frame in self.sequencer.drain_ready() {
            self.to_client
                .send(frame)
                .await
                .map_err(|_| CloseReason::ClientDisconnected)?;
        }
        Ok(())
    }

    /// Returns the flush bound to close at, if the outcome asked to close.
    async fn realize_client_request(
        &mut self,
        ticket: &ClientTicket,
        outcome: RequestOutcome,
    ) -> Result<Option<u64>, CloseReason> {
        match outcome {
            RequestOutcome::Forward { frame, close } => {
                let recipient = ticket.slot.map(|slot| Recipient::Client { slot });
                self.forward_upstream(frame, recipient).await?;
                // the forwarded request's own response is not waited for
                Ok(close.then_some(ticket.preceding))
            }
            RequestOutcome::Respond { response, close } => {
                // a request that expects no response has no slot to answer into
                if let Some(slot) = ticket.slot {
                    self.respond(slot, response).await?;
                }
                Ok(close.then(|| ticket.settled()))
            }
            RequestOutcome::Dropped { close } => {
                if let Some(slot) = ticket.slot {
                    self.respond(slot, None).await?;
                }
                Ok(close.then(|| ticket.settled()))
            }
        }
    }

    async fn realize_self_sent_request(
        &mut self,
        issuer: usize,
        promise: oneshot::Sender<Result<bytes::Bytes, FilterError>>,
        outcome: RequestOutcome,
    ) -> Result<bool, CloseReason> {
        match outcome {
            RequestOutcome::Forward { frame, close } => {
                let recipient = Recipient::Filter {
                    floor: issuer + 1,
                    promise,
                };
                self.forward_upstream(frame, Some(recipient)).await?;
                Ok(close)
            }
            RequestOutcome::Respond { response, close } => {
                let _ = promise.send(response.map(|r| r.body).ok_or(FilterError::ResponseDropped));
                Ok(close)
            }
            RequestOutcome::Dropped { close } => {
                let _ = promise.send(Err(FilterError::RequestDropped));
                Ok(close)
            }
        }
    }
}

/// Position of one client request in the connection's pipeline.
struct ClientTicket {
    /// Arrival order among client requests.
    seq: u64,
    slot: Option<u64>,
    /// Slots reserved before this request arrived.
    preceding: u64,
}

impl ClientTicket {
    /// Flush bound covering this request's own response.
    fn settled(&self) -> u64 {
        self.slot.map_or(self.preceding, |slot| slot + 1)
    }
}

/// A close that waits for earlier responses to reach the client.
#[derive(Clone, Copy)]
struct Closing {
    reason: CloseReason,
    /// Client requests with an arrival order below this are still realized.
    admit_until: u64,
    /// Close once this many slots have been flushed.
    flush_to: u64,
}

impl Closing {
    /// Keep whichever close comes first in the pipeline.
    fn merge(current: Option<Closing>, next: Closing) -> Option<Closing> {
        match current {
            Some(current) if current.admit_until <= next.admit_until => Some(current),
            _ => Some(next),
        }
    }
}

type ClientRequestFuture = BoxFuture<'static, Result<(ClientTicket, RequestOutcome), DispatchError>>;
type SelfSentRequestFuture = BoxFuture<
    'static,
    Result<(usize, oneshot::Sender<Result<bytes::Bytes, FilterError>>, RequestOutcome), DispatchError>,
>;
type ClientResponseFuture = BoxFuture<'static, Result<(u64, ResponseOutcome), DispatchError>>;
type SelfSentResponseFuture = BoxFuture<'static, Result<bool, DispatchError>>;

/// Drives an ordered filter chain over every frame of one connection.
pub struct FilterHandler {
    filters: Vec<Filter>,
    connection: Arc<ConnectionInfo>,
    settings: DispatchSettings,
}

impl FilterHandler {
    pub fn new(filters: Vec<Filter>, connection: Arc<ConnectionInfo>, settings: DispatchSettings) -> Self {
        Self {
            filters,
            connection,
            settings,
        }
    }

    /// Run until either side closes, a filter asks to close, or a filter fails.
    ///
    /// A requested close, or client EOF, stops reading new requests but first
    /// delivers the responses owed for requests ahead of it.
    ///
    /// Dropping the returned future aborts all outstanding filter work; pending
    /// self-sent requests then observe [`FilterError::ConnectionClosed`].
    pub async fn run(self, channels: FrameChannels) -> Result<CloseReason, DispatchError> {
        let FrameChannels {
            mut from_client,
            to_client,
            to_upstream,
            mut from_upstream,
        } = channels;
        let (out_of_band_tx, mut out_of_band_rx) = mpsc::unbounded_channel();
        let chain = Arc::new(Chain::new(self.filters, &self.connection, out_of_band_tx));
        let max_in_flight = self.settings.max_in_flight_frames.max(1);

        let mut realizer = Realizer {
            correlation: CorrelationManager::default(),
            sequencer: ResponseSequencer::default(),
            to_client,
            to_upstream,
        };
        let mut client_requests: FuturesOrdered<ClientRequestFuture> = FuturesOrdered::new();
        let mut self_sent_requests: FuturesOrdered<SelfSentRequestFuture> = FuturesOrdered::new();
        let mut client_responses: FuturesOrdered<ClientResponseFuture> = FuturesOrdered::new();
        let mut self_sent_responses: FuturesUnordered<SelfSentResponseFuture> = FuturesUnordered::new();

        tracing::debug!(channel = %self.connection, filters = chain.len(), "Filter chain attached");

        let mut next_seq = 0u64;
        // pipeline position reached by realized client requests
        let mut realized_seq = 0u64;
        let mut realized_flush = 0u64;
        let mut closing: Option<Closing> = None;

        let result = loop {
            if let Some(close) = closing {
                if realizer.sequencer.flushed() >= close.flush_to {
                    break Ok(close.reason);
                }
            }
            let accepting = closing.is_none()
                && client_requests.len() < max_in_flight
                && realizer.sequencer.outstanding() < max_in_flight;

            tokio::select! {
                frame = from_client.recv(), if accepting => {
                    let Some(frame) = frame else {
                        // answer what was already read before giving up
                        closing = Closing::merge(closing, Closing {
                            reason: CloseReason::ClientDisconnected,
                            admit_until: next_seq,
                            flush_to: realizer.sequencer.next_slot(),
                        });
                        continue;
                    };
                    let preceding = realizer.sequencer.next_slot();
                    let ticket = ClientTicket {
                        seq: next_seq,
                        slot: frame.has_response.then(|| realizer.sequencer.reserve()),
                        preceding,
                    };
                    next_seq += 1;
                    let chain = Arc::clone(&chain);
                    client_requests.push_back(
                        run_request_chain(chain, frame, 0).map(move |r| r.map(|o| (ticket, o))).boxed(),
                    );
                }
                Some(outcome) = client_requests.next() => {
                    let (ticket, outcome) = match outcome {
                        Ok(realized) => realized,
                        Err(e) => break Err(e),
                    };
                    if closing.is_some_and(|close| ticket.seq >= close.admit_until) {
                        continue;
                    }
                    match realizer.realize_client_request(&ticket, outcome).await {
                        Ok(None) => {}
                        Ok(Some(flush_to)) => {
                            closing = Closing::merge(closing, Closing {
                                reason: CloseReason::FilterRequested,
                                admit_until: ticket.seq + 1,
                                flush_to,
                            });
                        }
                        Err(reason) => break Ok(reason),
                    }
                    realized_seq = ticket.seq + 1;
                    realized_flush = realized_flush.max(ticket.settled());
                }
                Some(request) = out_of_band_rx.recv() => {
                    let OutOfBandRequest { issuer, frame, promise } = request;
                    let chain = Arc::clone(&chain);
                    self_sent_requests.push_back(
                        run_request_chain(chain, frame, issuer + 1)
                            .map(move |r| r.map(|o| (issuer, promise, o)))
                            .boxed(),
                    );
                }
                Some(outcome) = self_sent_requests.next() => {
                    let (issuer, promise, outcome) = match outcome {
                        Ok(realized) => realized,
                        Err(e) => break Err(e),
                    };
                    match realizer.realize_self_sent_request(issuer, promise, outcome).await {
                        Ok(false) => {}
                        Ok(true) => {
                            closing = Closing::merge(closing, Closing {
                                reason: CloseReason::FilterRequested,
                                admit_until: realized_seq,
                                flush_to: realized_flush,
                            });
                        }
                        Err(reason) => break Ok(reason),
                    }
                }
                raw = from_upstream.recv() => {
                    let Some(raw) = raw else {
                        break Ok(CloseReason::UpstreamDisconnected);
                    };
                    let Some(pending) = realizer.correlation.take(raw.correlation_id) else {
                        break Err(DispatchError::UnknownCorrelationId(raw.correlation_id));
                    };
                    let frame = ResponseFrame {
                        api_key: pending.api_key,
                        api_version: pending.api_version,
                        header: ResponseHeader { correlation_id: pending.downstream_correlation_id },
                        body: raw.body,
                    };
                    let end = chain.len();
                    let chain = Arc::clone(&chain);
                    match pending.recipient {
                        Recipient::Client { slot } => client_responses.push_back(
                            run_response_chain(chain, frame, 0, end, ResponseOrigin::Upstream)
                                .map(move |r| r.map(|o| (slot, o)))
                                .boxed(),
                        ),
                        Recipient::Filter { floor, promise } => self_sent_responses.push(
                            async move {
                                let outcome = run_response_chain(chain, frame, floor, end, ResponseOrigin::Upstream).await?;
                                let _ = promise.send(outcome.response.map(|r| r.body).ok_or(FilterError::ResponseDropped));
                                Ok(outcome.close)
                            }
                            .boxed(),
                        ),
                    }
                }
                Some(outcome) = client_responses.next() => {
                    let (slot, outcome) = match outcome {
                        Ok(realized) => realized,
                        Err(e) => break Err(e),
                    };
                    if let Err(reason) = realizer.respond(slot, outcome.response).await {
                        break Ok(reason);
                    }
                    if outcome.close {
                        closing = Closing::merge(closing, Closing {
                            reason: CloseReason::FilterRequested,
                            admit_until: realized_seq,
                            flush_to: slot + 1,
                        });
                    }
                }
                Some(outcome) = self_sent_responses.next() => {
                    match outcome {
                        Ok(false) => {}
                        Ok(true) => {
                            closing = Closing::merge(closing, Closing {
                                reason: CloseReason::FilterRequested,
                                admit_until: realized_seq,
                                flush_to: realized_flush,
                            });
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        realizer.correlation.fail_all();
        match &result {
            Ok(reason) => tracing::debug!(channel = %self.connection, reason = ?reason, "Filter chain detached"),
            Err(e) => tracing::warn!(channel = %self.connection, error = %e, "Closing connection after dispatch failure"),
        }
        result
    }
}
