//! Request dispatch for the relay runtime.
//!
//! Drives the per-connection framing state machine over raw byte buffers
//! and executes commands against the store. Payload reads never block: a
//! command that needs more bytes leaves a `PendingPayload` behind and the
//! event loop resumes it on the next readiness event.

use crate::protocol::{take_line, take_payload, Command, Parser, ProtocolError, Response};
use crate::storage::Store;
use bytes::{Bytes, BytesMut};
use tracing::trace;

/// What a pending payload will be stored as once complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadTarget {
    /// Body of a `put`
    Message { user: String, subject: String },
    /// Key of a `store_key`
    Key { user: String },
}

/// A command waiting for its declared payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayload {
    pub target: PayloadTarget,
    pub length: usize,
}

impl PendingPayload {
    /// Error reported when the peer closes before the payload arrives.
    pub fn incomplete_error(&self) -> ProtocolError {
        match self.target {
            PayloadTarget::Message { .. } => ProtocolError::IncompleteMessage,
            PayloadTarget::Key { .. } => ProtocolError::IncompleteKey,
        }
    }
}

/// Result of dispatching one command line.
#[derive(Debug)]
pub enum Dispatch {
    /// Command finished; response bytes are ready.
    Reply(BytesMut),
    /// Command needs a payload before it can finish.
    AwaitPayload(PendingPayload),
}

/// Process every complete frame in `inbound`.
///
/// Responses are appended to `output` in frame order. Returns the number of
/// commands completed. Incomplete frames and partial payloads stay in
/// `inbound`, with `pending` recording a payload still being awaited.
pub fn process_inbound(
    inbound: &mut BytesMut,
    pending: &mut Option<PendingPayload>,
    store: &mut Store,
    output: &mut BytesMut,
) -> usize {
    let mut completed = 0;

    loop {
        if let Some(waiting) = pending.take() {
            match take_payload(inbound, waiting.length) {
                Some(payload) => {
                    output.extend_from_slice(&complete_payload(waiting, payload, store));
                    completed += 1;
                }
                None => {
                    *pending = Some(waiting);
                    break;
                }
            }
            continue;
        }

        let Some(line) = take_line(inbound) else {
            break;
        };

        match dispatch(&line, store) {
            Dispatch::Reply(response) => {
                output.extend_from_slice(&response);
                completed += 1;
            }
            Dispatch::AwaitPayload(waiting) => {
                trace!(length = waiting.length, "Awaiting payload");
                *pending = Some(waiting);
            }
        }
    }

    completed
}

/// Report a pending payload that can no longer be read.
///
/// Used when the peer closes mid-payload. Appends the matching error
/// response to `output` and clears the pending state.
pub fn abort_pending(pending: &mut Option<PendingPayload>, output: &mut BytesMut) -> bool {
    match pending.take() {
        Some(waiting) => {
            output.extend_from_slice(&Response::error(waiting.incomplete_error()));
            true
        }
        None => false,
    }
}

/// Parse and execute a single command line.
pub fn dispatch(line: &[u8], store: &mut Store) -> Dispatch {
    let command = match Parser::parse(line) {
        Ok(command) => command,
        Err(e) => {
            trace!(error = %e, "Rejected command");
            return Dispatch::Reply(Response::error(e));
        }
    };

    trace!(?command, "Processing command");

    match command {
        Command::Reset => {
            store.reset();
            Dispatch::Reply(BytesMut::from(Response::ok()))
        }

        Command::Put {
            user,
            subject,
            length,
        } => Dispatch::AwaitPayload(PendingPayload {
            target: PayloadTarget::Message { user, subject },
            length,
        }),

        Command::List { user } => Dispatch::Reply(Response::list(&store.list(&user))),

        Command::Get { user, index } => Dispatch::Reply(match store.get(&user, index) {
            Some(message) => Response::message(&message.subject, &message.body),
            None => Response::error(ProtocolError::NoSuchMessage),
        }),

        Command::StoreKey { user, length } => Dispatch::AwaitPayload(PendingPayload {
            target: PayloadTarget::Key { user },
            length,
        }),

        Command::GetKey { user } => Dispatch::Reply(match store.get_key(&user) {
            Some(key) => Response::key(key),
            None => Response::error(ProtocolError::UnknownUser),
        }),
    }
}

/// Finish a payload command once all of its bytes have arrived.
fn complete_payload(waiting: PendingPayload, payload: Bytes, store: &mut Store) -> BytesMut {
    match waiting.target {
        PayloadTarget::Message { user, subject } => {
            store.append(&user, &subject, payload);
        }
        PayloadTarget::Key { user } => {
            store.set_key(&user, payload);
        }
    }
    BytesMut::from(Response::ok())
}
