//! Authoring-side command queue: at most one outstanding request/response
//! pair in flight. Commands that expect no response are fire-and-forget and
//! never block subsequent sends; a response-expecting command holds the
//! queue until its reply (matched by `requestId`) arrives.

use std::collections::VecDeque;

use anyhow::Result;
use serde_json::Value;

use crate::protocol::{EngineCommand, WsMessage, now_millis};

/// Seam over the actual wire so the queue logic is testable without a
/// socket.
pub trait Transport {
    fn transmit(&mut self, message: WsMessage<Value>) -> Result<()>;
}

struct QueuedCommand {
    msg_type: &'static str,
    payload: Value,
    expects_response: bool,
}

pub struct CommandQueue<T: Transport> {
    transport: T,
    next_request_id: u64,
    /// Request id of the command whose response is still outstanding.
    in_flight: Option<String>,
    backlog: VecDeque<QueuedCommand>,
}

impl<T: Transport> CommandQueue<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_request_id: 0,
            in_flight: None,
            backlog: VecDeque::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Enqueue a command. Transmits immediately unless a response is still
    /// outstanding.
    pub fn submit(&mut self, command: &EngineCommand) -> Result<()> {
        let queued = QueuedCommand {
            msg_type: command.wire_type(),
            payload: command.payload_value()?,
            expects_response: command.expects_response(),
        };
        self.backlog.push_back(queued);
        self.pump()
    }

    /// Feed a message received from the render side. Returns `true` when it
    /// was the response the queue was waiting for; unrelated one-way traffic
    /// (pings, broadcast errors) returns `false` and leaves the queue alone.
    pub fn handle_message(&mut self, message: &WsMessage<Value>) -> Result<bool> {
        let matched = match (&self.in_flight, &message.request_id) {
            (Some(waiting), Some(incoming)) => waiting == incoming,
            _ => false,
        };
        if matched {
            self.in_flight = None;
            self.pump()?;
        }
        Ok(matched)
    }

    /// Transmit backlog entries until one expects a response (send it too,
    /// then stop) or the backlog empties.
    fn pump(&mut self) -> Result<()> {
        while self.in_flight.is_none() {
            let Some(queued) = self.backlog.pop_front() else {
                break;
            };
            let request_id = queued.expects_response.then(|| {
                self.next_request_id += 1;
                format!("req-{}", self.next_request_id)
            });
            if let Some(id) = &request_id {
                self.in_flight = Some(id.clone());
            }
            self.transport.transmit(WsMessage {
                msg_type: queued.msg_type.to_string(),
                timestamp: now_millis(),
                request_id,
                payload: Some(queued.payload),
            })?;
        }
        Ok(())
    }
}
