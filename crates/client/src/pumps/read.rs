//! WebSocket read pump: dispatches incoming messages.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use benchlink_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use benchlink_protocol::envelope::Message;
use benchlink_protocol::messages::EventPayload;

use crate::client::{EventSlot, Pending};

/// Reads messages from the WebSocket and dispatches them.
///
/// Responses complete the matching pending request; `event` messages go to
/// the event callback. Any incoming frame resets the pong deadline. When
/// the loop exits every pending request is dropped so its caller sees
/// [`ClientError::Closed`](crate::ClientError::Closed) right away.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: Pending,
    on_event: EventSlot,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &on_event).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => trace!("received pong"),
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    pending.lock().await.clear();
    cancel.cancel();
}

async fn handle_text_message(text: &str, pending: &Pending, on_event: &EventSlot) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    if let Some(tx) = pending.lock().await.remove(&msg.id) {
        let _ = tx.send(msg);
        return;
    }

    if msg.msg_type != MessageType::Event {
        debug!(msg_type = ?msg.msg_type, id = %msg.id, "response without a pending request");
        return;
    }

    let event = match msg.parse_payload::<EventPayload>() {
        Ok(Some(payload)) => payload.event,
        Ok(None) => {
            warn!(id = %msg.id, "event without payload");
            return;
        }
        Err(e) => {
            warn!("invalid event payload: {e}");
            return;
        }
    };

    match on_event.lock().await.as_ref() {
        Some(cb) => cb(&event),
        None => trace!(%event, "no event callback set, dropping event"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use futures_util::stream;
    use tokio::sync::{Mutex, oneshot};

    use super::*;
    use crate::client::EventCallback;

    fn pending() -> Pending {
        Arc::new(Mutex::new(HashMap::new()))
    }

    fn event_slot(cb: Option<EventCallback>) -> EventSlot {
        Arc::new(Mutex::new(cb))
    }

    fn event(text: &str) -> String {
        let msg = Message::new(
            "e1",
            MessageType::Event,
            Some(&EventPayload { event: text.into() }),
        )
        .unwrap();
        serde_json::to_string(&msg).unwrap()
    }

    #[tokio::test]
    async fn routes_response_to_pending() {
        let pending = pending();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let msg = Message::new::<()>("req-1", MessageType::Result, None).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        handle_text_message(&json, &pending, &event_slot(None)).await;

        let resp = rx.await.unwrap();
        assert_eq!(resp.id, "req-1");
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn fires_event_callback() {
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        let slot = event_slot(Some(Box::new(move |e: &str| {
            sink.lock().unwrap().push(e.to_string());
        })));

        handle_text_message(&event("SESSION LOCKED alice"), &pending(), &slot).await;
        handle_text_message(&event("POWER ON"), &pending(), &slot).await;

        assert_eq!(
            *received.lock().unwrap(),
            vec!["SESSION LOCKED alice".to_string(), "POWER ON".to_string()]
        );
    }

    #[tokio::test]
    async fn ignores_malformed_and_oversized_messages() {
        let slot = event_slot(None);
        handle_text_message("not valid json {{{", &pending(), &slot).await;
        let huge = "x".repeat(WS_MAX_MESSAGE_SIZE + 1);
        handle_text_message(&huge, &pending(), &slot).await;
    }

    #[tokio::test]
    async fn stream_end_drops_pending_requests() {
        let pending = pending();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let (write_tx, _write_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let read = stream::iter(Vec::<Result<tungstenite::Message, tungstenite::Error>>::new());
        read_pump(read, pending.clone(), event_slot(None), write_tx, cancel.clone()).await;

        assert!(rx.await.is_err());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn answers_pings() {
        let (write_tx, mut write_rx) = mpsc::channel(4);
        let read = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![1, 2].into()))]);
        read_pump(read, pending(), event_slot(None), write_tx, CancellationToken::new()).await;

        match write_rx.recv().await {
            Some(tungstenite::Message::Pong(data)) => assert_eq!(&data[..], &[1, 2]),
            other => panic!("expected pong, got {other:?}"),
        }
    }
}
