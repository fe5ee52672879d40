//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the device logic (sessions, power, storage, USB,
//! console) while the server framework handles connection management and
//! routing.

use std::future::Future;
use std::pin::Pin;

use benchlink_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use benchlink_protocol::envelope::Message;

use crate::connection::{ClientMeta, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling WebSocket requests from clients.
///
/// The server routes every request to one entry point per request group;
/// the handler matches on `msg.msg_type` within the group. Each method
/// receives:
/// - `sender`: channel to reply to the requesting client
/// - `msg`: the parsed JSON envelope
///
/// Default implementations reply with "not implemented" so handlers only
/// need to override the groups their device supports.
pub trait Handler: Send + Sync + 'static {
    /// Called once the WebSocket upgrade succeeded.
    fn on_client_connected(&self, sender: Sender, meta: ClientMeta) -> HandlerFuture<'_> {
        let _ = (sender, meta);
        Box::pin(async {})
    }

    /// Called when a client disconnects (cleanup hook).
    fn on_client_disconnected(&self, meta: ClientMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }

    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) =
                msg.reply(benchlink_protocol::MessageType::Pong, Option::<&()>::None)
            {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `get_info`.
    fn on_get_info(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `session_*` requests.
    fn on_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `target_*` and `power_locked` requests.
    fn on_target(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `storage_*` requests.
    fn on_storage(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `usb_*` requests.
    fn on_usb(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `console_*` requests.
    fn on_console(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }
}

fn not_implemented<'a>(sender: Sender, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}
