use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};
use tracing::{debug, info, info_span, trace, Instrument};

use crate::{bridge::BridgeHandle, registry::Subscription};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(bridge): Extension<BridgeHandle>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("Client", %addr);

        handle_websocket(socket, bridge).instrument(span)
    })
}

/// Incoming messages are not requests of any kind,
/// we only read them to notice when the client leaves.
async fn read<S>(mut receiver: S)
where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                trace!(%text, "client sent text, ignoring");
            }
            Message::Binary(_) => {
                debug!("client sent binary data");
            }
            Message::Ping(_) => {
                debug!("socket ping");
            }
            Message::Pong(_) => {
                debug!("socket pong");
            }
            Message::Close(_) => {
                debug!("client disconnected");
                break;
            }
        }
    }
}

/// Every line becomes exactly one text frame, with the line's text as-is.
async fn write(mut sender: impl Sink<Message> + Unpin, mut subscription: Subscription) {
    while let Some(line) = subscription.recv().await {
        if sender
            .send(Message::Text(line.as_str().to_owned()))
            .await
            .is_err()
        {
            debug!("client disconnected");
            return;
        }
        trace!("Line flushed");
    }

    debug!("Subscription ended, closing socket");
    let _ = sender.send(Message::Close(None)).await;
}

pub(crate) async fn handle_websocket(websocket: WebSocket, bridge: BridgeHandle) {
    let (stream_sender, stream_receiver) = websocket.split();

    let subscription = bridge.subscribe();
    let id = subscription.id();
    info!(%id, "Client subscribed");

    let mut read_handle = tokio::spawn(read(stream_receiver).in_current_span());
    let mut write_handle = tokio::spawn(write(stream_sender, subscription).in_current_span());

    // Whichever side finishes first ends the session.
    tokio::select! {
        _ = &mut read_handle => {
            debug!("Read task joined");
            write_handle.abort();
        }
        _ = &mut write_handle => {
            debug!("Write task joined");
            read_handle.abort();
        }
    }

    bridge.unsubscribe(id);
    info!(%id, "Client unsubscribed");
}
