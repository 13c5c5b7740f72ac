//! Background task that reads frames off the channel and hands envelopes to
//! the multiplexer.

use crate::messages::types::INVALID_CORRELATION_ID;
use crate::messages::wire::{DecodedFrame, FramedMessage};
use crate::network::error::EngineError;
use crate::network::multiplexer::RequestMultiplexer;
use crate::network::transport::FrameReader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the receive loop stopped
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    /// Stopped by its owner
    Cancelled,
    /// Peer closed the stream cleanly between frames
    PeerClosed,
    /// Channel broke; every pending request was failed with this error
    ChannelFailed(EngineError),
}

/// Run until cancelled or the channel closes
pub async fn run(
    mut reader: FrameReader,
    codec: FramedMessage,
    mux: Arc<RequestMultiplexer>,
    cancel: CancellationToken,
) -> LoopExit {
    debug!("Receive loop started");

    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break LoopExit::Cancelled,
            frame = codec.read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(frame)) => dispatch(&codec, &mux, &frame),
            Ok(None) => {
                info!(
                    pending = mux.pending_count(),
                    "Backend closed the connection"
                );
                mux.mark_closed();
                break LoopExit::PeerClosed;
            }
            Err(e) => {
                // Framing is lost once a length prefix is wrong or the stream
                // breaks mid-frame, so nothing after this point can be trusted.
                let error = EngineError::connection_lost(&e);
                warn!(error = %e, "Receive loop failed, closing connection");
                mux.fail_all(error.clone());
                break LoopExit::ChannelFailed(error);
            }
        }
    };

    debug!(exit = ?exit, "Receive loop ended");
    exit
}

fn dispatch(codec: &FramedMessage, mux: &RequestMultiplexer, frame: &[u8]) {
    let envelope = match codec.decode(frame) {
        Ok(DecodedFrame::Envelope(envelope)) => envelope,
        Ok(DecodedFrame::UnknownTag {
            correlation_id,
            tag,
        }) => {
            warn!(
                correlation_id,
                tag = format_args!("{:#06x}", tag),
                "Discarding frame with unknown payload tag"
            );
            mux.discard();
            return;
        }
        Err(e) => {
            warn!(error = %e, size = frame.len(), "Discarding undecodable frame");
            mux.discard();
            return;
        }
    };

    if envelope.correlation_id() == INVALID_CORRELATION_ID {
        warn!(
            kind = envelope.payload().kind_name(),
            "Discarding frame with invalid correlation id"
        );
        mux.discard();
        return;
    }

    mux.resolve(envelope);
}
