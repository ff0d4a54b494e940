//! Moves one logical message from one endpoint to the other.

use crate::endpoint::Endpoint;
use crate::error::RelayError;
use curvemux_common::wire::Frame;
use curvemux_common::Identity;
use tracing::trace;

/// What a single [`forward`] call moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Content frames written, not counting the routing frame.
    pub frames: u64,
    /// Content payload bytes written.
    pub bytes: u64,
}

/// Writes `route_to` as a routing frame, then the rest of the message being
/// read from `source`.
///
/// `first` is a content frame the caller already read; otherwise the first
/// content frame is read here. Frames keep their payloads and more-flags, and
/// the copy stops after the first frame without the more-flag.
///
/// # Errors
///
/// Fails if either endpoint goes away mid-message.
pub async fn forward(
    source: &mut Endpoint,
    destination: &mut Endpoint,
    route_to: &Identity,
    first: Option<Frame>,
) -> Result<RelayStats, RelayError> {
    destination.send_frame(route_to.to_frame()).await?;

    let mut stats = RelayStats::default();
    let mut frame = match first {
        Some(frame) => frame,
        None => source.recv_frame().await?,
    };
    loop {
        let more = frame.more;
        stats.frames += 1;
        stats.bytes += frame.len() as u64;
        trace!(
            from = source.name(),
            to = destination.name(),
            len = frame.len(),
            more,
            "frame"
        );
        destination.send_frame(frame).await?;
        if !more {
            return Ok(stats);
        }
        frame = source.recv_frame().await?;
    }
}
