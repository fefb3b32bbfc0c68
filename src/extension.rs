//! Frame transforms
//!
//! A transform rewrites data frames on their way in or out of a
//! [`DefaultWebSocketSession`](crate::DefaultWebSocketSession). Transforms are
//! installed once, when the session is started, and applied in installation
//! order in both directions. Control frames never pass through them.

use crate::error::Result;
use crate::frame::Frame;

/// A per-session rewrite of data frames
///
/// Both hooks default to the identity. Incoming transforms see whole,
/// reassembled messages.
pub trait FrameTransform: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Rewrite a frame received from the peer
    fn transform_incoming(&self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }

    /// Rewrite a frame before it is queued for the peer
    fn transform_outgoing(&self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }
}

pub(crate) fn apply_incoming(transforms: &[Box<dyn FrameTransform>], frame: Frame) -> Result<Frame> {
    transforms
        .iter()
        .try_fold(frame, |frame, t| t.transform_incoming(frame))
}

pub(crate) fn apply_outgoing(transforms: &[Box<dyn FrameTransform>], frame: Frame) -> Result<Frame> {
    transforms
        .iter()
        .try_fold(frame, |frame, t| t.transform_outgoing(frame))
}
