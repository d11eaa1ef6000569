//! Plan B / Unified Plan translation seam

use super::{IceCandidate, SessionDescription};
use crate::Result;

/// Pure SDP transform between Plan B and Unified Plan
///
/// When a translator is installed, outgoing candidates and local
/// descriptions handed to the application are converted to Unified Plan,
/// while remote descriptions and incoming candidates are converted to
/// Plan B before they reach the connection.
pub trait SdpTranslator: Send + Sync {
    fn candidate_to_unified_plan(&self, candidate: &IceCandidate) -> Result<IceCandidate>;

    fn candidate_to_plan_b(&self, candidate: &IceCandidate) -> Result<IceCandidate>;

    fn to_unified_plan(&self, description: &SessionDescription) -> Result<SessionDescription>;

    fn to_plan_b(&self, description: &SessionDescription) -> Result<SessionDescription>;
}
