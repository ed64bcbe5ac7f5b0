//! Shared data and wire types for the tether session supervisor.
//!
//! Everything here is plain serde data: the credential envelope and its
//! metadata header, disconnect reasons and challenges emitted by the remote
//! service, the published [`ConnectionState`] snapshot, the JSON frames
//! exchanged with a relay bridge, and the control-socket messages.
//!
//! Behavior lives in `tether-runtime`; these types only change when a
//! persisted or wire format changes.

pub mod control;
pub mod credentials;
pub mod events;
pub mod identity;
pub mod options;
pub mod relay;
pub mod state;

pub use control::*;
pub use credentials::*;
pub use events::*;
pub use identity::*;
pub use options::*;
pub use relay::*;
pub use state::*;
