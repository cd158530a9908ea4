//! Convenient re-exports for common usage.
//!
//! ```rust
//! use rollback_netplay::prelude::*;
//!
//! let config = NetplayConfig::rollback().with_role(Role::Client);
//! assert!(config.validate().is_ok());
//! assert!(IndexedFrame::new(1, 0) > IndexedFrame::new(0, 500));
//! ```
//!
//! # What's Included
//!
//! - **Sessions**: [`NetplaySession`], [`NetplayEvent`], [`SpectatorBroadcaster`]
//! - **Sync core**: [`SyncManager`], [`SyncState`], [`Phase`], [`InputTimeline`]
//! - **Host seams**: [`HostBindings`], [`MemoryAccessor`], [`Transport`], [`SpectatorTransport`]
//! - **Time and input**: [`IndexedFrame`], [`InputSample`], [`Player`], [`buttons`]
//! - **Networking**: [`ReliableChannel`], [`ChannelPacket`], [`NetplayMessage`], [`SpectatorMessage`]
//! - **Snapshots**: [`SnapshotStore`], [`RegionCatalog`], [`RegionDescriptor`]
//! - **Configuration**: [`NetplayConfig`], [`ChannelConfig`], [`SnapshotConfig`], [`Role`]
//! - **Errors**: [`NetplayError`]

// Sessions
pub use crate::sessions::netplay_session::{NetplayEvent, NetplaySession};
pub use crate::sessions::spectator_broadcaster::SpectatorBroadcaster;

// Sync core
pub use crate::input_timeline::InputTimeline;
pub use crate::sync_manager::{HostBindings, MenuConfirmState, Phase, SyncManager, SyncState};

// Seams to the host process
pub use crate::snapshot_store::region::MemoryAccessor;
pub use crate::{SpectatorTransport, Transport};

// Time and input
pub use crate::buttons;
pub use crate::{IndexedFrame, InputSample, Player};

// Networking
pub use crate::network::messages::{NetplayMessage, SpectatorMessage};
pub use crate::network::reliable_channel::{ChannelEvent, ChannelPacket, ReliableChannel};

// Snapshots
pub use crate::snapshot_store::region::{RegionCatalog, RegionDescriptor};
pub use crate::snapshot_store::SnapshotStore;

// Configuration
pub use crate::config::{ChannelConfig, NetplayConfig, Role, SnapshotConfig};

// Errors
pub use crate::NetplayError;
