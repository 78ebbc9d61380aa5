//! Shared-memory transport between an application processor and companion
//! cores (modem, Wi-Fi, sensor hubs) that map one physical window at
//! different virtual bases.
//!
//! Everything rides on a pair of fixed-size message rings (the control
//! layer); bulk data moves through per-channel block layouts carved out of
//! the window by the host:
//!
//! ```text
//!  host endpoint                 shared window                peer endpoint
//! +------------+    +----------------------------------+    +------------+
//! | control    |<-->| message rings (8-byte messages)  |<-->| control    |
//! | channels   |    +----------------------------------+    | channels   |
//! |  block     |    | per-channel layouts:             |    |  block     |
//! |  packet    |    |   ring/pool headers              |    |  packet    |
//! |  stream    |    |   descriptor arrays              |    |  stream    |
//! +------------+    |   block / byte storage           |    +------------+
//!       |           +----------------------------------+          |
//!       +------------------ doorbell (wakeup) ------------------- +
//! ```
//!
//! Addresses inside shared structures are expressed in the peer's view;
//! the host translates at the boundary. Every shared counter has exactly
//! one writer while both sides are alive, and descriptor writes are
//! published release/acquire so a consumer that observes a counter also
//! observes the descriptor behind it.
//!
//! Channels handshake over the control layer (OPEN, then CMD/DONE carrying
//! the layout base), survive peer reboots by rebuilding their pools from
//! the local ownership table, and hand payloads around as leased blocks:
//! get → send on one side, receive → release on the other.

pub mod block;
pub mod control;
pub mod doorbell;
pub mod error;
pub mod layout;
pub mod link;
pub mod packet;
pub mod region;
pub mod stream;
pub mod wait;

mod ring;

pub use block::{Block, BlockChannel, BlockConfig, ChannelEvent, EventHandler, Readiness};
pub use control::{ControlConfig, ControlIpc, Message, MsgKind};
pub use doorbell::{DirectDoorbell, Doorbell, NullDoorbell};
pub use error::{Error, Result};
pub use link::{pair, Endpoint, LinkConfig, Role};
pub use packet::{CacheSync, PacketChannel, PacketConfig};
pub use region::{AllocRecord, PoolAllocator, ShmView};
pub use stream::{StreamChannel, StreamConfig};
pub use wait::Wait;
