//! # scrapnet ring
//!
//! Chord-style identifier ring for the scrapnet scraping service.
//!
//! Every node is equal. A fresh node locates an existing member via a UDP
//! broadcast probe and joins the ring by asking that member for the
//! successor of its own identifier. From then on the stabilize,
//! fix-fingers and check-predecessor tasks keep the ring pointers and the
//! finger table converged under churn.
//!
//! ## Components
//!
//! - **Peer discovery**: UDP broadcast bootstrap and probe responders
//! - **Ring membership**: successor/predecessor pointers, finger table and
//!   the maintenance tasks
//! - **Overlay RPC**: the lookup/notify/ping surface peers call
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scrapnet_ring::{Discovery, RingConfig, RingNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RingConfig::default();
//!     let discovery = Discovery::new("192.168.1.10", &config);
//!     let node = Arc::new(RingNode::new("192.168.1.10", config)?);
//!
//!     let workers = node.start().await?;
//!     let contact = discovery.discover().await;
//!     node.join(contact.as_deref()).await?;
//!
//!     // ... serve until shutdown ...
//!     node.stop();
//!     workers.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod keyspace;
pub mod node;
pub mod rpc;

// Re-export main types
pub use config::RingConfig;
pub use discovery::Discovery;
pub use error::{RingError, RingResult};
pub use keyspace::{between, hash_key, KeyId, M};
pub use node::{NodeRef, RingNode, RingStatus, RingWorkers};
pub use rpc::Dialer;
