//! # DAQ Property Library
//!
//! Declarative instrument drivers. A driver declares the values a device
//! exposes as [`Property`]s grouped in a tree of nodes; the library turns each
//! access into a read or write chain with checks, format extraction, type
//! casting, limits validation, retry on communication failures and a
//! per-node cache.
//!
//! ## Crate Structure
//!
//! - **`composer`**: Ordered, named pipeline stages per hook point.
//! - **`property`**: Property declaration, built-in stages and the read/write chains.
//! - **`customization`**: Logging of user changes to a property's pipelines and
//!   their replay onto a re-derived property.
//! - **`check`**: Compilation and evaluation of boolean check expressions.
//! - **`format`**: Extraction of a value out of a formatted device answer.
//! - **`limits`**: Range and step validation, with named limits memoized per node.
//! - **`node`**, **`subsystem`**, **`channel`**: The node tree, path addressing,
//!   cache operations and routing of device operations to the root.
//! - **`declaration`**: Class-level descriptions of node types.
//! - **`instrument`** and **`transport`**: The root node and its device session.
//! - **`config`**: TOML driver descriptions with environment overrides.
//! - **`mock`**: Simulated device for tests.
//! - **`error`**: [`PropertyError`] and its categories.
//!
//! ## Example
//!
//! ```
//! use daq_props::mock::mock_transport;
//! use daq_props::{InstrumentOptions, NodeDecl, NodeExt, PropertyConfig, ValueKind};
//!
//! let mut decl = NodeDecl::new();
//! decl.declare(
//!     "voltage",
//!     PropertyConfig::new()
//!         .with_getter("VOLT?")
//!         .with_setter("VOLT {value}")
//!         .with_kind(ValueKind::Float),
//! )
//! .unwrap();
//!
//! let (transport, device) = mock_transport();
//! let instrument = daq_props::Instrument::new(decl, transport, InstrumentOptions::default());
//! instrument.write("voltage", 2.5).unwrap();
//! assert_eq!(device.register("VOLT").as_deref(), Some("2.5"));
//! ```

pub mod alias;
pub mod channel;
pub mod check;
pub mod composer;
pub mod config;
pub mod customization;
pub mod declaration;
pub mod error;
pub mod format;
pub mod instrument;
pub mod limits;
pub mod mock;
pub mod node;
pub mod property;
pub mod subsystem;
pub mod transport;
pub mod value;

pub use channel::{Channel, ChannelContainer};
pub use composer::{Composer, HookPoint, Stage, WriteOutcome};
pub use config::{DriverConfig, InstrumentOptions};
pub use customization::Change;
pub use declaration::{ChannelDecl, NodeDecl};
pub use error::{PropertyError, Result, StructuralError, TransportError, TransportErrorKind};
pub use instrument::Instrument;
pub use limits::{LimitsSource, LimitsValidator};
pub use node::{CacheScope, CacheSnapshot, Node, NodeExt};
pub use property::{Checks, Property, PropertyConfig};
pub use subsystem::Subsystem;
pub use transport::Transport;
pub use value::{ChannelId, Value, ValueKind};
