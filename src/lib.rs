//! # ctlab
//!
//! Client library for c't-Lab style instrument modules sharing one addressable
//! bus behind a TCP gateway. Each module has a bus id and numbered channels;
//! requests and responses are short ASCII lines.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: wire codec. Encodes `<module>:<payload>\r\n` requests and
//!   decodes `#<module>:<channel>=<value>[ comment]` responses.
//! - **`transport`**: byte-stream traits and the TCP connector.
//! - **`connection`**: the `Connection` that owns the transport, frames input
//!   into lines and dispatches them to registered modules. Supports a polling
//!   mode (callers drive reads) and an event-driven mode (a background task
//!   reads).
//! - **`registry`**: module id to module state lookup used by dispatch.
//! - **`module`**: the generic `Module` with its channel cache, freshness
//!   tracking and the `req`/`set`/`wait_updated`/`query` primitives.
//! - **`waiters`**: one-shot waiters for event-driven queries.
//! - **`calibration`**: offset/scale calibration channels and the EEPROM
//!   write-enable gate.
//! - **`profiles`**: typed device profiles (DCG source/sink, ADA-IO breakout,
//!   EDL electronic load).
//! - **`discovery`**: bus identity scan.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`mock_stream`**: in-memory transport with a scripted module side, for tests.
//! - **`error`**: the `CtlabError` taxonomy.
//!
//! ## Example
//!
//! ```no_run
//! use ctlab::{profiles::RegulatedSource, Connection};
//!
//! # async fn run() -> ctlab::CtlabResult<()> {
//! let connection = Connection::tcp("ct-lab", 10001);
//! connection.connect().await?;
//!
//! let dcg = RegulatedSource::new(1, &connection)?;
//! dcg.set_voltage(10.0).await?;
//! let volts = dcg.query_measured_voltage().await?;
//! println!("output at {volts} V");
//!
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod mock_stream;
pub mod module;
pub mod profiles;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod waiters;

pub use calibration::CalibrationQuantity;
pub use connection::{Connection, ConnectionOptions, ConnectionState, DispatchMode};
pub use error::{CtlabError, CtlabResult, DecodeError};
pub use module::{ChannelDecoder, ChannelValue, Identity, Module, StatusWord};
pub use protocol::{InboundMessage, RawValue, WireValue};
pub use transport::{Connector, TcpConnector};
