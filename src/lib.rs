//! `openscale-ble` library.
//!
//! Protocol handlers for body-composition Bluetooth scales and the adapters
//! that drive them over GATT, advertisements or classic serial links.
//!
//! The binary (`src/main.rs`) is responsible for logging setup and process exit
//! codes. The session flow lives in [`crate::app`] where it can be tested
//! deterministically with injected links and output streams.

pub mod advertisement;
pub mod app;
pub mod calc;
pub mod codec;
pub mod driver;
pub mod event;
pub mod factory;
pub mod handler;
pub mod link;
pub mod mac_address;
pub mod measurement;
pub mod s400;
pub mod settings;
pub mod transport;
pub mod tuning;
pub mod user;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::ScannedDeviceInfo;
pub use event::{BluetoothEvent, EventStream, InteractionData, InteractionFeedback, InteractionKind};
pub use factory::ScaleFactory;
pub use handler::{HandlerError, ScaleDeviceHandler};
pub use link::{Backend, LinkError, Links};
pub use mac_address::MacAddress;
pub use measurement::ScaleMeasurement;
pub use settings::{JsonFileStore, MemoryStore, PreferenceStore};
pub use transport::{AdapterEnv, Communicator};
pub use tuning::TuningProfile;
pub use user::ScaleUser;
