pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod health;
pub mod history;
pub mod registry;
pub mod reliability;
pub mod routing;
pub mod shutdown;
pub mod transport;

pub use error::{FleetError, Result};
pub use fleet::FleetManager;
