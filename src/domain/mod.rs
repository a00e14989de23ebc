//! Core domain entities and types

mod charge_point;
mod device;
mod error;
mod events;
mod session;

pub use charge_point::{ChargePoint, Connectivity, Evse, EvseState, EvseStatus};
pub use device::Device;
pub use error::{DomainError, DomainResult};
pub use events::{DeviceEvent, DeviceEventKind};
pub use session::{ChargingSession, MeterValue, NewSession, SessionStatus};
