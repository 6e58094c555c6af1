pub mod command;
pub mod config;
pub mod constants;
pub mod databuf;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod reply;
pub mod session;
pub mod spectrum;
pub mod transport;


// Re-export the client and the types its methods deal in
pub use command::{AlertControl, DisplayDirection, Language, Vsfr};
pub use config::ClientConfig;
pub use databuf::{DataBuffer, DataRecord, DeviceEvent, EventKind, RareData, RealTimeSample, SampleKind};
pub use device::RadiaCode;
pub use error::{DecodeError, Error, FrameError};
pub use session::{AccumulatedDose, DeviceInfo, EventBatch, EventCursor, SessionState};
pub use spectrum::{EnergyCalibration, Spectrum};
pub use transport::{Channel, Target, Transport};
