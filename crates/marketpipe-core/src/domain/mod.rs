pub mod bar;
pub mod symbol;
pub mod timestamp;

pub use bar::{BarRecord, BarStatus, Frame, Session, SCHEMA_VERSION};
pub use symbol::{Symbol, MAX_SYMBOL_LEN};
pub use timestamp::UtcDateTime;
