pub mod codec;
pub mod events;
pub mod identity;
pub mod reading;
pub mod topics;

pub use codec::{ParseError, parse, range_warning};
pub use events::*;
pub use identity::*;
pub use reading::*;
