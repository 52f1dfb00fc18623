//! Struct and enum definitions of values in the Chatango model.

mod message;
pub use self::message::*;

mod user;
pub use self::user::*;
