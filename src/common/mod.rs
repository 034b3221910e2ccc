mod contact;
mod id;
pub mod messages;
mod routing_table;

pub use contact::*;
pub use id::*;
pub use routing_table::*;
