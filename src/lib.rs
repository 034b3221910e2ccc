#![doc = include_str!("../README.md")]

mod common;
mod dht;
pub mod rpc;
pub mod store;

pub use crate::common::{
    Bucket, BucketInsert, Contact, Distance, Id, InvalidId, RoutingTable, DEFAULT_K, ID_SIZE,
    MAX_DISTANCE,
};
pub use crate::dht::{Dht, DhtWasShutdown, Testnet};
pub use crate::rpc::{Config, Info, PutError, StoreReport};
pub use bytes::Bytes;
