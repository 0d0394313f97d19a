//! fl0w Protocol - Wire protocol for relay communication
//!
//! This crate provides the message envelope and payload types exchanged
//! between the relay and its peers (editors, controllers, web observers).

pub mod envelope;
pub mod payload;
pub mod sync;

pub use envelope::{routes, Envelope, ProtocolError, MAX_MESSAGE_SIZE};
pub use payload::{
    parse_hostname_set, std_stream, ControlCommand, InfoReply, InterestOp, PeersRequest, Roster,
    RosterEntry, SensorReadings, SensorRequest, SubscribeRequest, SubscriptionOp, WhoAmIReply,
};
pub use sync::{FileContent, ListedFile, SyncMessage};
