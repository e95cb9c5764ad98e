//! # opsync Protocol
//!
//! Operation, batch and wire types shared by the opsync client engine and
//! the reference sync server.
//!
//! This crate provides:
//! - [`Operation`], the durable unit of client mutation
//! - [`OperationBatch`], the transport unit handed to a network port
//! - [`SyncResult`], the answer to a batch or a catch-up fetch
//! - Request/response wire shapes ([`SyncRequest`], [`SyncResponse`],
//!   [`OperationsResponse`])
//! - Push-channel frames ([`BroadcastEnvelope`], [`ServerFrame`])
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod channel;
mod error;
mod operation;
mod result;
mod wire;

pub use batch::OperationBatch;
pub use channel::{
    BroadcastEnvelope, BroadcastPayload, OperationAck, OperationRejection, ServerFrame,
    OPERATION_BROADCAST,
};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{Operation, OperationId, BASE_LAYER_ID, DEFAULT_TIMELINE_ID};
pub use result::SyncResult;
pub use wire::{
    from_json, temp_id, to_json, OperationsResponse, SyncRequest, SyncResponse, WireId,
    WireOperation, TEMP_ID_PREFIX,
};
