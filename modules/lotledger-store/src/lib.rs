pub mod models;
pub mod writer;

pub use models::{
    AuctionEvent, ExternalIdentity, OutboundTask, ProvenanceEntry, QueueEntry, VehicleMutation,
    VehicleRecord,
};
pub use writer::LotWriter;
