pub mod apply;
pub mod capture;
pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod datastore;
pub mod engine;
pub mod error;
pub mod event;
pub mod mapping;
pub mod metrics;
pub mod retry;
pub mod subscription;

pub mod kafka;
pub mod postgres;

pub use apply::{ApplyEngine, ApplyMode, ConflictResolver, DeadLetterRecord, OnError};
pub use capture::{CaptureEngine, CaptureMode};
pub use channel::Channel;
pub use checkpoint::Checkpoint;
pub use config::Config;
pub use datastore::{DatastoreDescriptor, DatastoreRegistry, MemoryDatastore};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use event::{ChangeEvent, ChangeOperation, Row, SequenceNumber, TableRef};
pub use mapping::{ConflictResolution, TableMapping};
pub use subscription::{SubscriptionHandle, SubscriptionState, SubscriptionStatus};
