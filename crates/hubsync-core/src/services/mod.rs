//! Services shared by every hubsync client

mod replica;

pub use replica::ReplicaService;
