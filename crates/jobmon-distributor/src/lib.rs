// Distributor: the scheduling loop that drives task instances from queued
// to terminal through a pluggable cluster adapter.

pub mod client;
pub mod distributor;
pub mod multiprocess;
pub mod plugin;
pub mod readiness;
pub mod scaling;

pub use client::ApiClient;
pub use distributor::Distributor;
pub use multiprocess::MultiprocessPlugin;
pub use plugin::{ArrayBatch, BatchInstance, ClusterPlugin, ClusterTaskState};
pub use readiness::{print_ready, wait_for_ready, READY_MARKER};
