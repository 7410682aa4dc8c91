pub mod logging;
pub mod rendezvous_node;
