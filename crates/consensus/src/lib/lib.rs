pub mod bls;
pub mod chain_spec;
pub mod codec;
pub mod eth_spec;
pub mod fork_choice;
pub mod schema;
pub mod shuffling;
pub mod state;
pub mod testing;
pub mod transition;
pub mod tree;
pub mod types;
pub mod view;
